use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::{ErrorCode, HandlerError};
use crate::message::{CacheStatus, Query, QueryResponse, QueryResult};

/// Answers a query, typically by reading a projection.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle(&self, query: &Query) -> Result<QueryResponse, HandlerError>;
}

/// Caching for one query type.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,

    /// Pattern this query's cache entries are invalidated under,
    /// normally the id of the projection the handler reads. Entries
    /// without a declared pattern are dropped on every invalidation,
    /// since the dispatcher cannot tell which projection they read.
    pub invalidation_pattern: Option<String>,
}

impl CachePolicy {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            invalidation_pattern: None,
        }
    }

    pub fn invalidated_by(mut self, pattern: impl Into<String>) -> Self {
        self.invalidation_pattern = Some(pattern.into());
        self
    }
}

struct QueryRegistration {
    handler: Arc<dyn QueryHandler>,
    cache: Option<CachePolicy>,
    enabled: bool,
}

struct CacheEntry {
    result: QueryResult,
    pattern: Option<String>,
    cached_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn fresh(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Routes queries to registered handlers with optional TTL caching.
///
/// Cache keys combine the query type and its parameters, so distinct
/// parameter sets never share an entry. Entries expire by TTL and can
/// be invalidated eagerly by pattern when the backing projection
/// changes.
pub struct QueryDispatcher {
    registrations: RwLock<HashMap<String, QueryRegistration>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
}

impl QueryDispatcher {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Registers `handler` for `query_type` with caching at the
    /// dispatcher's default TTL and no declared invalidation pattern,
    /// so its entries drop on every invalidation.
    pub async fn register(&self, query_type: impl Into<String>, handler: Arc<dyn QueryHandler>) {
        let ttl = self.default_ttl;
        self.register_with(query_type, handler, Some(CachePolicy::ttl(ttl)))
            .await;
    }

    /// Registers `handler` with an explicit cache policy (`None`
    /// bypasses the cache), replacing any existing registration.
    pub async fn register_with(
        &self,
        query_type: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
        cache: Option<CachePolicy>,
    ) {
        let query_type = query_type.into();
        let mut registrations = self.registrations.write().await;
        if registrations
            .insert(
                query_type.clone(),
                QueryRegistration {
                    handler,
                    cache,
                    enabled: true,
                },
            )
            .is_some()
        {
            tracing::info!(query_type = %query_type, "query handler replaced");
        }
    }

    /// Toggles the handler for `query_type`. Returns false when no
    /// handler is registered.
    pub async fn set_enabled(&self, query_type: &str, enabled: bool) -> bool {
        let mut registrations = self.registrations.write().await;
        match registrations.get_mut(query_type) {
            Some(registration) => {
                registration.enabled = enabled;
                true
            }
            None => false,
        }
    }

    #[tracing::instrument(skip(self, query), fields(query_type = %query.query_type))]
    pub async fn execute(&self, query: Query) -> QueryResult {
        let registration = {
            let registrations = self.registrations.read().await;
            registrations
                .get(&query.query_type)
                .map(|r| (Arc::clone(&r.handler), r.cache.clone(), r.enabled))
        };

        let Some((handler, cache, enabled)) = registration else {
            return self.fail(
                &query,
                ErrorCode::NotFound,
                format!("no handler registered for '{}'", query.query_type),
            );
        };
        if !enabled {
            return self.fail(
                &query,
                ErrorCode::Disabled,
                format!("handler for '{}' is disabled", query.query_type),
            );
        }

        let key = cache
            .as_ref()
            .map(|_| format!("{}:{}", query.query_type, query.params));
        if let Some(key) = &key {
            let entries = self.cache.read().await;
            if let Some(entry) = entries.get(key)
                && entry.fresh()
            {
                metrics::counter!("query_cache_hits").increment(1);
                let mut result = entry.result.clone();
                result.cache_status = CacheStatus::Hit;
                return result;
            }
        }

        match handler.handle(&query).await {
            Ok(response) => {
                metrics::counter!("queries_executed").increment(1);
                let status = if cache.is_some() {
                    CacheStatus::Miss
                } else {
                    CacheStatus::Bypass
                };
                let result = QueryResult::ok(response, status);
                if let (Some(key), Some(policy)) = (key, cache) {
                    self.cache.write().await.insert(
                        key,
                        CacheEntry {
                            result: result.clone(),
                            pattern: policy.invalidation_pattern,
                            cached_at: Instant::now(),
                            ttl: policy.ttl,
                        },
                    );
                }
                result
            }
            Err(err) => self.fail(&query, err.code(), err.to_string()),
        }
    }

    /// Drops every cache entry declared under `pattern`, any whose key
    /// starts with it, and all entries that declared no pattern.
    /// Returns the number removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|key, entry| match &entry.pattern {
            Some(declared) => declared != pattern && !key.starts_with(pattern),
            None => false,
        });
        let removed = before - cache.len();
        if removed > 0 {
            tracing::debug!(pattern, removed, "query cache invalidated");
        }
        removed
    }

    /// Drops all cache entries.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }

    fn fail(&self, query: &Query, code: ErrorCode, message: impl Into<String>) -> QueryResult {
        let message = message.into();
        tracing::warn!(
            query_type = %query.query_type,
            code = %code,
            %message,
            "query failed"
        );
        metrics::counter!("queries_failed", "code" => code.as_str()).increment(1);
        QueryResult::failed(code, message)
    }
}
