//! Cache configuration and construction.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;

use crate::cache::Cache;
use crate::error::CacheError;
use crate::metrics::MetricSink;

/// Error sink: `(error)`. Required. Receives every background failure
/// (janitor, pub/sub, async reloads) and loader panics; called exactly once
/// per surfaced error.
pub type ErrorSink = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// What `get` does with an entry that is present but expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetPolicy {
    /// Return the stale value immediately and refresh in the background.
    #[default]
    ReturnExpired,
    /// Block until the loader has produced a fresh value.
    ReloadOnExpiry,
}

pub(crate) const DEFAULT_NAMESPACE: &str = "default";
pub(crate) const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_REDIS_TTL_FACTOR: u32 = 4;

/// Validated configuration, produced by [`CacheBuilder::build`].
pub(crate) struct CacheConfig {
    pub(crate) namespace: String,
    pub(crate) separator: String,
    pub(crate) clean_interval: Duration,
    pub(crate) redis_ttl_factor: u32,
    pub(crate) disabled: bool,
    pub(crate) get_policy: GetPolicy,
    pub(crate) pool: Pool,
    pub(crate) redis_url: String,
    pub(crate) on_metric: Option<MetricSink>,
    pub(crate) on_error: ErrorSink,
}

/// Builder for [`Cache`].
///
/// # Example
///
/// ```ignore
/// let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
///     .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
///
/// let cache = CacheBuilder::new()
///     .namespace("myapp")
///     .separator("#")
///     .pool(pool)
///     .redis_url("redis://127.0.0.1:6379")
///     .on_error(Arc::new(|err| tracing::error!(error = %err, "cache error")))
///     .build()?;
/// ```
#[derive(Default)]
pub struct CacheBuilder {
    namespace: Option<String>,
    separator: Option<String>,
    clean_interval: Option<Duration>,
    redis_ttl_factor: Option<u32>,
    disabled: bool,
    get_policy: Option<GetPolicy>,
    pool: Option<Pool>,
    redis_url: Option<String>,
    on_metric: Option<MetricSink>,
    on_error: Option<ErrorSink>,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for wire keys and the action channel. Defaults to `default`.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Divider between object type and id in user keys, e.g. `#` for keys
    /// like `user#42`. Required; drives per-type metric aggregation.
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    /// Memory janitor period. Minimum one second; defaults to ten.
    pub fn clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = Some(interval);
        self
    }

    /// Multiplier applied to the memory TTL to derive the Redis key TTL.
    /// Defaults to 4.
    pub fn redis_ttl_factor(mut self, factor: u32) -> Self {
        self.redis_ttl_factor = Some(factor);
        self
    }

    /// Bypass both tiers: `get` calls the loader every time.
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn get_policy(mut self, policy: GetPolicy) -> Self {
        self.get_policy = Some(policy);
        self
    }

    /// Connection pool used for every Redis command. Required.
    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Redis URL for the subscriber's dedicated connection. Required;
    /// pooled connections cannot SUBSCRIBE.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn on_metric(mut self, sink: MetricSink) -> Self {
        self.on_metric = Some(sink);
        self
    }

    /// Sink for background errors. Required.
    pub fn on_error(mut self, sink: ErrorSink) -> Self {
        self.on_error = Some(sink);
        self
    }

    /// Validate the configuration and start the cache, including its
    /// janitor and action subscriber.
    pub fn build(self) -> Result<Cache, CacheError> {
        let separator = self
            .separator
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CacheError::config("separator is required"))?;
        let on_error = self
            .on_error
            .ok_or_else(|| CacheError::config("on_error sink is required"))?;
        let pool = self
            .pool
            .ok_or_else(|| CacheError::config("redis pool is required"))?;
        let redis_url = self
            .redis_url
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CacheError::config("redis url is required"))?;

        let clean_interval = self.clean_interval.unwrap_or(DEFAULT_CLEAN_INTERVAL);
        if clean_interval < Duration::from_secs(1) {
            return Err(CacheError::config(
                "clean_interval must be at least one second",
            ));
        }
        let redis_ttl_factor = self.redis_ttl_factor.unwrap_or(DEFAULT_REDIS_TTL_FACTOR);
        if redis_ttl_factor == 0 {
            return Err(CacheError::config("redis_ttl_factor must be at least 1"));
        }

        let namespace = self
            .namespace
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok(Cache::start(CacheConfig {
            namespace,
            separator,
            clean_interval,
            redis_ttl_factor,
            disabled: self.disabled,
            get_policy: self.get_policy.unwrap_or_default(),
            pool,
            redis_url,
            on_metric: self.on_metric,
            on_error,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_pool() -> Pool {
        deadpool_redis::Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("pool config is static")
    }

    fn noop_errors() -> ErrorSink {
        Arc::new(|_err: &CacheError| {})
    }

    #[tokio::test]
    async fn test_separator_required() {
        let err = CacheBuilder::new()
            .pool(lazy_pool())
            .redis_url("redis://127.0.0.1:1")
            .on_error(noop_errors())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("separator"));
    }

    #[tokio::test]
    async fn test_on_error_required() {
        let err = CacheBuilder::new()
            .separator("#")
            .pool(lazy_pool())
            .redis_url("redis://127.0.0.1:1")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("on_error"));
    }

    #[tokio::test]
    async fn test_clean_interval_minimum() {
        let err = CacheBuilder::new()
            .separator("#")
            .pool(lazy_pool())
            .redis_url("redis://127.0.0.1:1")
            .on_error(noop_errors())
            .clean_interval(Duration::from_millis(200))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("clean_interval"));
    }

    #[tokio::test]
    async fn test_zero_ttl_factor_rejected() {
        let err = CacheBuilder::new()
            .separator("#")
            .pool(lazy_pool())
            .redis_url("redis://127.0.0.1:1")
            .on_error(noop_errors())
            .redis_ttl_factor(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("redis_ttl_factor"));
    }

    #[tokio::test]
    async fn test_minimal_build_succeeds() {
        let cache = CacheBuilder::new()
            .separator("#")
            .pool(lazy_pool())
            .redis_url("redis://127.0.0.1:1")
            .on_error(noop_errors())
            .build()
            .expect("defaults fill the rest");
        cache.shutdown().await;
    }
}
