use thiserror::Error;

/// Boxed error type accepted from loader callbacks and codec internals.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by cache operations.
///
/// Loader failures keep the original error reachable through
/// [`std::error::Error::source`], so callers can downcast to whatever their
/// loader returned. Background failures (janitor, pub/sub, async reloads)
/// never reach callers; they go to the configured error sink instead.
#[derive(Debug, Error)]
pub enum CacheError {
    /// TTLs must be a positive whole number of seconds. Returned
    /// synchronously, before either tier is touched.
    #[error("illegal ttl, must be a positive whole number of seconds")]
    IllegalTtl,

    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis command error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("encode error: {0}")]
    Encode(#[source] BoxError),

    #[error("decode error: {0}")]
    Decode(#[source] BoxError),

    /// The caller-supplied loader returned an error.
    #[error("loader failed: {0}")]
    Loader(#[source] BoxError),

    /// The caller-supplied loader panicked. String panic payloads are
    /// preserved verbatim; anything else is reported generically.
    #[error("loader panicked: {0}")]
    LoaderPanic(String),

    #[error("pub/sub connection closed")]
    SubscribeClosed,
}

impl CacheError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn encode(err: impl Into<BoxError>) -> Self {
        Self::Encode(err.into())
    }

    pub(crate) fn decode(err: impl Into<BoxError>) -> Self {
        Self::Decode(err.into())
    }

    pub(crate) fn loader(err: BoxError) -> Self {
        Self::Loader(err)
    }

    /// Convert a finished task handle's failure into a cache error,
    /// recovering the panic payload when there is one.
    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = match payload.downcast::<String>() {
                Ok(s) => *s,
                Err(payload) => match payload.downcast::<&'static str>() {
                    Ok(s) => (*s).to_string(),
                    Err(_) => "non-string panic payload".to_string(),
                },
            };
            Self::LoaderPanic(message)
        } else {
            Self::LoaderPanic("task cancelled before completion".to_string())
        }
    }

    /// True for programmer errors that are reported without touching
    /// either tier.
    pub fn is_illegal_ttl(&self) -> bool {
        matches!(self, Self::IllegalTtl)
    }
}
