//! Metric emission for cache operations.
//!
//! Every tier operation reports through a caller-supplied sink. Timed
//! metrics carry the elapsed duration of the operation they wrap; the two
//! gauge metrics ([`MetricType::Count`] and [`MetricType::MemUsage`]) carry
//! a count instead and always report a zero duration.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metric sink: `(key, object_type, metric_type, count, elapsed)`.
///
/// `key` has the cache namespace already stripped. `object_type` is the
/// first segment of the key when split at the configured separator, which
/// lets one sink aggregate per object type. `count` is populated only for
/// gauge metrics; `elapsed` only for timed ones.
pub type MetricSink = Arc<dyn Fn(&str, &str, MetricType, i64, Duration) + Send + Sync>;

/// The kinds of metric the cache emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    GetMemHit,
    GetMemMiss,
    GetMemExpired,
    GetRedisHit,
    GetRedisMiss,
    GetRedisExpired,
    GetCache,
    SetCache,
    SetMem,
    SetRedis,
    DelCache,
    DelMem,
    DelRedis,
    Load,
    AsyncLoad,
    Count,
    MemUsage,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetMemHit => "get_mem_hit",
            Self::GetMemMiss => "get_mem_miss",
            Self::GetMemExpired => "get_mem_expired",
            Self::GetRedisHit => "get_redis_hit",
            Self::GetRedisMiss => "get_redis_miss",
            Self::GetRedisExpired => "get_redis_expired",
            Self::GetCache => "get_cache",
            Self::SetCache => "set_cache",
            Self::SetMem => "set_mem",
            Self::SetRedis => "set_redis",
            Self::DelCache => "del_cache",
            Self::DelMem => "del_mem",
            Self::DelRedis => "del_redis",
            Self::Load => "load",
            Self::AsyncLoad => "async_load",
            Self::Count => "count",
            Self::MemUsage => "mem_usage",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared emitter handed to every tier. Holds the namespace prefix to trim
/// from wire keys and the separator used to derive the object type.
#[derive(Clone)]
pub(crate) struct Metrics {
    prefix: String,
    separator: String,
    sink: Option<MetricSink>,
}

impl Metrics {
    pub(crate) fn new(namespace: &str, separator: &str, sink: Option<MetricSink>) -> Self {
        Self {
            prefix: format!("{namespace}:"),
            separator: separator.to_string(),
            sink,
        }
    }

    /// Report a timed metric for an operation started at `start`.
    ///
    /// Nothing is emitted when the operation failed, so latency series only
    /// reflect successful calls.
    pub(crate) fn observe(
        &self,
        start: Instant,
        namespaced_key: &str,
        metric: MetricType,
        ok: bool,
    ) {
        if !ok {
            return;
        }
        let Some(sink) = &self.sink else { return };
        let key = self.trim(namespaced_key);
        sink(key, self.object_type(key), metric, 0, start.elapsed());
    }

    /// Report a gauge for one object type, keyed `*`.
    pub(crate) fn gauge(&self, object_type: &str, metric: MetricType, count: i64) {
        let Some(sink) = &self.sink else { return };
        sink("*", object_type, metric, count, Duration::ZERO);
    }

    pub(crate) fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn trim<'a>(&self, namespaced_key: &'a str) -> &'a str {
        namespaced_key
            .strip_prefix(&self.prefix)
            .unwrap_or(namespaced_key)
    }

    pub(crate) fn object_type<'a>(&self, key: &'a str) -> &'a str {
        key.split(&self.separator).next().unwrap_or(key)
    }
}
