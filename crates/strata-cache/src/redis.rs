//! Shared Redis tier.
//!
//! Values are [`Envelope`]s encoded as MessagePack; the envelope's own
//! `expire_at` decides fresh-vs-expired, while the Redis key TTL is
//! amplified (`memory ttl × ttl_factor`) so a cold process can still
//! recover a value its peers already loaded instead of hitting the loader.
//!
//! Connections are checked out of the pool per operation and returned on
//! every exit path when the guard drops.

use std::time::{Duration, Instant};

use deadpool_redis::Pool;
use redis::AsyncCommands;
use tracing::debug;

use crate::error::CacheError;
use crate::item::{Envelope, Item, SharedObject};
use crate::metrics::{MetricType, Metrics};

pub(crate) struct RedisTier {
    pool: Pool,
    ttl_factor: u32,
    metrics: Metrics,
}

impl RedisTier {
    pub(crate) fn new(pool: Pool, ttl_factor: u32, metrics: Metrics) -> Self {
        Self {
            pool,
            ttl_factor,
            metrics,
        }
    }

    /// Fetch and decode `key`. An absent key is a miss (`Ok(None)`), never
    /// an error; network and decode failures surface to the caller.
    pub(crate) async fn get(
        &self,
        key: &str,
        decode: impl Fn(&[u8]) -> Result<SharedObject, CacheError>,
    ) -> Result<Option<Item>, CacheError> {
        let start = Instant::now();
        let mut conn = self.pool.get().await?;
        let body: Option<Vec<u8>> = conn.get(key).await?;
        let Some(body) = body else {
            self.metrics
                .observe(start, key, MetricType::GetRedisMiss, true);
            return Ok(None);
        };

        let envelope: Envelope = rmp_serde::from_slice(&body).map_err(CacheError::decode)?;
        let object = decode(&envelope.object)?;
        let item = Item {
            object,
            size: envelope.size as usize,
            expire_at: envelope.expire_at,
        };
        let metric = if item.expired() {
            MetricType::GetRedisExpired
        } else {
            MetricType::GetRedisHit
        };
        self.metrics.observe(start, key, metric, true);
        Ok(Some(item))
    }

    /// Write a freshly loaded object. Returns the Item now stored, sized by
    /// the payload bytes. A zero memory TTL writes the key without expiry.
    pub(crate) async fn set(
        &self,
        key: &str,
        object: SharedObject,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<Item, CacheError> {
        let start = Instant::now();
        let size = payload.len();
        let item = Item::new(object, size, ttl);
        let envelope = Envelope {
            object: payload,
            size: size as u64,
            expire_at: item.expire_at,
        };
        let body = rmp_serde::to_vec(&envelope).map_err(CacheError::encode)?;

        let mut conn = self.pool.get().await?;
        if ttl.is_zero() {
            conn.set::<_, _, ()>(key, body).await?;
        } else {
            let redis_ttl = ttl.as_secs() * u64::from(self.ttl_factor);
            conn.set_ex::<_, _, ()>(key, body, redis_ttl).await?;
            debug!(key = %key, redis_ttl, "redis tier set");
        }
        self.metrics
            .observe(start, key, MetricType::SetRedis, true);
        Ok(item)
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let start = Instant::now();
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(key).await?;
        self.metrics
            .observe(start, key, MetricType::DelRedis, true);
        Ok(())
    }
}
