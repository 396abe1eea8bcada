//! The envelope stored at both tiers.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Type-erased handle to a cached user object.
pub(crate) type SharedObject = Arc<dyn Any + Send + Sync>;

/// One cache entry: the live user object plus bookkeeping.
///
/// `expire_at` is an absolute unix timestamp in whole seconds; `0` means the
/// entry never expires. The expiry carried here is authoritative for
/// fresh-vs-stale decisions at both tiers; the Redis key TTL is only a
/// longer-lived safety net.
#[derive(Clone)]
pub(crate) struct Item {
    pub(crate) object: SharedObject,
    /// Byte length of the most recent serialization, summed into the
    /// `mem_usage` gauge.
    pub(crate) size: usize,
    pub(crate) expire_at: i64,
}

impl Item {
    pub(crate) fn new(object: SharedObject, size: usize, ttl: Duration) -> Self {
        let expire_at = if ttl.is_zero() {
            0
        } else {
            unix_now() + ttl.as_secs() as i64
        };
        Self {
            object,
            size,
            expire_at,
        }
    }

    pub(crate) fn expired(&self) -> bool {
        self.expire_at != 0 && self.expire_at < unix_now()
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("size", &self.size)
            .field("expire_at", &self.expire_at)
            .finish_non_exhaustive()
    }
}

/// Wire form of an [`Item`]. `object` holds the user type's own encoding;
/// the whole envelope round-trips through Redis as MessagePack.
#[derive(Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) object: Vec<u8>,
    pub(crate) size: u64,
    pub(crate) expire_at: i64,
}

pub(crate) fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_with_ttl(ttl: Duration) -> Item {
        Item::new(Arc::new(7u32), 4, ttl)
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let it = item_with_ttl(Duration::ZERO);
        assert_eq!(it.expire_at, 0);
        assert!(!it.expired());
    }

    #[test]
    fn test_future_expiry_is_fresh() {
        let it = item_with_ttl(Duration::from_secs(60));
        assert!(it.expire_at > unix_now());
        assert!(!it.expired());
    }

    #[test]
    fn test_past_expiry_is_expired() {
        let mut it = item_with_ttl(Duration::from_secs(60));
        it.expire_at = unix_now() - 1;
        assert!(it.expired());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope {
            object: br#"{"name":"v"}"#.to_vec(),
            size: 12,
            expire_at: 1_900_000_000,
        };
        let bytes = rmp_serde::to_vec(&env).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.object, env.object);
        assert_eq!(back.size, 12);
        assert_eq!(back.expire_at, 1_900_000_000);
    }
}
