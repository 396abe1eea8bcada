//! Process-wide registry of cached user types.
//!
//! A peer receiving a `set` broadcast has to decode the payload into a type
//! it has never seen on that call path, so every `get`/`set` registers the
//! destination type up front: its fully-qualified type path maps to a decode
//! function plus the TTL to wrap received objects with.

use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;

use crate::error::CacheError;
use crate::item::{Item, SharedObject};

type DecodeFn = Box<dyn Fn(&[u8]) -> Result<SharedObject, CacheError> + Send + Sync>;

struct RegisteredType {
    decode: DecodeFn,
    ttl: Duration,
}

#[derive(Default)]
pub(crate) struct TypeRegistry {
    types: DashMap<&'static str, RegisteredType>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its type path and return the tag.
    ///
    /// The first registration wins: a later call with a different TTL keeps
    /// the original entry, so peers wrap received objects with the TTL this
    /// process saw first.
    pub(crate) fn register<T>(&self, ttl: Duration) -> &'static str
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let type_name = std::any::type_name::<T>();
        self.types.entry(type_name).or_insert_with(|| RegisteredType {
            decode: Box::new(|bytes| {
                let value: T = serde_json::from_slice(bytes).map_err(CacheError::decode)?;
                Ok(std::sync::Arc::new(value))
            }),
            ttl,
        });
        type_name
    }

    /// Decode `payload` into a fresh object of the registered type.
    /// `None` when the type is unknown to this process.
    pub(crate) fn decode_object(
        &self,
        type_name: &str,
        payload: &[u8],
    ) -> Option<Result<SharedObject, CacheError>> {
        let entry = self.types.get(type_name)?;
        Some((entry.decode)(payload))
    }

    /// Decode for a type this process has itself registered; unknown types
    /// are a decode error here, not a silent drop.
    pub(crate) fn decode_registered(
        &self,
        type_name: &str,
        payload: &[u8],
    ) -> Result<SharedObject, CacheError> {
        self.decode_object(type_name, payload)
            .unwrap_or_else(|| Err(CacheError::decode(format!("unregistered type {type_name}"))))
    }

    /// Build a memory-tier entry from a broadcast payload, using the TTL
    /// recorded at registration. `None` when the type is unknown.
    pub(crate) fn item_from_payload(
        &self,
        type_name: &str,
        payload: &[u8],
    ) -> Option<Result<Item, CacheError>> {
        let entry = self.types.get(type_name)?;
        let ttl = entry.ttl;
        Some((entry.decode)(payload).map(|object| Item::new(object, payload.len(), ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    #[test]
    fn test_register_and_decode_roundtrip() {
        let registry = TypeRegistry::new();
        let tag = registry.register::<Profile>(Duration::from_secs(30));
        assert!(tag.ends_with("Profile"));

        let object = registry
            .decode_registered(tag, br#"{"name":"v"}"#)
            .unwrap();
        let profile = object.downcast_ref::<Profile>().unwrap();
        assert_eq!(profile.name, "v");
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = TypeRegistry::new();
        let tag = registry.register::<Profile>(Duration::from_secs(30));
        registry.register::<Profile>(Duration::from_secs(999));

        let item = registry
            .item_from_payload(tag, br#"{"name":"v"}"#)
            .unwrap()
            .unwrap();
        // 30s registration applies, so expiry sits well below the 999s mark.
        assert!(item.expire_at <= crate::item::unix_now() + 31);
    }

    #[test]
    fn test_unknown_type_is_none() {
        let registry = TypeRegistry::new();
        assert!(registry.decode_object("nope::Missing", b"{}").is_none());
        assert!(registry.item_from_payload("nope::Missing", b"{}").is_none());
    }

    #[test]
    fn test_item_size_matches_payload() {
        let registry = TypeRegistry::new();
        let tag = registry.register::<Profile>(Duration::from_secs(5));
        let payload = br#"{"name":"longer value"}"#;
        let item = registry.item_from_payload(tag, payload).unwrap().unwrap();
        assert_eq!(item.size, payload.len());
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        let registry = TypeRegistry::new();
        let tag = registry.register::<Profile>(Duration::from_secs(5));
        let err = registry.decode_registered(tag, b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Decode(_)));
    }
}
