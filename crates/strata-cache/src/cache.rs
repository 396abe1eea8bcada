//! The cache coordinator.
//!
//! Orchestrates reads, writes and deletes across the memory and Redis
//! tiers, coalesces concurrent fills per key, applies the get policy for
//! stale entries, and keeps peers coherent through the action bus.
//!
//! ## Read path
//!
//! ```text
//! get(key) → memory tier → (miss) single-flight → redis tier → (miss) loader
//!                 │                                     │             │
//!             fresh/stale                        write-through    write + broadcast
//! ```
//!
//! Tier work runs on a spawned task, so a caller that races a `get` against
//! `tokio::time::timeout` gets the deadline error while the load completes
//! in the background and still populates both tiers.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::{action_channel, Action, ActionListener, ActionRequest, Bus};
use crate::config::{CacheConfig, ErrorSink, GetPolicy};
use crate::error::{BoxError, CacheError};
use crate::flight::FlightGroup;
use crate::item::Item;
use crate::memory::MemoryTier;
use crate::metrics::{MetricType, Metrics};
use crate::redis::RedisTier;
use crate::registry::TypeRegistry;

/// Types that can live in the cache: serializable (for the Redis tier and
/// the broadcast payload), deserializable (so peers can decode them), and
/// cloneable (every `get` hands back a disjoint copy).
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

struct Shared {
    namespace: String,
    disabled: bool,
    get_policy: GetPolicy,
    mem: MemoryTier,
    redis: RedisTier,
    bus: Bus,
    registry: Arc<TypeRegistry>,
    flights: FlightGroup,
    metrics: Metrics,
    on_error: ErrorSink,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Two-tier cache handle. Cloning is cheap; all clones share the same
/// tiers and background tasks.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl Cache {
    /// Wire up tiers and spawn the janitor and action subscriber. Must be
    /// called from within a tokio runtime.
    pub(crate) fn start(config: CacheConfig) -> Self {
        let metrics = Metrics::new(
            &config.namespace,
            &config.separator,
            config.on_metric.clone(),
        );
        let mem = MemoryTier::new(metrics.clone());
        let redis = RedisTier::new(config.pool.clone(), config.redis_ttl_factor, metrics.clone());
        let bus = Bus::new(config.pool.clone(), &config.namespace);
        let registry = Arc::new(TypeRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let janitor = mem.spawn_janitor(config.clean_interval, shutdown_rx.clone());
        let listener = ActionListener {
            redis_url: config.redis_url.clone(),
            channel: action_channel(&config.namespace),
            mem: mem.clone(),
            registry: Arc::clone(&registry),
            on_error: config.on_error.clone(),
            shutdown: shutdown_rx,
        };
        let subscriber = tokio::spawn(listener.run());

        debug!(namespace = %config.namespace, disabled = config.disabled, "cache started");
        Self {
            inner: Arc::new(Shared {
                namespace: config.namespace,
                disabled: config.disabled,
                get_policy: config.get_policy,
                mem,
                redis,
                bus,
                registry,
                flights: FlightGroup::new(),
                metrics,
                on_error: config.on_error,
                shutdown: shutdown_tx,
                tasks: tokio::sync::Mutex::new(vec![janitor, subscriber]),
            }),
        }
    }

    /// Fetch `key`, calling `loader` only when both tiers miss.
    ///
    /// The returned value is a copy disjoint from cache state: mutating it
    /// never affects later reads. `ttl` must be a positive whole number of
    /// seconds. Expired-but-present entries follow the configured
    /// [`GetPolicy`].
    pub async fn get<T, F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.get_impl(key, ttl, loader, None).await
    }

    /// Like [`Cache::get`] with a per-call policy override.
    pub async fn get_with_policy<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
        policy: GetPolicy,
    ) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.get_impl(key, ttl, loader, Some(policy)).await
    }

    async fn get_impl<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
        policy: Option<GetPolicy>,
    ) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        if self.inner.disabled {
            let result = self.run_loader(loader).await;
            self.report_panic(&result);
            return result;
        }
        check_ttl(ttl)?;

        let start = Instant::now();
        let nk = self.namespaced_key(key);
        let type_name = self.inner.registry.register::<T>(ttl);
        let policy = policy.unwrap_or(self.inner.get_policy);

        let this = self.clone();
        let task_key = nk.clone();
        let handle =
            tokio::spawn(async move { this.do_get(task_key, ttl, loader, policy, type_name).await });
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(CacheError::from_join(err)),
        };
        self.report_panic(&result);
        self.inner
            .metrics
            .observe(start, &nk, MetricType::GetCache, result.is_ok());
        result
    }

    async fn do_get<T, F, Fut>(
        &self,
        nk: String,
        ttl: Duration,
        loader: F,
        policy: GetPolicy,
        type_name: &'static str,
    ) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let (item, expired) = match self.inner.mem.get(&nk) {
            Some(item) => {
                let expired = item.expired();
                (item, expired)
            }
            None => {
                let flight_key = format!("{nk}_get");
                let _flight = self.inner.flights.acquire(&flight_key).await;

                // another flight may have filled memory while we waited
                if let Some(item) = self.inner.mem.peek(&nk) {
                    let expired = item.expired();
                    (item, expired)
                } else {
                    let fetched = self
                        .inner
                        .redis
                        .get(&nk, |bytes| {
                            self.inner.registry.decode_registered(type_name, bytes)
                        })
                        .await?;
                    match fetched {
                        Some(item) => {
                            let expired = item.expired();
                            if !expired {
                                self.inner.mem.set(&nk, item.clone());
                            }
                            (item, expired)
                        }
                        None => {
                            let item = self.reset_object(&nk, ttl, loader, type_name).await?;
                            return copy_out::<T>(&item);
                        }
                    }
                }
            }
        };

        if expired {
            match policy {
                GetPolicy::ReloadOnExpiry => {
                    let fresh = self.reset_object(&nk, ttl, loader, type_name).await?;
                    return copy_out::<T>(&fresh);
                }
                GetPolicy::ReturnExpired => {
                    let this = self.clone();
                    let stale_key = nk.clone();
                    tokio::spawn(async move {
                        let start = Instant::now();
                        match this.reset_object(&stale_key, ttl, loader, type_name).await {
                            Ok(_) => this.inner.metrics.observe(
                                start,
                                &stale_key,
                                MetricType::AsyncLoad,
                                true,
                            ),
                            Err(err) => (this.inner.on_error)(&err),
                        }
                    });
                }
            }
        }
        copy_out::<T>(&item)
    }

    /// Refresh one entry: run the loader, write Redis, update local memory,
    /// broadcast. Coalesced per key, so a reload triggered mid-read and a
    /// concurrent cache-miss reload share one loader call.
    async fn reset_object<T, F, Fut>(
        &self,
        nk: &str,
        ttl: Duration,
        loader: F,
        type_name: &'static str,
    ) -> Result<Item, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let flight_key = format!("{nk}_reset");
        let _flight = self.inner.flights.acquire(&flight_key).await;

        // a concurrent reload may have landed while we waited
        if let Some(item) = self.inner.mem.peek(nk) {
            if !item.expired() {
                return Ok(item);
            }
        }

        let start = Instant::now();
        let result = self.load_and_store(nk, ttl, loader, type_name).await;
        self.inner
            .metrics
            .observe(start, nk, MetricType::Load, result.is_ok());
        result
    }

    async fn load_and_store<T, F, Fut>(
        &self,
        nk: &str,
        ttl: Duration,
        loader: F,
        type_name: &'static str,
    ) -> Result<Item, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        let value = self.run_loader(loader).await?;
        self.store_fresh(nk, value, ttl, type_name).await
    }

    /// Run the loader on its own task so a panic is contained and converted
    /// instead of tearing down the read. Sink reporting happens at the
    /// outermost boundary of whichever path consumed the loader, so each
    /// failure reaches the sink once.
    async fn run_loader<T, F, Fut>(&self, loader: F) -> Result<T, CacheError>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        match tokio::spawn(async move { loader().await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CacheError::loader(err)),
            Err(join_err) => Err(CacheError::from_join(join_err)),
        }
    }

    /// Write a fresh value through Redis and local memory, then broadcast.
    /// A failed broadcast goes to the error sink; the write stands.
    async fn store_fresh<T: Cacheable>(
        &self,
        nk: &str,
        value: T,
        ttl: Duration,
        type_name: &str,
    ) -> Result<Item, CacheError> {
        let payload = serde_json::to_string(&value).map_err(CacheError::encode)?;
        let item = self
            .inner
            .redis
            .set(nk, Arc::new(value), payload.clone().into_bytes(), ttl)
            .await?;
        self.inner.mem.set(nk, item.clone());

        let request = ActionRequest {
            action: Action::Set,
            type_name: type_name.to_string(),
            key: nk.to_string(),
            payload,
        };
        if let Err(err) = self.inner.bus.publish(&request).await {
            (self.inner.on_error)(&err);
        }
        Ok(item)
    }

    /// Store `value` under `key` without involving a loader.
    pub async fn set<T: Cacheable>(
        &self,
        key: &str,
        value: T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        check_ttl(ttl)?;
        let start = Instant::now();
        let nk = self.namespaced_key(key);
        let type_name = self.inner.registry.register::<T>(ttl);

        let this = self.clone();
        let task_key = nk.clone();
        let handle = tokio::spawn(async move {
            this.store_fresh(&task_key, value, ttl, type_name)
                .await
                .map(|_| ())
        });
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(CacheError::from_join(err)),
        };
        self.inner
            .metrics
            .observe(start, &nk, MetricType::SetCache, result.is_ok());
        result
    }

    /// Delete `key` everywhere: Redis first, then a `delete` broadcast.
    /// Memory tiers — including this process's own — drop the entry when
    /// the broadcast comes back around, so peers and the local tier
    /// converge the same way.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let start = Instant::now();
        let nk = self.namespaced_key(key);

        let this = self.clone();
        let task_key = nk.clone();
        let handle = tokio::spawn(async move {
            this.inner.redis.delete(&task_key).await?;
            let request = ActionRequest {
                action: Action::Delete,
                type_name: String::new(),
                key: task_key,
                payload: String::new(),
            };
            if let Err(err) = this.inner.bus.publish(&request).await {
                (this.inner.on_error)(&err);
            }
            Ok(())
        });
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => Err(CacheError::from_join(err)),
        };
        self.inner
            .metrics
            .observe(start, &nk, MetricType::DelCache, result.is_ok());
        result
    }

    /// Drop `key` from this process's memory tier only. Mainly useful in
    /// tests that need to force a redis-tier read.
    pub fn delete_from_memory(&self, key: &str) {
        let nk = self.namespaced_key(key);
        self.inner.mem.delete(&nk);
    }

    /// Drop `key` from the Redis tier only.
    pub async fn delete_from_redis(&self, key: &str) -> Result<(), CacheError> {
        let nk = self.namespaced_key(key);
        self.inner.redis.delete(&nk).await
    }

    /// Stop the janitor and the action subscriber and wait for them to
    /// finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Converted loader panics still propagate to the caller, but they are
    /// also reported to the sink like any other unexpected failure.
    fn report_panic<T>(&self, result: &Result<T, CacheError>) {
        if let Err(err @ CacheError::LoaderPanic(_)) = result {
            (self.inner.on_error)(err);
        }
    }

    fn namespaced_key(&self, key: &str) -> String {
        format!("{}:{}", self.inner.namespace, key)
    }
}

fn check_ttl(ttl: Duration) -> Result<(), CacheError> {
    if ttl.is_zero() || ttl.subsec_nanos() != 0 {
        return Err(CacheError::IllegalTtl);
    }
    Ok(())
}

fn copy_out<T: Cacheable>(item: &Item) -> Result<T, CacheError> {
    match item.object.clone().downcast::<T>() {
        Ok(value) => Ok((*value).clone()),
        Err(_) => Err(CacheError::decode(format!(
            "cached object is not a {}",
            std::any::type_name::<T>()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_ttl_must_be_whole_positive_seconds() {
        assert!(check_ttl(Duration::from_secs(1)).is_ok());
        assert!(check_ttl(Duration::from_secs(3600)).is_ok());
        assert!(check_ttl(Duration::ZERO).unwrap_err().is_illegal_ttl());
        assert!(check_ttl(Duration::from_millis(1500))
            .unwrap_err()
            .is_illegal_ttl());
        assert!(check_ttl(Duration::from_nanos(1))
            .unwrap_err()
            .is_illegal_ttl());
    }

    #[test]
    fn test_copy_out_returns_disjoint_value() {
        let original = Profile {
            name: "v".to_string(),
            tags: vec!["a".to_string()],
        };
        let item = Item::new(Arc::new(original.clone()), 0, Duration::from_secs(60));

        let mut copied: Profile = copy_out(&item).unwrap();
        copied.name.push_str("-mutated");
        copied.tags.push("b".to_string());

        let again: Profile = copy_out(&item).unwrap();
        assert_eq!(again, original);
    }

    #[test]
    fn test_copy_out_type_mismatch_is_decode_error() {
        let item = Item::new(Arc::new(42u64), 0, Duration::from_secs(60));
        let err = copy_out::<Profile>(&item).unwrap_err();
        assert!(matches!(err, CacheError::Decode(_)));
    }
}
