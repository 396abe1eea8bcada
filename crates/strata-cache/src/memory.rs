//! In-process memory tier.
//!
//! A concurrent key → [`Item`] map in front of Redis. Entries are returned
//! even when expired (the coordinator decides what staleness means); a
//! janitor task sweeps expired entries on a fixed interval and reports
//! per-object-type `count` and `mem_usage` gauges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::item::Item;
use crate::metrics::{MetricType, Metrics};

#[derive(Clone)]
pub(crate) struct MemoryTier {
    items: Arc<DashMap<String, Item>>,
    metrics: Metrics,
}

impl MemoryTier {
    pub(crate) fn new(metrics: Metrics) -> Self {
        Self {
            items: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Look up `key`, reporting hit / miss / expired. The stored item is
    /// returned even when expired.
    pub(crate) fn get(&self, key: &str) -> Option<Item> {
        let start = Instant::now();
        match self.items.get(key) {
            Some(entry) => {
                let item = entry.value().clone();
                drop(entry);
                let metric = if item.expired() {
                    MetricType::GetMemExpired
                } else {
                    MetricType::GetMemHit
                };
                self.metrics.observe(start, key, metric, true);
                Some(item)
            }
            None => {
                self.metrics.observe(start, key, MetricType::GetMemMiss, true);
                None
            }
        }
    }

    /// Metric-free lookup for double-checks inside a flight.
    pub(crate) fn peek(&self, key: &str) -> Option<Item> {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn set(&self, key: &str, item: Item) {
        let start = Instant::now();
        self.items.insert(key.to_string(), item);
        self.metrics.observe(start, key, MetricType::SetMem, true);
    }

    pub(crate) fn delete(&self, key: &str) {
        let start = Instant::now();
        self.items.remove(key);
        self.metrics.observe(start, key, MetricType::DelMem, true);
    }

    /// Drop expired entries, then report `count` and `mem_usage` gauges for
    /// what survived. Entries mutated or removed mid-sweep are simply seen
    /// in whichever state the map holds at iteration time.
    pub(crate) fn sweep(&self) {
        let mut swept = 0usize;
        self.items.retain(|_, item| {
            let keep = !item.expired();
            if !keep {
                swept += 1;
            }
            keep
        });
        if swept > 0 {
            debug!(swept, "memory tier janitor removed expired entries");
        }

        if !self.metrics.enabled() {
            return;
        }
        let mut per_type: HashMap<String, (i64, i64)> = HashMap::new();
        for entry in self.items.iter() {
            let key = self.metrics.trim(entry.key());
            let object_type = self.metrics.object_type(key).to_string();
            let slot = per_type.entry(object_type).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += entry.value().size as i64;
        }
        for (object_type, (count, bytes)) in per_type {
            self.metrics.gauge(&object_type, MetricType::Count, count);
            self.metrics.gauge(&object_type, MetricType::MemUsage, bytes);
        }
    }

    /// Spawn the janitor loop; it exits when `shutdown` flips or the cache
    /// handle goes away.
    pub(crate) fn spawn_janitor(
        &self,
        clean_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tier = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(clean_interval);
            // the first tick completes immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tier.sweep(),
                    _ = shutdown.changed() => break,
                }
            }
            debug!("memory tier janitor stopped");
        })
    }
}
