//! Per-key coalescing of concurrent cache fills.
//!
//! Callers racing on the same key serialize behind one keyed mutex: the
//! leader does the work, followers acquire afterwards and are expected to
//! re-check the memory tier before doing anything expensive. The map entry
//! is dropped with the last guard so idle keys cost nothing.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct FlightGroup {
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

pub(crate) struct Flight<'a> {
    group: &'a FlightGroup,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.group.inflight.remove(&self.key);
    }
}

impl FlightGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for the flight on `key`; the returned guard holds it until drop.
    pub(crate) async fn acquire(&self, key: &str) -> Flight<'_> {
        let lock = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Flight {
            group: self,
            key: key.to_string(),
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_acquires_serialize() {
        let group = Arc::new(FlightGroup::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = Arc::clone(&group);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _flight = group.acquire("user#1_get").await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_after_flight() {
        let group = FlightGroup::new();
        {
            let _flight = group.acquire("user#1_reset").await;
            assert_eq!(group.len(), 1);
        }
        assert_eq!(group.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let group = FlightGroup::new();
        let a = group.acquire("user#1_get").await;
        let b = group.acquire("user#2_get").await;
        drop(a);
        drop(b);
    }
}
