//! Cross-process action broadcast over Redis pub/sub.
//!
//! Every write or delete publishes an [`ActionRequest`] on
//! `{namespace}:action_channel`; each peer runs one subscriber loop that
//! applies those actions to its memory tier. Set actions for types the
//! process has never registered are dropped silently, since no local
//! consumer could decode them anyway.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ErrorSink;
use crate::error::CacheError;
use crate::memory::MemoryTier;
use crate::registry::TypeRegistry;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Action {
    Set,
    Delete,
}

/// Wire message carried on the action channel. `payload` holds the JSON
/// encoding of the freshly written object; it is empty for deletes.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ActionRequest {
    pub(crate) action: Action,
    pub(crate) type_name: String,
    pub(crate) key: String,
    #[serde(default)]
    pub(crate) payload: String,
}

pub(crate) fn action_channel(namespace: &str) -> String {
    format!("{namespace}:action_channel")
}

/// Publishing half of the bus; uses pooled connections like any other
/// Redis command.
pub(crate) struct Bus {
    pool: Pool,
    channel: String,
}

impl Bus {
    pub(crate) fn new(pool: Pool, namespace: &str) -> Self {
        Self {
            pool,
            channel: action_channel(namespace),
        }
    }

    pub(crate) async fn publish(&self, request: &ActionRequest) -> Result<(), CacheError> {
        let message = serde_json::to_string(request).map_err(CacheError::encode)?;
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(&self.channel, &message).await?;
        debug!(channel = %self.channel, key = %request.key, action = ?request.action, "published action");
        Ok(())
    }
}

/// Subscribing half of the bus: one loop per process, started at cache
/// construction and stopped via the shutdown signal.
///
/// Subscriptions need a connection of their own; pooled connections cannot
/// enter subscriber mode, so the loop dials the server directly and redials
/// whenever the connection dies.
pub(crate) struct ActionListener {
    pub(crate) redis_url: String,
    pub(crate) channel: String,
    pub(crate) mem: MemoryTier,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) on_error: ErrorSink,
    pub(crate) shutdown: tokio::sync::watch::Receiver<bool>,
}

impl ActionListener {
    pub(crate) async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                result = self.subscribe_loop() => {
                    if let Err(err) = result {
                        (self.on_error)(&err);
                    }
                }
                _ = shutdown.changed() => break,
            }
            // connection is gone; give the server a moment, then redial
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(channel = %self.channel, "action listener stopped");
    }

    async fn subscribe_loop(&self) -> Result<(), CacheError> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        debug!(channel = %self.channel, "subscribed to action channel");

        let mut stream = pubsub.on_message();
        loop {
            match stream.next().await {
                Some(msg) => match msg.get_payload::<String>() {
                    Ok(raw) => self.apply(&raw),
                    Err(err) => (self.on_error)(&CacheError::Redis(err)),
                },
                None => return Err(CacheError::SubscribeClosed),
            }
        }
    }

    /// Apply one received action to the memory tier.
    pub(crate) fn apply(&self, raw: &str) {
        let request: ActionRequest = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "dropping malformed action message");
                (self.on_error)(&CacheError::decode(err));
                return;
            }
        };
        match request.action {
            Action::Set => {
                match self
                    .registry
                    .item_from_payload(&request.type_name, request.payload.as_bytes())
                {
                    // type never seen here: nobody local can want it
                    None => {}
                    Some(Ok(item)) => self.mem.set(&request.key, item),
                    Some(Err(err)) => (self.on_error)(&err),
                }
            }
            Action::Delete => self.mem.delete(&request.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use tokio::sync::watch;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    fn listener() -> (ActionListener, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let on_error: ErrorSink = {
            let errors = Arc::clone(&errors);
            Arc::new(move |err: &CacheError| {
                errors.lock().unwrap().push(err.to_string());
            })
        };
        let (_tx, rx) = watch::channel(false);
        (
            ActionListener {
                redis_url: "redis://127.0.0.1:1".to_string(),
                channel: action_channel("app"),
                mem: MemoryTier::new(Metrics::new("app", "#", None)),
                registry: Arc::new(TypeRegistry::new()),
                on_error,
                shutdown: rx,
            },
            errors,
        )
    }

    #[test]
    fn test_action_request_wire_format() {
        let request = ActionRequest {
            action: Action::Set,
            type_name: "demo::Profile".to_string(),
            key: "app:user#1".to_string(),
            payload: r#"{"name":"v"}"#.to_string(),
        };
        let raw = serde_json::to_string(&request).unwrap();
        assert!(raw.contains(r#""action":"set""#));
        let back: ActionRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.action, Action::Set);
        assert_eq!(back.key, "app:user#1");
    }

    #[test]
    fn test_set_action_populates_memory() {
        let (listener, errors) = listener();
        let tag = listener
            .registry
            .register::<Profile>(Duration::from_secs(30));

        let raw = serde_json::to_string(&ActionRequest {
            action: Action::Set,
            type_name: tag.to_string(),
            key: "app:user#1".to_string(),
            payload: r#"{"name":"v"}"#.to_string(),
        })
        .unwrap();
        listener.apply(&raw);

        let item = listener.mem.peek("app:user#1").expect("entry inserted");
        let profile = item.object.downcast_ref::<Profile>().unwrap();
        assert_eq!(profile.name, "v");
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_type_dropped_silently() {
        let (listener, errors) = listener();
        let raw = serde_json::to_string(&ActionRequest {
            action: Action::Set,
            type_name: "unseen::Elsewhere".to_string(),
            key: "app:user#1".to_string(),
            payload: r#"{"name":"v"}"#.to_string(),
        })
        .unwrap();
        listener.apply(&raw);

        assert!(listener.mem.peek("app:user#1").is_none());
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delete_action_removes_entry() {
        let (listener, _errors) = listener();
        let tag = listener
            .registry
            .register::<Profile>(Duration::from_secs(30));
        listener.apply(
            &serde_json::to_string(&ActionRequest {
                action: Action::Set,
                type_name: tag.to_string(),
                key: "app:user#1".to_string(),
                payload: r#"{"name":"v"}"#.to_string(),
            })
            .unwrap(),
        );
        listener.apply(
            &serde_json::to_string(&ActionRequest {
                action: Action::Delete,
                type_name: String::new(),
                key: "app:user#1".to_string(),
                payload: String::new(),
            })
            .unwrap(),
        );
        assert!(listener.mem.peek("app:user#1").is_none());
    }

    #[test]
    fn test_malformed_message_hits_error_sink() {
        let (listener, errors) = listener();
        listener.apply("not json at all");
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_undecodable_payload_hits_error_sink() {
        let (listener, errors) = listener();
        let tag = listener
            .registry
            .register::<Profile>(Duration::from_secs(30));
        listener.apply(
            &serde_json::to_string(&ActionRequest {
                action: Action::Set,
                type_name: tag.to_string(),
                key: "app:user#1".to_string(),
                payload: "broken".to_string(),
            })
            .unwrap(),
        );
        assert!(listener.mem.peek("app:user#1").is_none());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
