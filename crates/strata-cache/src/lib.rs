//! Two-tier distributed object cache.
//!
//! An in-process memory tier sits in front of a shared Redis tier;
//! processes sharing one Redis stay coherent through a pub/sub action
//! channel carrying `set` and `delete` broadcasts.
//!
//! ## Architecture
//!
//! ```text
//! get(key) → memory tier → redis tier → loader
//!                ↑              │          │
//!                │        write-through  write + broadcast
//!                └── set/delete actions from every peer
//! ```
//!
//! - **Memory tier**: concurrent map, TTL-swept by a janitor task.
//! - **Redis tier**: shared store; key TTL is an amplified multiple of the
//!   memory TTL so cold processes recover values without the loader.
//! - **Single-flight**: concurrent misses for one key run the loader once.
//! - **Get policy**: expired entries are either returned stale while a
//!   background reload runs ([`GetPolicy::ReturnExpired`], the default) or
//!   reloaded synchronously ([`GetPolicy::ReloadOnExpiry`]).
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use serde::{Deserialize, Serialize};
//! use strata_cache::CacheBuilder;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
//!     .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
//! let cache = CacheBuilder::new()
//!     .namespace("myapp")
//!     .separator("#")
//!     .pool(pool)
//!     .redis_url("redis://127.0.0.1:6379")
//!     .on_error(Arc::new(|err| tracing::error!(error = %err, "cache")))
//!     .build()?;
//!
//! let user: User = cache
//!     .get("user#42", Duration::from_secs(60), || async {
//!         Ok(User { name: "v".into() }) // e.g. a database query
//!     })
//!     .await?;
//! ```

mod bus;
mod cache;
mod config;
mod error;
mod flight;
mod item;
mod memory;
mod metrics;
mod redis;
mod registry;

pub use cache::{Cache, Cacheable};
pub use config::{CacheBuilder, ErrorSink, GetPolicy};
pub use error::{BoxError, CacheError};
pub use metrics::{MetricSink, MetricType};
