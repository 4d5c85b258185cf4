//! # TimeWatch
//!
//! A crash-recoverable delayed-action scheduler for Rust built on top of Tokio.
//!
//! Register a named "watch" that fires a callback after a delay. The watch is
//! persisted to a pluggable durable store before its timer is armed, so a
//! process restart can rediscover outstanding watches and resume them.
//!
//! ## Features
//!
//! - **Asynchronous**: Built on Tokio; fire callbacks run on their own tasks
//! - **Durable**: Records are written to a [`Store`] before timers are armed
//! - **Recoverable**: [`TimeWatch::recover`] replays watches that survived a
//!   restart, re-arming pending ones and firing overdue ones
//! - **Exclusive recovery**: A self-expiring store lock keeps concurrent
//!   recovery passes out of each other's way
//! - **Named Timers**: Stop or reset any watch by its name
//! - **Pluggable storage**: Bring your own store; an in-process
//!   [`MemoryStore`] is included
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use serde_json::json;
//! use timewatch::{MemoryStore, Options, TimeWatch, Watch};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let scheduler = TimeWatch::new(store, Options::new("msg_watch"))?;
//!
//!     // Resume anything that survived an earlier restart.
//!     scheduler
//!         .recover(|watch| {
//!             println!("recovered watch '{}' fired", watch.field);
//!         })
//!         .await?;
//!
//!     // Register a watch that fires in five seconds.
//!     let handle = scheduler
//!         .register(
//!             Duration::from_secs(5),
//!             Watch::with_attributes("greeting", json!({"user": "dan"})),
//!             || println!("time to act"),
//!         )
//!         .await?;
//!
//!     // Push the deadline out, then give up on the watch entirely.
//!     handle.reset(Duration::from_secs(10)).await?;
//!     handle.stop().await?;
//!
//!     scheduler.shutdown();
//!     Ok(())
//! }
//! ```

mod error;
mod memory;
mod record;
mod scheduler;
mod store;
mod wheel;

pub use error::{BoxError, Error, Result};
pub use memory::MemoryStore;
pub use record::Watch;
pub use scheduler::{Options, TimeWatch, WatchHandle};
pub use store::{ExpiryCallback, ExpiryEvents, Store, StoreResult, SCAN_PAGE};
pub use wheel::{TimerHandle, TimerWheel, Trigger, WheelHandle};

// Re-export commonly used types for convenience
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;
