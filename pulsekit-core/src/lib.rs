//! # pulsekit-core
//!
//! Core library for pulsekit - a client-side analytics SDK.
//!
//! This library provides:
//! - User identity resolution and per-user sequence numbers
//! - A durable event queue flushed in batches by a background task
//! - Session configuration fetched over conditional HTTP
//! - A push bridge between the app and an always-on push worker
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! A [`Session`] owns every moving part for one user:
//! - **Profile:** maps the caller's user id to the server-issued one
//! - **Queue:** events are appended to SQLite and shipped on the flush cadence
//! - **Resources:** refreshes the cadence and QA status in the background
//! - **Push:** pulls events the worker captured while the app was away
//!
//! ## Example
//!
//! ```rust,no_run
//! use pulsekit_core::{Config, Session, SessionParts};
//!
//! # async fn run() -> pulsekit_core::Result<()> {
//! let config = Config::load()?;
//! let parts = SessionParts::from_config(&config)?;
//! let session = Session::start(config, parts).await?;
//!
//! session.events().named_event("level_up", None)?;
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use events::{EventQueueManager, FlushStats, SendOutcome};
pub use profile::{Profile, ProfileSnapshot};
pub use session::{EventRecorder, Session, SessionParts};
pub use storage::LocalStore;
pub use types::*;

// Public modules
pub mod background;
pub mod client_info;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod profile;
pub mod push;
pub mod resources;
pub mod session;
pub mod storage;
pub mod transport;
pub mod types;
