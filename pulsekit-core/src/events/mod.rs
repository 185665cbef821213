//! Event construction, validation and delivery
//!
//! - [`factory`]: pure builders for every queued event kind and QA mirrors
//! - [`validator`]: argument checks for the public event API
//! - [`api`]: the collector batch endpoint
//! - [`queue`]: the durable queue and its background flush

pub mod api;
pub mod factory;
pub mod queue;
pub mod validator;

pub use api::{BatchContext, EventApiClient};
pub use queue::{EventQueueManager, FlushStats, SendOutcome};
