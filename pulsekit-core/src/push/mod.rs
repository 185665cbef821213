//! Push bridge between the page and the push worker
//!
//! The page and the worker each own a store and talk only through the
//! worker's mailbox:
//!
//! - [`protocol`]: request, reply and broadcast messages
//! - [`worker`]: the worker actor and its SQLite store
//! - [`platform`]: registration and subscription seam
//! - [`manager`]: page-side lifecycle and the periodic pull

pub mod manager;
pub mod platform;
pub mod protocol;
pub mod worker;

pub use manager::{PushCallbacks, PushEventSink, PushManager, PushSettings, PushState};
pub use platform::{LocalPushPlatform, PermissionState, PushPlatform, PushSubscription};
pub use protocol::{BrowserEvent, ClientMessage, PageRequest, PushPayload, WorkerReply};
pub use worker::{LogNotifier, Notifier, PushWorker, WorkerHandle, WorkerStore};
