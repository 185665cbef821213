//! Namespaced, typed access to the page-side store
//!
//! Every key lives under `pulse:`. Three scopes exist:
//! - global: `pulse:<name>` (device id, install date)
//! - external user: `pulse:<external_id>:user_id`
//! - user: `pulse:<user_id>:<name>`, including queued events at
//!   `pulse:<user_id>:events:<ms>-<monotonic ns>-<uuid>`
//!
//! Values are stored as JSON text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::db::Database;
use crate::error::Result;
use crate::types::QueuedEvent;

const ROOT: &str = "pulse";

/// Global keys
pub mod global {
    pub const DEVICE_ID: &str = "device_id";
    pub const INSTALL_DATE: &str = "install_date";
}

/// Per-user keys
pub mod user {
    pub const USER_ID: &str = "user_id";
    pub const FIRST_SESSION: &str = "first_session";
    pub const LAST_SESSION: &str = "last_session";
    pub const LAST_ETAG: &str = "last_etag";
    pub const SEQNUM: &str = "seqnum";
    pub const LAST_FLUSH_FREQUENCY: &str = "last_flush_frequency";
    pub const LAST_FLUSH_REFRESH_DELAY: &str = "last_flush_refresh_delay";
    pub const LAST_WEB_PUSH_PUBLIC_KEY: &str = "last_web_push_public_key";
    pub const QA_STATUS: &str = "qa_status";
    pub const EVENTS: &str = "events";
}

/// A queued event together with the key it is stored under
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub key: String,
    pub event: QueuedEvent,
}

/// Typed client over the key-value [`Database`]
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// In-memory store with migrations applied
    pub fn in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.migrate()?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn global_key(name: &str) -> String {
        format!("{}:{}", ROOT, name)
    }

    fn scoped_key(scope: &str, name: &str) -> String {
        format!("{}:{}:{}", ROOT, scope, name)
    }

    fn events_prefix(user_id: &str) -> String {
        format!("{}:{}:{}:", ROOT, user_id, user::EVENTS)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.read(key)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Ignoring unreadable stored value");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.db.write(key, &serde_json::to_string(value)?)
    }

    // ============================================
    // Global scope
    // ============================================

    pub fn get_global<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.read_json(&Self::global_key(name))
    }

    pub fn set_global<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        self.write_json(&Self::global_key(name), value)
    }

    // ============================================
    // External-user scope
    // ============================================

    /// Internal user id previously mapped from `external_user_id`
    pub fn internal_user_id(&self, external_user_id: &str) -> Result<Option<String>> {
        self.read_json(&Self::scoped_key(external_user_id, user::USER_ID))
    }

    pub fn set_internal_user_id(&self, external_user_id: &str, user_id: &str) -> Result<()> {
        self.write_json(&Self::scoped_key(external_user_id, user::USER_ID), user_id)
    }

    // ============================================
    // User scope
    // ============================================

    pub fn get_user<T: DeserializeOwned>(&self, user_id: &str, name: &str) -> Result<Option<T>> {
        self.read_json(&Self::scoped_key(user_id, name))
    }

    pub fn set_user<T: Serialize + ?Sized>(&self, user_id: &str, name: &str, value: &T) -> Result<()> {
        self.write_json(&Self::scoped_key(user_id, name), value)
    }

    pub fn remove_user(&self, user_id: &str, name: &str) -> Result<bool> {
        self.db.delete(&Self::scoped_key(user_id, name))
    }

    pub fn has_user(&self, user_id: &str, name: &str) -> Result<bool> {
        Ok(self.db.read(&Self::scoped_key(user_id, name))?.is_some())
    }

    // ============================================
    // Event queue
    // ============================================

    /// Persist `event` under a fresh key; returns the key
    pub fn append_event(&self, user_id: &str, event: &QueuedEvent) -> Result<String> {
        let key = format!(
            "{}{}-{}-{}",
            Self::events_prefix(user_id),
            chrono::Utc::now().timestamp_millis(),
            monotonic_nanos(),
            uuid::Uuid::new_v4()
        );
        self.write_json(&key, event)?;
        Ok(key)
    }

    /// Every queued event for `user_id` with its key, in insertion order.
    ///
    /// Entries that no longer parse are deleted on sight.
    pub fn read_events(&self, user_id: &str) -> Result<Vec<StoredEvent>> {
        let entries = self.db.entries_with_prefix(&Self::events_prefix(user_id))?;
        let mut events = Vec::with_capacity(entries.len());
        let mut corrupt = Vec::new();

        for (key, raw) in entries {
            match serde_json::from_str::<QueuedEvent>(&raw) {
                Ok(event) => events.push(StoredEvent { key, event }),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping unreadable queued event");
                    corrupt.push(key);
                }
            }
        }

        if !corrupt.is_empty() {
            self.db.delete_many(&corrupt)?;
        }
        Ok(events)
    }

    /// Delete exactly `keys`; returns the number removed
    pub fn delete_events(&self, keys: &[String]) -> Result<usize> {
        self.db.delete_many(keys)
    }

    pub fn event_count(&self, user_id: &str) -> Result<usize> {
        Ok(self.db.keys_with_prefix(&Self::events_prefix(user_id))?.len())
    }
}

/// Nanoseconds since first use, strictly increasing within the process
fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = START.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}
