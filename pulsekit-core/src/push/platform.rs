//! Push platform seam
//!
//! Worker registration, subscription and permission lookups vary by host.
//! [`PushPlatform`] captures what the push manager needs; [`LocalPushPlatform`]
//! runs the worker in-process against a local worker store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::worker::{Notifier, PushWorker, WorkerHandle, WorkerStore};

/// Length of an uncompressed P-256 public key
const APPLICATION_SERVER_KEY_LEN: usize = 65;

/// An active push subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSubscription {
    pub endpoint: String,
    /// Client public key, base64url
    pub p256dh: String,
    /// Auth secret, base64url
    pub auth: String,
}

impl PushSubscription {
    /// Token reported as a device property: `<endpoint>|<p256dh>|<auth>`
    pub fn token(&self) -> String {
        format!("{}|{}|{}", self.endpoint, self.p256dh, self.auth)
    }
}

/// Notification permission as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
            PermissionState::Prompt => "prompt",
        }
    }
}

/// Decode a base64url application server key, padded or not
pub fn decode_application_server_key(key: &str) -> Result<Vec<u8>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(key.trim().trim_end_matches('='))
        .map_err(|e| Error::Push(format!("invalid web push public key: {}", e)))?;
    if bytes.len() != APPLICATION_SERVER_KEY_LEN {
        return Err(Error::Push(format!(
            "web push public key must be {} bytes, got {}",
            APPLICATION_SERVER_KEY_LEN,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Host operations the push manager depends on
#[async_trait]
pub trait PushPlatform: Send + Sync {
    /// Whether the host can run a push worker at all
    fn is_supported(&self) -> bool;

    /// Register (or reuse) the worker served from `script`
    async fn register_worker(&self, script: &str) -> Result<WorkerHandle>;

    /// The already-registered worker, if any
    async fn existing_worker(&self) -> Option<WorkerHandle>;

    async fn get_subscription(&self) -> Result<Option<PushSubscription>>;

    async fn subscribe(
        &self,
        application_server_key: &[u8],
        user_visible_only: bool,
    ) -> Result<PushSubscription>;

    /// Drop the subscription; `false` when there was none
    async fn unsubscribe(&self) -> Result<bool>;

    /// Unregister every worker this platform started
    async fn unregister_workers(&self) -> Result<()>;

    /// `None` when the host cannot report permission state
    async fn permission_state(&self) -> Option<PermissionState>;
}

/// In-process platform: the worker is a tokio task over a local store
pub struct LocalPushPlatform {
    store: Arc<WorkerStore>,
    notifier: Arc<dyn Notifier>,
    permission: PermissionState,
    worker: Mutex<Option<(WorkerHandle, JoinHandle<()>)>>,
    subscription: Mutex<Option<PushSubscription>>,
}

impl LocalPushPlatform {
    pub fn new(store: Arc<WorkerStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            permission: PermissionState::Granted,
            worker: Mutex::new(None),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_permission(mut self, permission: PermissionState) -> Self {
        self.permission = permission;
        self
    }

    pub fn store(&self) -> &Arc<WorkerStore> {
        &self.store
    }

    /// Handle to the running worker, if registered
    pub fn worker(&self) -> Option<WorkerHandle> {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .map(|(handle, _)| handle.clone())
    }
}

#[async_trait]
impl PushPlatform for LocalPushPlatform {
    fn is_supported(&self) -> bool {
        true
    }

    async fn register_worker(&self, script: &str) -> Result<WorkerHandle> {
        let mut worker = self.worker.lock().unwrap();
        if let Some((handle, _)) = worker.as_ref() {
            if handle.is_running() {
                return Ok(handle.clone());
            }
        }

        let (handle, task) =
            PushWorker::new(Arc::clone(&self.store), Arc::clone(&self.notifier)).spawn();
        tracing::info!(script, "Push worker registered");
        *worker = Some((handle.clone(), task));
        Ok(handle)
    }

    async fn existing_worker(&self) -> Option<WorkerHandle> {
        self.worker()
    }

    async fn get_subscription(&self) -> Result<Option<PushSubscription>> {
        Ok(self.subscription.lock().unwrap().clone())
    }

    async fn subscribe(
        &self,
        application_server_key: &[u8],
        user_visible_only: bool,
    ) -> Result<PushSubscription> {
        if self.permission == PermissionState::Denied {
            return Err(Error::Push("notification permission denied".to_string()));
        }
        if application_server_key.len() != APPLICATION_SERVER_KEY_LEN {
            return Err(Error::Push("invalid application server key".to_string()));
        }
        if !user_visible_only {
            tracing::debug!("Silent push requested; local platform always shows notifications");
        }

        let subscription = PushSubscription {
            endpoint: format!("local://push/{}", uuid::Uuid::new_v4()),
            p256dh: URL_SAFE_NO_PAD.encode(&application_server_key[1..33]),
            auth: URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes()),
        };
        *self.subscription.lock().unwrap() = Some(subscription.clone());
        Ok(subscription)
    }

    async fn unsubscribe(&self) -> Result<bool> {
        Ok(self.subscription.lock().unwrap().take().is_some())
    }

    async fn unregister_workers(&self) -> Result<()> {
        if let Some((_, task)) = self.worker.lock().unwrap().take() {
            task.abort();
            tracing::info!("Push worker unregistered");
        }
        Ok(())
    }

    async fn permission_state(&self) -> Option<PermissionState> {
        Some(self.permission)
    }
}
