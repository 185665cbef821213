//! Page-side push manager
//!
//! Registers the worker, keeps the push subscription reported as a device
//! property, tells the worker who the current user is, and periodically pulls
//! the events it captured so they re-enter the regular event stream.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::background::{Latch, RepeatingTask};
use crate::client_info::attr;
use crate::error::{Error, Result};
use crate::types::{Attributes, PushEventRecord, PushEventType};

use super::platform::{decode_application_server_key, PushPlatform, PushSubscription};
use super::protocol::ClientMessage;
use super::worker::WorkerHandle;

/// Where pulled push events and subscription properties are recorded
pub trait PushEventSink: Send + Sync {
    /// Record an internal named event, e.g. `Pulse.Messages.Push-42.delivered`
    fn record_internal_event(&self, name: &str) -> Result<()>;
    fn push_notification_engaged_event(&self, campaign_id: i64) -> Result<()>;
    fn device_update(&self, attributes: Attributes) -> Result<()>;
}

pub type PushCallback = Arc<dyn Fn(&ClientMessage) + Send + Sync>;
pub type PushErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Optional hooks for push lifecycle notices and push failures
#[derive(Clone, Default)]
pub struct PushCallbacks {
    pub on_received: Option<PushCallback>,
    pub on_clicked: Option<PushCallback>,
    pub on_closed: Option<PushCallback>,
    pub on_error: Option<PushErrorCallback>,
}

impl PushCallbacks {
    fn notify(&self, message: &ClientMessage) {
        let callback = match message {
            ClientMessage::PushReceived { .. } => &self.on_received,
            ClientMessage::PushClicked { .. } => &self.on_clicked,
            ClientMessage::PushClosed => &self.on_closed,
        };
        if let Some(callback) = callback {
            callback(message);
        }
    }

    pub fn report_error(&self, error: &Error) {
        match &self.on_error {
            Some(callback) => callback(error),
            None => tracing::warn!(error = %error, "Push operation failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Uninitialized,
    Initialized,
    Registered,
    Unregistered,
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub service_worker: String,
    pub user_visible_only: bool,
    pub poll_interval: Duration,
    pub reply_timeout: Duration,
}

pub struct PushManager {
    platform: Arc<dyn PushPlatform>,
    sink: Arc<dyn PushEventSink>,
    settings: PushSettings,
    callbacks: PushCallbacks,
    state: Mutex<PushState>,
    user_id: Mutex<Option<String>>,
    web_push_public_key: Mutex<Option<String>>,
    worker: Mutex<Option<WorkerHandle>>,
    pulling: Latch,
    pull_task: Mutex<Option<RepeatingTask>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PushManager {
    pub fn new(
        platform: Arc<dyn PushPlatform>,
        sink: Arc<dyn PushEventSink>,
        settings: PushSettings,
        callbacks: PushCallbacks,
    ) -> Self {
        Self {
            platform,
            sink,
            settings,
            callbacks,
            state: Mutex::new(PushState::Uninitialized),
            user_id: Mutex::new(None),
            web_push_public_key: Mutex::new(None),
            worker: Mutex::new(None),
            pulling: Latch::new(),
            pull_task: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PushState {
        *self.state.lock().unwrap()
    }

    pub fn callbacks(&self) -> &PushCallbacks {
        &self.callbacks
    }

    /// Key used when a new subscription is needed; comes from the resources
    /// response
    pub fn set_web_push_public_key(&self, key: Option<String>) {
        *self.web_push_public_key.lock().unwrap() = key;
    }

    /// Bind to `user_id`. A worker registered by an earlier session is picked
    /// up straight away.
    pub async fn init(self: &Arc<Self>, user_id: &str) -> Result<()> {
        if self.state() != PushState::Uninitialized {
            tracing::debug!("Push manager already initialised");
            return Ok(());
        }
        if !self.platform.is_supported() {
            tracing::info!("Push is not supported on this platform");
            return Ok(());
        }

        *self.user_id.lock().unwrap() = Some(user_id.to_string());
        *self.state.lock().unwrap() = PushState::Initialized;

        if let Some(worker) = self.platform.existing_worker().await {
            tracing::debug!("Found existing push worker");
            self.attach(worker).await?;
        }
        Ok(())
    }

    /// Register the worker, ensure a subscription and report it
    pub async fn register_push(self: &Arc<Self>) -> Result<()> {
        self.ensure_initialised()?;

        let worker = self
            .platform
            .register_worker(&self.settings.service_worker)
            .await?;

        let subscription = match self.platform.get_subscription().await? {
            Some(subscription) => subscription,
            None => {
                let key = self
                    .web_push_public_key
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::Push("no web push public key available".to_string()))?;
                let key = decode_application_server_key(&key)?;
                self.platform
                    .subscribe(&key, self.settings.user_visible_only)
                    .await?
            }
        };

        self.report_subscription(&subscription).await?;
        self.attach(worker).await?;
        *self.state.lock().unwrap() = PushState::Registered;
        tracing::info!("Push registered");
        Ok(())
    }

    /// Drop the subscription and the worker, then stop pulling
    pub async fn unregister_push(&self) -> Result<()> {
        self.ensure_initialised()?;

        if !self.platform.unsubscribe().await? {
            tracing::warn!("No push subscription to remove");
        }
        self.platform.unregister_workers().await?;
        self.detach().await;
        *self.state.lock().unwrap() = PushState::Unregistered;
        tracing::info!("Push unregistered");
        Ok(())
    }

    /// Tell the worker which user is current
    pub async fn set_user_session(&self) -> Result<()> {
        let (worker, user_id) = self.worker_and_user()?;
        let user = worker
            .set_user_session(&user_id, self.settings.reply_timeout)
            .await?;
        tracing::debug!(user_id = %user.user_id, last_active = user.last_active, "Worker user synced");
        Ok(())
    }

    /// Pull the worker's captured events for the current user
    pub async fn fetch_push_data(&self) -> Result<Vec<PushEventRecord>> {
        let (worker, user_id) = self.worker_and_user()?;
        worker
            .fetch_push_data(&user_id, self.settings.reply_timeout)
            .await
    }

    /// One pull cycle: fetch, then record every event. Returns how many
    /// records were pulled.
    pub async fn pull_push_events(&self) -> Result<usize> {
        let Some(_guard) = self.pulling.try_acquire() else {
            tracing::debug!("Push pull already running");
            return Ok(0);
        };

        let records = self.fetch_push_data().await?;
        for record in &records {
            if let Err(e) = self.record(record) {
                tracing::warn!(id = record.id, event = %record.event, error = %e, "Failed to record push event");
            }
        }
        if !records.is_empty() {
            tracing::debug!(count = records.len(), "Pulled push events");
        }
        Ok(records.len())
    }

    /// Stop pulling and listening; the worker keeps running
    pub async fn shutdown(&self) {
        self.detach().await;
    }

    fn record(&self, record: &PushEventRecord) -> Result<()> {
        match (record.event_type, record.campaign_id) {
            (PushEventType::Clicked, Some(campaign_id)) => {
                self.sink.push_notification_engaged_event(campaign_id)
            }
            (PushEventType::Closed, _) => Ok(()),
            _ => self.sink.record_internal_event(&record.event),
        }
    }

    async fn report_subscription(&self, subscription: &PushSubscription) -> Result<()> {
        let permission = self
            .platform
            .permission_state()
            .await
            .map(|p| p.as_str())
            .unwrap_or("unknown");

        let mut attributes = Attributes::new();
        attributes.insert(attr::PUSH_TOKEN.to_string(), json!(subscription.token()));
        attributes.insert(attr::PUSH_PERMISSION.to_string(), json!(permission));
        self.sink.device_update(attributes)
    }

    async fn attach(self: &Arc<Self>, worker: WorkerHandle) -> Result<()> {
        let clients = worker.subscribe_clients();
        *self.worker.lock().unwrap() = Some(worker);
        self.set_user_session().await?;
        self.spawn_listener(clients);
        self.start_pull_loop();
        Ok(())
    }

    async fn detach(&self) {
        let task = self.pull_task.lock().unwrap().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
        self.worker.lock().unwrap().take();
    }

    fn start_pull_loop(self: &Arc<Self>) {
        let mut pull_task = self.pull_task.lock().unwrap();
        if pull_task.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        let interval = self.settings.poll_interval;
        *pull_task = Some(RepeatingTask::spawn(
            "push-pull",
            interval,
            move || interval,
            move || {
                let manager = manager.upgrade();
                async move {
                    let Some(manager) = manager else { return };
                    if let Err(e) = manager.pull_push_events().await {
                        tracing::warn!(error = %e, "Push pull failed");
                    }
                }
            },
        ));
    }

    fn spawn_listener(&self, mut clients: broadcast::Receiver<ClientMessage>) {
        let callbacks = self.callbacks.clone();
        let listener = tokio::spawn(async move {
            loop {
                match clients.recv().await {
                    Ok(message) => callbacks.notify(&message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Push listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.listener.lock().unwrap().replace(listener) {
            previous.abort();
        }
    }

    fn ensure_initialised(&self) -> Result<()> {
        match self.state() {
            PushState::Uninitialized => Err(Error::Push("push manager not initialised".to_string())),
            _ => Ok(()),
        }
    }

    fn worker_and_user(&self) -> Result<(WorkerHandle, String)> {
        let worker = self
            .worker
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Push("no push worker registered".to_string()))?;
        let user_id = self
            .user_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Push("push manager not initialised".to_string()))?;
        Ok((worker, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::platform::tests::test_public_key;
    use crate::push::platform::{LocalPushPlatform, PermissionState};
    use crate::push::protocol::{BrowserEvent, PushPayload};
    use crate::push::worker::{LogNotifier, WorkerStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
        device_updates: Mutex<Vec<Attributes>>,
    }

    impl PushEventSink for RecordingSink {
        fn record_internal_event(&self, name: &str) -> Result<()> {
            self.events.lock().unwrap().push(name.to_string());
            Ok(())
        }

        fn push_notification_engaged_event(&self, campaign_id: i64) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("engaged:{}", campaign_id));
            Ok(())
        }

        fn device_update(&self, attributes: Attributes) -> Result<()> {
            self.device_updates.lock().unwrap().push(attributes);
            Ok(())
        }
    }

    fn settings() -> PushSettings {
        PushSettings {
            service_worker: "service_worker.js".to_string(),
            user_visible_only: true,
            poll_interval: Duration::from_secs(3600),
            reply_timeout: Duration::from_secs(5),
        }
    }

    fn setup(
        permission: PermissionState,
        callbacks: PushCallbacks,
    ) -> (Arc<LocalPushPlatform>, Arc<RecordingSink>, Arc<PushManager>) {
        let store = Arc::new(WorkerStore::open_in_memory().unwrap());
        let platform = Arc::new(
            LocalPushPlatform::new(store, Arc::new(LogNotifier)).with_permission(permission),
        );
        let sink = Arc::new(RecordingSink::default());
        let manager = Arc::new(PushManager::new(
            platform.clone(),
            sink.clone(),
            settings(),
            callbacks,
        ));
        (platform, sink, manager)
    }

    fn push(id: i64) -> PushPayload {
        PushPayload::from_json(&json!({"data": {"pulse": {"_p": id}}})).unwrap()
    }

    #[tokio::test]
    async fn test_register_requires_init() {
        let (_, _, manager) = setup(PermissionState::Granted, PushCallbacks::default());
        assert!(matches!(manager.register_push().await, Err(Error::Push(_))));
        assert_eq!(manager.state(), PushState::Uninitialized);
    }

    #[tokio::test]
    async fn test_register_reports_subscription() {
        let (platform, sink, manager) = setup(PermissionState::Granted, PushCallbacks::default());
        manager.set_web_push_public_key(Some(test_public_key()));
        manager.init("u1").await.unwrap();
        assert_eq!(manager.state(), PushState::Initialized);

        manager.register_push().await.unwrap();
        assert_eq!(manager.state(), PushState::Registered);

        let updates = sink.device_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        let token = updates[0][attr::PUSH_TOKEN].as_str().unwrap();
        assert_eq!(token.split('|').count(), 3);
        assert_eq!(updates[0][attr::PUSH_PERMISSION], json!("granted"));

        let current = platform.store().current_user().unwrap().unwrap();
        assert_eq!(current.user_id, "u1");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_without_key_fails() {
        let (_, _, manager) = setup(PermissionState::Granted, PushCallbacks::default());
        manager.init("u1").await.unwrap();
        let err = manager.register_push().await.unwrap_err();
        assert!(matches!(err, Error::Push(_)));
        assert_eq!(manager.state(), PushState::Initialized);
    }

    #[tokio::test]
    async fn test_pulled_events_recorded_once() {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let callbacks = PushCallbacks {
            on_received: Some(Arc::new(move |_: &ClientMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let (platform, sink, manager) = setup(PermissionState::Granted, callbacks);
        manager.set_web_push_public_key(Some(test_public_key()));
        manager.init("u1").await.unwrap();
        manager.register_push().await.unwrap();

        let worker = platform.worker().unwrap();
        worker.dispatch(BrowserEvent::Push(push(42))).await.unwrap();
        worker
            .dispatch(BrowserEvent::NotificationClick(push(42)))
            .await
            .unwrap();

        assert_eq!(manager.pull_push_events().await.unwrap(), 2);
        assert_eq!(manager.pull_push_events().await.unwrap(), 0);

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["Pulse.Messages.Push-42.delivered".to_string(), "engaged:42".to_string()]
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while received.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_init_picks_up_existing_worker() {
        let (platform, _, manager) = setup(PermissionState::Prompt, PushCallbacks::default());
        platform.register_worker("service_worker.js").await.unwrap();

        manager.init("u9").await.unwrap();
        let current = platform.store().current_user().unwrap().unwrap();
        assert_eq!(current.user_id, "u9");
        assert!(manager.fetch_push_data().await.unwrap().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_stops_everything() {
        let (platform, _, manager) = setup(PermissionState::Granted, PushCallbacks::default());
        manager.set_web_push_public_key(Some(test_public_key()));
        manager.init("u1").await.unwrap();
        manager.register_push().await.unwrap();

        manager.unregister_push().await.unwrap();
        assert_eq!(manager.state(), PushState::Unregistered);
        assert!(platform.worker().is_none());
        assert!(platform.get_subscription().await.unwrap().is_none());
        assert!(matches!(manager.fetch_push_data().await, Err(Error::Push(_))));
    }
}
