//! Session lifecycle and the public event API
//!
//! [`Session::start`] resolves the user, fetches the session configuration,
//! starts the flush and refresh loops and brings up the push bridge. Events
//! are recorded through the session's [`EventRecorder`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde_json::Value;

use crate::client_info::ClientInfo;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::{factory, validator, BatchContext, EventApiClient, EventQueueManager, FlushStats, SendOutcome};
use crate::profile::{IdentifyRequest, Profile, ProfileSnapshot};
use crate::push::{
    LocalPushPlatform, LogNotifier, PushCallbacks, PushEventSink, PushManager, PushPlatform, PushSettings,
    PushState, WorkerStore,
};
use crate::resources::{ConfigFetcher, ResourcesSettings};
use crate::storage::{global, LocalStore};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{
    push_engaged_event_name, ActionType, Attributes, CampaignType, QueuedEvent, Reward, SessionInfo,
    FIRST_SESSION_EVENT_NAME,
};

/// Everything a session runs against
pub struct SessionParts {
    pub store: LocalStore,
    pub transport: Arc<dyn Transport>,
    pub push_platform: Arc<dyn PushPlatform>,
    pub push_callbacks: PushCallbacks,
    pub client_info: ClientInfo,
}

impl SessionParts {
    /// Stores at their XDG locations, HTTP over reqwest, push worker in-process
    pub fn from_config(config: &Config) -> Result<Self> {
        let db = Database::open(&Config::store_path())?;
        db.migrate()?;
        let worker_store = Arc::new(WorkerStore::open(&Config::worker_store_path())?);

        Ok(Self {
            store: LocalStore::new(Arc::new(db)),
            transport: Arc::new(ReqwestTransport::new(Duration::from_secs(
                config.sdk.http_timeout_secs,
            ))?),
            push_platform: Arc::new(LocalPushPlatform::new(worker_store, Arc::new(LogNotifier))),
            push_callbacks: PushCallbacks::default(),
            client_info: ClientInfo::collect(config.sdk.language.as_deref()),
        })
    }
}

/// A running analytics session for one user
pub struct Session {
    config: Config,
    profile: Arc<Profile>,
    recorder: Arc<EventRecorder>,
    queue: Arc<EventQueueManager>,
    fetcher: Arc<ConfigFetcher>,
    push: Arc<PushManager>,
    device_id: String,
    session_token: String,
    session_start: i64,
    restored: bool,
    info: SessionInfo,
}

impl Session {
    /// Start a session.
    ///
    /// Returns [`Error::Config`] for invalid settings and [`Error::Identity`]
    /// when the user cannot be resolved; nothing is started in either case.
    /// Push failures never fail the start; they go to the push error callback.
    pub async fn start(config: Config, parts: SessionParts) -> Result<Self> {
        config.sdk.validate()?;
        let sdk = &config.sdk;
        let SessionParts {
            store,
            transport,
            push_platform,
            push_callbacks,
            client_info,
        } = parts;

        let now = Utc::now();
        let (device_id, install_date) = ensure_device_identity(&store, now)?;

        let profile = Arc::new(Profile::load(store.clone(), &sdk.external_user_id)?);
        if !profile.is_resolved() {
            let request = IdentifyRequest {
                identify_url: sdk.identify_url(),
                api_key: sdk.api_key.clone(),
                unique_device_id: device_id.clone(),
            };
            profile.identify(transport.as_ref(), &request).await?;
        }
        let user_id = profile
            .user_id()
            .ok_or_else(|| Error::Identity("profile is not resolved".to_string()))?;
        tracing::info!(
            user_id = %user_id,
            external_user_id = %sdk.external_user_id,
            "Profile resolved"
        );

        let now_ms = now.timestamp_millis();
        let restored_start =
            restored_session_start(profile.last_session(), now_ms, sdk.new_session_interval_secs);
        let session_start = restored_start.unwrap_or(now_ms);
        let token = session_token(sdk.app_id, &user_id, session_start, &sdk.api_key);

        let fetcher = Arc::new(ConfigFetcher::new(
            store.clone(),
            Arc::clone(&profile),
            Arc::clone(&transport),
            ResourcesSettings {
                content_url: sdk.content_url(),
                api_key: sdk.api_key.clone(),
                app_version: sdk.app_version.clone(),
            },
            client_info.clone(),
        ));

        let client = EventApiClient::new(
            &sdk.api_url(),
            BatchContext {
                session_token: token.clone(),
                app_version: sdk.app_version.clone(),
                user_id: user_id.clone(),
                device_id: device_id.clone(),
            },
            Arc::clone(&transport),
        );
        let queue = Arc::new(EventQueueManager::new(
            store.clone(),
            &user_id,
            client,
            fetcher.subscribe(),
        ));
        let recorder = Arc::new(EventRecorder::new(
            Arc::clone(&profile),
            store.clone(),
            Arc::clone(&queue),
        ));

        if restored_start.is_some() {
            tracing::info!(session_start, "Session restored");
        } else {
            recorder.session_start()?;
        }

        let info = fetcher.get_info_for_session().await;
        tracing::info!(
            flush_frequency_ms = info.flush.flush_frequency,
            flush_refresh_delay_ms = info.flush.flush_refresh_delay,
            qa = info.qa,
            "Session configuration ready"
        );

        queue.start();
        fetcher.start();

        if profile.last_session().is_none() {
            recorder.internal_event(FIRST_SESSION_EVENT_NAME, None)?;
        }
        recorder.device_update(client_info.device_attributes(&device_id, Some(&install_date)))?;

        let push = Arc::new(PushManager::new(
            push_platform,
            Arc::clone(&recorder) as Arc<dyn PushEventSink>,
            PushSettings {
                service_worker: sdk.service_worker.clone(),
                user_visible_only: sdk.user_visible_only,
                poll_interval: Duration::from_secs(config.push.poll_interval_secs),
                reply_timeout: Duration::from_millis(config.push.reply_timeout_ms),
            },
            push_callbacks,
        ));
        push.set_web_push_public_key(info.web_push_public_key.clone());
        if let Err(e) = push.init(&user_id).await {
            push.callbacks().report_error(&e);
        }
        if sdk.auto_push_subscribe {
            if let Err(e) = push.register_push().await {
                push.callbacks().report_error(&e);
            }
        } else {
            tracing::debug!("Push auto-subscribe disabled");
        }

        tracing::info!(user_id = %user_id, restored = restored_start.is_some(), "Session started");

        Ok(Self {
            config,
            profile,
            recorder,
            queue,
            fetcher,
            push,
            device_id,
            session_token: token,
            session_start,
            restored: restored_start.is_some(),
            info,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn user_id(&self) -> &str {
        self.queue.user_id()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Session start time, ms since epoch
    pub fn session_start(&self) -> i64 {
        self.session_start
    }

    /// Whether this session continued the previous one
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Configuration fetched at start
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn profile(&self) -> ProfileSnapshot {
        self.profile.snapshot()
    }

    pub fn stats(&self) -> FlushStats {
        self.queue.stats()
    }

    pub fn push_state(&self) -> PushState {
        self.push.state()
    }

    pub fn queued_events(&self) -> Result<Vec<QueuedEvent>> {
        self.queue.queued_events()
    }

    /// Flush the queue now instead of waiting for the next cycle
    pub async fn send_queued_events(&self) -> Result<SendOutcome> {
        self.queue.send_events().await
    }

    /// Pull push events captured by the worker now
    pub async fn pull_push_events(&self) -> Result<usize> {
        self.push.pull_push_events().await
    }

    /// Register for push with the latest known public key.
    /// Failures are also passed to the push error callback.
    pub async fn register_push(&self) -> Result<()> {
        let key = self.fetcher.cached_info(self.user_id()).web_push_public_key;
        if key.is_some() {
            self.push.set_web_push_public_key(key);
        }
        let result = self.push.register_push().await;
        if let Err(e) = &result {
            self.push.callbacks().report_error(e);
        }
        result
    }

    pub async fn unregister_push(&self) -> Result<()> {
        let result = self.push.unregister_push().await;
        if let Err(e) = &result {
            self.push.callbacks().report_error(e);
        }
        result
    }

    /// Persist the session end, e.g. when the app loses focus
    pub fn suspend(&self) -> Result<()> {
        tracing::debug!("Session suspended");
        self.profile.save_before_session_end()
    }

    /// Stop every loop, make a last flush and persist the session end
    pub async fn shutdown(&self) {
        self.push.shutdown().await;
        self.fetcher.shutdown().await;
        self.queue.shutdown().await;
        if let Err(e) = self.profile.save_before_session_end() {
            tracing::error!(error = %e, "Could not persist session end");
        }
        tracing::info!(user_id = %self.user_id(), "Session shut down");
    }
}

/// `{app_id}={user_id}={start}={hash}`, hash being the hex MD5 of user id,
/// start time and API key concatenated
pub fn session_token(app_id: u64, user_id: &str, session_start: i64, api_key: &str) -> String {
    let start = session_start.to_string();
    let mut hasher = Md5::new();
    hasher.update(user_id.as_bytes());
    hasher.update(start.as_bytes());
    hasher.update(api_key.as_bytes());
    let digest = hasher.finalize();
    format!("{}={}={}={}", app_id, user_id, start, hex::encode(digest))
}

/// Start time to resume when the last session ended less than
/// `interval_secs` ago
pub fn restored_session_start(last_session: Option<i64>, now_ms: i64, interval_secs: u64) -> Option<i64> {
    let last = last_session.filter(|l| *l > 0)?;
    let expiry_ms = interval_secs.saturating_mul(1000) as i64;
    (now_ms - last <= expiry_ms).then_some(last)
}

/// Device id and install date, created on first use
pub fn ensure_device_identity(store: &LocalStore, now: DateTime<Utc>) -> Result<(String, String)> {
    let install_date = match store.get_global::<String>(global::INSTALL_DATE)? {
        Some(date) => date,
        None => {
            let date = factory::format_install_date(now);
            store.set_global(global::INSTALL_DATE, &date)?;
            tracing::info!(install_date = %date, "Install date recorded");
            date
        }
    };

    let device_id = match store.get_global::<String>(global::DEVICE_ID)? {
        Some(id) => id,
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            store.set_global(global::DEVICE_ID, &id)?;
            id
        }
    };

    Ok((device_id, install_date))
}

// ============================================
// Event recording
// ============================================

/// Validates, stamps and queues events for the session's user
pub struct EventRecorder {
    profile: Arc<Profile>,
    store: LocalStore,
    queue: Arc<EventQueueManager>,
}

impl EventRecorder {
    pub fn new(profile: Arc<Profile>, store: LocalStore, queue: Arc<EventQueueManager>) -> Self {
        Self {
            profile,
            store,
            queue,
        }
    }

    /// Claim a seqnum, build and queue the event, mirror it for QA users
    fn record<B, M>(&self, build: B, mirror: M) -> Result<QueuedEvent>
    where
        B: FnOnce(u64, i64) -> QueuedEvent,
        M: FnOnce(&QueuedEvent) -> Option<QueuedEvent>,
    {
        let event = self.profile.with_next_seqnum(|seqnum| {
            let event = build(seqnum, Utc::now().timestamp_millis());
            self.store.append_event(self.queue.user_id(), &event)?;
            Ok(event)
        })?;
        tracing::debug!(seqnum = event.seqnum, event_type = %event.event_type(), "Event queued");

        if self.profile.is_qa() {
            if let Some(qa) = mirror(&event) {
                self.queue.send_qa_events(vec![qa]);
            }
        }
        Ok(event)
    }

    fn record_mirrored<B>(&self, build: B) -> Result<QueuedEvent>
    where
        B: FnOnce(u64, i64) -> QueuedEvent,
    {
        self.record(build, factory::qa_event)
    }

    pub fn session_start(&self) -> Result<QueuedEvent> {
        self.record_mirrored(factory::session_start)
    }

    pub fn named_event(&self, name: &str, payload: Option<Value>) -> Result<QueuedEvent> {
        validator::validate_event_name(name)?;
        self.internal_event(name, payload)
    }

    /// Named event that may use the reserved prefix
    pub(crate) fn internal_event(&self, name: &str, payload: Option<Value>) -> Result<QueuedEvent> {
        self.record_mirrored(|seqnum, time| factory::named_event(seqnum, time, name, payload))
    }

    pub fn user_update(&self, attributes: Attributes) -> Result<QueuedEvent> {
        validator::validate_user_update(&attributes)?;
        self.record_mirrored(|seqnum, time| factory::user_update(seqnum, time, attributes))
    }

    pub fn user_update_with_date(&self, name: &str, date: DateTime<Utc>) -> Result<QueuedEvent> {
        validator::validate_user_update_with_date(name)?;
        self.record_mirrored(|seqnum, time| factory::user_update_with_date(seqnum, time, name, date))
    }

    pub fn purchase(&self, item: &str, currency: &str, cost: f64, quantity: u32) -> Result<QueuedEvent> {
        validator::validate_purchase(item, currency, cost, quantity)?;
        self.record_mirrored(|seqnum, time| {
            factory::purchase(seqnum, time, item, currency, cost, quantity)
        })
    }

    pub fn currency_given(&self, currency: &str, amount: f64) -> Result<QueuedEvent> {
        validator::validate_currency_given(currency, amount)?;
        self.record_mirrored(|seqnum, time| factory::currency_given(seqnum, time, currency, amount))
    }

    pub fn iap(
        &self,
        rewards: BTreeMap<String, Reward>,
        local_currency: &str,
        cost: f64,
        quantity: u32,
        product_id: &str,
    ) -> Result<QueuedEvent> {
        validator::validate_iap(product_id, local_currency, cost, quantity, &rewards)?;
        self.record_mirrored(|seqnum, time| {
            factory::iap(seqnum, time, rewards, local_currency, cost, quantity, product_id)
        })
    }

    pub fn generic_campaign_event(
        &self,
        campaign_type: CampaignType,
        campaign_id: i64,
        id: i64,
        action_type: ActionType,
    ) -> Result<QueuedEvent> {
        validator::validate_campaign_ids(campaign_id, id)?;
        self.record_mirrored(|seqnum, time| {
            factory::generic_campaign_event(seqnum, time, campaign_type, campaign_id, id, action_type)
        })
    }

    /// `Pulse.Messages.Push-<id>.engaged`, logged to QA as a push engagement
    pub fn push_notification_engaged_event(
        &self,
        campaign_id: i64,
        deeplink: Option<&str>,
    ) -> Result<QueuedEvent> {
        let name = push_engaged_event_name(campaign_id);
        self.record(
            |seqnum, time| factory::named_event(seqnum, time, &name, None),
            |event| Some(factory::qa_push_engaged(event, campaign_id, deeplink)),
        )
    }

    pub fn device_update(&self, attributes: Attributes) -> Result<QueuedEvent> {
        self.record_mirrored(|seqnum, time| factory::device_update(seqnum, time, attributes))
    }
}

impl PushEventSink for EventRecorder {
    fn record_internal_event(&self, name: &str) -> Result<()> {
        self.internal_event(name, None).map(|_| ())
    }

    fn push_notification_engaged_event(&self, campaign_id: i64) -> Result<()> {
        EventRecorder::push_notification_engaged_event(self, campaign_id, None).map(|_| ())
    }

    fn device_update(&self, attributes: Attributes) -> Result<()> {
        EventRecorder::device_update(self, attributes).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stack;
    use crate::push::platform::tests::test_public_key;
    use crate::transport::{HttpResponse, ScriptedTransport};
    use crate::types::EventKind;
    use serde_json::json;

    fn config() -> Config {
        let mut config = Config::default();
        config.sdk.app_id = 30512;
        config.sdk.api_key = "web_sdk-test".to_string();
        config.sdk.external_user_id = "abc".to_string();
        config.sdk.stack = Stack::Us;
        config.sdk.language = Some("en".to_string());
        config
    }

    fn parts(store: LocalStore, transport: Arc<ScriptedTransport>) -> SessionParts {
        let worker_store = Arc::new(WorkerStore::open_in_memory().unwrap());
        SessionParts {
            store,
            transport,
            push_platform: Arc::new(LocalPushPlatform::new(worker_store, Arc::new(LogNotifier))),
            push_callbacks: PushCallbacks::default(),
            client_info: ClientInfo::collect(Some("en")),
        }
    }

    fn scripted(resources: serde_json::Value) -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("identify", HttpResponse::new(200, r#"{"swrve_id":"u1"}"#));
        transport.always(
            "user_resources_and_campaigns",
            HttpResponse::new(200, resources.to_string()).with_etag("e1"),
        );
        transport.always("/1/batch", HttpResponse::new(200, "{}"));
        transport
    }

    fn names(events: &[QueuedEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match &e.kind {
                EventKind::Event { name, .. } => name.clone(),
                _ => e.event_type().to_string(),
            })
            .collect()
    }

    #[test]
    fn test_session_token_shape() {
        let token = session_token(30512, "u1", 1_700_000_000_000, "web_sdk-test");
        let parts: Vec<&str> = token.split('=').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "30512");
        assert_eq!(parts[1], "u1");
        assert_eq!(parts[2], "1700000000000");
        assert_eq!(parts[3], "0c7dc3f17cbc5136acf5098a9d02dac8");
        assert_eq!(token, session_token(30512, "u1", 1_700_000_000_000, "web_sdk-test"));
        assert_ne!(token, session_token(30512, "u1", 1_700_000_000_001, "web_sdk-test"));
    }

    #[test]
    fn test_restored_session_start() {
        let now = 1_000_000;
        assert_eq!(restored_session_start(None, now, 30), None);
        assert_eq!(restored_session_start(Some(now - 10_000), now, 30), Some(now - 10_000));
        assert_eq!(restored_session_start(Some(now - 31_000), now, 30), None);
    }

    #[tokio::test]
    async fn test_first_start_queues_session_events() {
        let store = LocalStore::in_memory().unwrap();
        let transport = scripted(json!({"flush_frequency": 3_600_000, "flush_refresh_delay": 1000}));

        let session = Session::start(config(), parts(store.clone(), transport.clone()))
            .await
            .unwrap();
        assert_eq!(session.user_id(), "u1");
        assert!(!session.is_restored());
        assert!(session.session_token().starts_with("30512=u1="));
        assert_eq!(session.info().flush.flush_frequency, 3_600_000);

        let queued = session.queued_events().unwrap();
        let seqnums: Vec<u64> = queued.iter().map(|e| e.seqnum).collect();
        assert_eq!(seqnums, vec![0, 1, 2]);
        assert_eq!(
            names(&queued),
            vec!["session_start", "Pulse.first_session", "device_update"]
        );

        assert!(store.get_global::<String>(global::DEVICE_ID).unwrap().is_some());
        assert_eq!(transport.requests_to("identify").len(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_restores_session() {
        let store = LocalStore::in_memory().unwrap();
        let transport = scripted(json!({"flush_frequency": 3_600_000}));

        let first = Session::start(config(), parts(store.clone(), transport.clone()))
            .await
            .unwrap();
        first.shutdown().await;
        assert!(first.queued_events().unwrap().is_empty());

        let second = Session::start(config(), parts(store.clone(), transport.clone()))
            .await
            .unwrap();
        assert!(second.is_restored());
        assert_eq!(transport.requests_to("identify").len(), 1);

        let queued = second.queued_events().unwrap();
        assert_eq!(names(&queued), vec!["device_update"]);
        assert_eq!(queued[0].seqnum, 3);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_identify_failure_is_fatal() {
        let store = LocalStore::in_memory().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond("identify", HttpResponse::new(500, "down"));

        let err = Session::start(config(), parts(store.clone(), transport.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Identity(_)));
        assert!(transport.requests_to("user_resources").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.sdk.api_key = "nope".to_string();
        let transport = Arc::new(ScriptedTransport::new());

        let err = Session::start(config, parts(LocalStore::in_memory().unwrap(), transport.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_event_api_validates_without_consuming_seqnums() {
        let store = LocalStore::in_memory().unwrap();
        let transport = scripted(json!({"flush_frequency": 3_600_000}));
        let session = Session::start(config(), parts(store, transport)).await.unwrap();
        let events = session.events();

        assert!(matches!(
            events.named_event("Pulse.hidden", None),
            Err(Error::InvalidEvent(_))
        ));
        assert!(events.user_update(Attributes::new()).is_err());
        assert!(events.purchase("sword", "gold", 0.0, 1).is_err());

        let event = events.named_event("level_up", Some(json!({"level": "3"}))).unwrap();
        assert_eq!(event.seqnum, 3);
        let event = events.currency_given("gold", 10.0).unwrap();
        assert_eq!(event.seqnum, 4);
        assert_eq!(session.profile().seqnum, 5);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_qa_user_mirrors_events() {
        let store = LocalStore::in_memory().unwrap();
        let transport = scripted(json!({"flush_frequency": 3_600_000, "qa": {}}));
        let session = Session::start(config(), parts(store, transport.clone()))
            .await
            .unwrap();
        assert!(session.info().qa);

        session.events().push_notification_engaged_event(42, Some("app://x")).unwrap();
        session.shutdown().await;

        let qa_types: Vec<String> = transport
            .requests_to("/1/batch")
            .iter()
            .filter_map(|r| r.body.as_ref())
            .flat_map(|b| b["data"].as_array().cloned().unwrap_or_default())
            .filter(|e| e["type"] == "qa_log_event")
            .map(|e| e["log_type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(qa_types.contains(&"push-engaged".to_string()));
    }

    #[tokio::test]
    async fn test_auto_subscribe_failure_goes_to_callback() {
        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);

        let mut config = config();
        config.sdk.auto_push_subscribe = true;
        let transport = scripted(json!({"flush_frequency": 3_600_000}));
        let mut parts = parts(LocalStore::in_memory().unwrap(), transport);
        parts.push_callbacks.on_error = Some(Arc::new(move |e: &Error| {
            seen.lock().unwrap().push(e.to_string());
        }));

        let session = Session::start(config, parts).await.unwrap();
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert_eq!(session.push_state(), PushState::Initialized);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_auto_subscribe_registers_push() {
        let mut config = config();
        config.sdk.auto_push_subscribe = true;
        let transport = scripted(json!({
            "flush_frequency": 3_600_000,
            "web_push_public_key": test_public_key(),
        }));

        let session = Session::start(config, parts(LocalStore::in_memory().unwrap(), transport.clone()))
            .await
            .unwrap();
        assert_eq!(session.push_state(), PushState::Registered);
        session.shutdown().await;

        let token_updates = transport
            .requests_to("/1/batch")
            .iter()
            .filter_map(|r| r.body.as_ref())
            .flat_map(|b| b["data"].as_array().cloned().unwrap_or_default())
            .filter(|e| {
                e["type"] == "device_update"
                    && e["attributes"]
                        .get(crate::client_info::attr::PUSH_TOKEN)
                        .is_some()
            })
            .count();
        assert_eq!(token_updates, 1);
    }
}
