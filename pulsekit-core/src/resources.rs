//! Session configuration fetch
//!
//! The resources endpoint tells a session how often to flush, whether the
//! user is a QA user and which key to subscribe to web push with. Requests
//! are conditional on the last `ETag`; answers are cached per user so a
//! failed fetch still yields the last known cadence.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::background::{Latch, RepeatingTask};
use crate::client_info::ClientInfo;
use crate::profile::Profile;
use crate::storage::{user, LocalStore};
use crate::transport::{HttpResponse, Transport};
use crate::types::{FlushConfig, SessionInfo, APP_STORE};

const RESOURCES_PATH: &str = "api/1/user_resources_and_campaigns";
const ORIENTATION: &str = "both";
const RESOURCES_VERSION: &str = "7";

/// Static inputs of the resources request
#[derive(Debug, Clone)]
pub struct ResourcesSettings {
    pub content_url: String,
    pub api_key: String,
    pub app_version: String,
}

/// Fetches and caches session configuration for one user
pub struct ConfigFetcher {
    store: LocalStore,
    profile: Arc<Profile>,
    transport: Arc<dyn Transport>,
    settings: ResourcesSettings,
    client_info: ClientInfo,
    latch: Latch,
    flush_tx: watch::Sender<FlushConfig>,
    background: Mutex<Option<RepeatingTask>>,
}

impl ConfigFetcher {
    pub fn new(
        store: LocalStore,
        profile: Arc<Profile>,
        transport: Arc<dyn Transport>,
        settings: ResourcesSettings,
        client_info: ClientInfo,
    ) -> Self {
        let (flush_tx, _) = watch::channel(FlushConfig::default());
        Self {
            store,
            profile,
            transport,
            settings,
            client_info,
            latch: Latch::new(),
            flush_tx,
            background: Mutex::new(None),
        }
    }

    /// Receiver that sees every refreshed flush configuration
    pub fn subscribe(&self) -> watch::Receiver<FlushConfig> {
        self.flush_tx.subscribe()
    }

    /// Most recently published flush configuration
    pub fn current(&self) -> FlushConfig {
        *self.flush_tx.borrow()
    }

    /// Full request URL, with `etag` appended when a validator is held
    pub fn request_url(&self) -> String {
        let user_id = self.profile.user_id().unwrap_or_default();
        let joined = self
            .profile
            .first_session()
            .map(|ms| ms.to_string())
            .unwrap_or_default();
        let device_height = self.client_info.device_height();
        let device_width = self.client_info.device_width();

        let mut params: Vec<(&str, &str)> = vec![
            ("api_key", self.settings.api_key.as_str()),
            ("app_store", APP_STORE),
            ("app_version", self.settings.app_version.as_str()),
            ("device_height", device_height.as_str()),
            ("device_name", self.client_info.device_name.as_str()),
            ("device_width", device_width.as_str()),
            ("joined", joined.as_str()),
            ("language", self.client_info.language.as_str()),
            ("orientation", ORIENTATION),
            ("os", self.client_info.os.as_str()),
            ("os_version", self.client_info.os_version.as_str()),
            ("user", user_id.as_str()),
            ("version", RESOURCES_VERSION),
        ];
        let etag = self.profile.etag();
        if let Some(etag) = etag.as_deref() {
            params.push(("etag", etag));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        format!(
            "{}/{}?{}",
            self.settings.content_url.trim_end_matches('/'),
            RESOURCES_PATH,
            query
        )
    }

    /// Drop an etag that has no cached configuration behind it, so the
    /// next request is unconditional
    fn heal_etag(&self, user_id: &str) {
        if self.profile.etag().is_none() {
            return;
        }
        match self.store.has_user(user_id, user::LAST_FLUSH_REFRESH_DELAY) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(user_id, "Cached configuration missing, dropping etag");
                if let Err(e) = self.profile.clear_etag() {
                    tracing::warn!(error = %e, "Could not clear etag");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not check cached configuration"),
        }
    }

    /// Fetch configuration for the session. Never fails: on any error the
    /// cached values are used, then the defaults.
    pub async fn get_info_for_session(&self) -> SessionInfo {
        let Some(user_id) = self.profile.user_id() else {
            tracing::warn!("No user id, using default session configuration");
            return self.publish(SessionInfo::default());
        };

        self.heal_etag(&user_id);
        let url = self.request_url();

        match self.transport.get(&url).await {
            Ok(response) => self.absorb(&user_id, &response),
            Err(e) => tracing::error!(error = %e, "Resources request failed"),
        }

        let info = self.cached_info(&user_id);
        self.publish(info)
    }

    /// Persist a 200 response with content
    fn absorb(&self, user_id: &str, response: &HttpResponse) {
        let body = response.body.trim();
        if response.status != 200 || body.is_empty() || body == "{}" {
            tracing::debug!(status = response.status, "No new session configuration");
            return;
        }

        let json: serde_json::Value = match serde_json::from_str(body) {
            Ok(json @ serde_json::Value::Object(_)) => json,
            Ok(_) | Err(_) => {
                tracing::error!(body = %body, "Unreadable resources response");
                return;
            }
        };

        let qa = json.get("qa").is_some();
        match self.persist_response(user_id, &json, qa, response.etag.as_deref()) {
            Ok(()) => tracing::info!(user_id, qa, "Session configuration updated"),
            Err(e) => tracing::error!(error = %e, "Could not persist session configuration"),
        }
    }

    fn persist_response(
        &self,
        user_id: &str,
        json: &serde_json::Value,
        qa: bool,
        etag: Option<&str>,
    ) -> crate::error::Result<()> {
        if let Some(freq) = json.get("flush_frequency").and_then(|v| v.as_u64()) {
            self.store.set_user(user_id, user::LAST_FLUSH_FREQUENCY, &freq)?;
        }
        if let Some(delay) = json.get("flush_refresh_delay").and_then(|v| v.as_u64()) {
            self.store
                .set_user(user_id, user::LAST_FLUSH_REFRESH_DELAY, &delay)?;
        }
        match json.get("web_push_public_key").and_then(|v| v.as_str()) {
            Some(key) => self
                .store
                .set_user(user_id, user::LAST_WEB_PUSH_PUBLIC_KEY, key)?,
            None => {
                self.store
                    .remove_user(user_id, user::LAST_WEB_PUSH_PUBLIC_KEY)?;
            }
        }
        self.profile.set_qa(qa)?;
        if let Some(etag) = etag {
            self.profile.set_etag(etag)?;
        }
        Ok(())
    }

    /// Cached values for `user_id`, defaults where nothing usable is stored
    pub fn cached_info(&self, user_id: &str) -> SessionInfo {
        let defaults = FlushConfig::default();
        let positive = |name: &str| -> Option<u64> {
            self.store
                .get_user::<u64>(user_id, name)
                .unwrap_or_else(|e| {
                    tracing::warn!(key = name, error = %e, "Could not read cached configuration");
                    None
                })
                .filter(|v| *v > 0)
        };

        SessionInfo {
            flush: FlushConfig {
                flush_frequency: positive(user::LAST_FLUSH_FREQUENCY)
                    .unwrap_or(defaults.flush_frequency),
                flush_refresh_delay: positive(user::LAST_FLUSH_REFRESH_DELAY)
                    .unwrap_or(defaults.flush_refresh_delay),
            },
            qa: self
                .store
                .get_user::<bool>(user_id, user::QA_STATUS)
                .ok()
                .flatten()
                .unwrap_or(false)
                || self.profile.is_qa(),
            web_push_public_key: self
                .store
                .get_user::<String>(user_id, user::LAST_WEB_PUSH_PUBLIC_KEY)
                .ok()
                .flatten(),
        }
    }

    fn publish(&self, info: SessionInfo) -> SessionInfo {
        self.flush_tx.send_replace(info.flush);
        info
    }

    /// One background refresh; a no-op while a previous refresh is running
    pub async fn refresh_in_background(&self) {
        let Some(_busy) = self.latch.try_acquire() else {
            tracing::debug!("Previous configuration refresh still running");
            return;
        };
        let info = self.get_info_for_session().await;
        tracing::debug!(
            flush_frequency_ms = info.flush.flush_frequency,
            flush_refresh_delay_ms = info.flush.flush_refresh_delay,
            "Configuration refreshed"
        );
    }

    /// Refresh on the flush cadence, never faster than the refresh delay.
    /// The first refresh waits one interval.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().unwrap();
        if background.is_some() {
            return;
        }
        let fetcher = Arc::downgrade(self);
        let cadence = self.subscribe();
        let interval = move || refresh_interval(&cadence.borrow());
        let first_delay = interval();
        *background = Some(RepeatingTask::spawn(
            "config-refresh",
            first_delay,
            interval,
            move || {
                let fetcher = fetcher.upgrade();
                async move {
                    if let Some(fetcher) = fetcher {
                        fetcher.refresh_in_background().await;
                    }
                }
            },
        ));
    }

    pub async fn shutdown(&self) {
        let background = self.background.lock().unwrap().take();
        if let Some(task) = background {
            task.shutdown().await;
        }
    }
}

/// Time between configuration refreshes for `flush`
pub fn refresh_interval(flush: &FlushConfig) -> Duration {
    Duration::from_millis(flush.flush_frequency.max(flush.flush_refresh_delay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    const CONTENT: &str = "https://1.content.test";

    fn setup() -> (Arc<ScriptedTransport>, LocalStore, Arc<Profile>, ConfigFetcher) {
        let store = LocalStore::in_memory().unwrap();
        store.set_internal_user_id("abc", "u1").unwrap();
        store.set_user("u1", user::FIRST_SESSION, &1_000i64).unwrap();
        store.set_user("u1", user::SEQNUM, &0u64).unwrap();
        let profile = Arc::new(Profile::load(store.clone(), "abc").unwrap());

        let transport = Arc::new(ScriptedTransport::new());
        let fetcher = ConfigFetcher::new(
            store.clone(),
            profile.clone(),
            transport.clone(),
            ResourcesSettings {
                content_url: CONTENT.to_string(),
                api_key: "web_sdk-key".to_string(),
                app_version: "1.0".to_string(),
            },
            ClientInfo::collect(Some("English (UK)")),
        );
        (transport, store, profile, fetcher)
    }

    #[test]
    fn test_request_url_params() {
        let (_, _, profile, fetcher) = setup();
        let url = fetcher.request_url();

        assert!(url.starts_with("https://1.content.test/api/1/user_resources_and_campaigns?"));
        assert!(url.contains("api_key=web_sdk-key"));
        assert!(url.contains("app_store=web"));
        assert!(url.contains("joined=1000"));
        assert!(url.contains("language=English%20%28UK%29"));
        assert!(url.contains("orientation=both"));
        assert!(url.contains("user=u1"));
        assert!(url.contains("version=7"));
        assert!(!url.contains("etag="));

        profile.set_etag("\"abc\"").unwrap();
        assert!(fetcher.request_url().ends_with("etag=%22abc%22"));
    }

    #[tokio::test]
    async fn test_successful_fetch_is_cached() {
        let (transport, store, profile, fetcher) = setup();
        transport.respond(
            "/user_resources_and_campaigns",
            HttpResponse::new(
                200,
                r#"{"flush_frequency": 30000, "flush_refresh_delay": 2000, "qa": {}, "web_push_public_key": "BKey"}"#,
            )
            .with_etag("\"v1\""),
        );

        let info = fetcher.get_info_for_session().await;
        assert_eq!(info.flush.flush_frequency, 30_000);
        assert_eq!(info.flush.flush_refresh_delay, 2_000);
        assert!(info.qa);
        assert_eq!(info.web_push_public_key.as_deref(), Some("BKey"));
        assert_eq!(fetcher.current(), info.flush);

        assert!(profile.is_qa());
        assert_eq!(profile.etag().as_deref(), Some("\"v1\""));
        assert_eq!(
            store.get_user::<u64>("u1", user::LAST_FLUSH_FREQUENCY).unwrap(),
            Some(30_000)
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_uses_cache_then_defaults() {
        let (transport, store, _, fetcher) = setup();
        transport.fail("/user_resources_and_campaigns");
        let info = fetcher.get_info_for_session().await;
        assert_eq!(info.flush, FlushConfig::default());
        assert_eq!(info.flush.flush_frequency, 60_000);
        assert_eq!(info.flush.flush_refresh_delay, 5_000);

        store.set_user("u1", user::LAST_FLUSH_FREQUENCY, &10_000u64).unwrap();
        store.set_user("u1", user::LAST_FLUSH_REFRESH_DELAY, &1_000u64).unwrap();
        transport.respond("/user_resources_and_campaigns", HttpResponse::new(500, "down"));
        let info = fetcher.get_info_for_session().await;
        assert_eq!(info.flush.flush_frequency, 10_000);
        assert_eq!(info.flush.flush_refresh_delay, 1_000);
    }

    #[tokio::test]
    async fn test_not_modified_keeps_cache() {
        let (transport, store, _, fetcher) = setup();
        store.set_user("u1", user::LAST_FLUSH_FREQUENCY, &20_000u64).unwrap();
        transport.respond("/user_resources_and_campaigns", HttpResponse::new(200, "{}"));
        transport.respond("/user_resources_and_campaigns", HttpResponse::new(304, ""));

        for _ in 0..2 {
            let info = fetcher.get_info_for_session().await;
            assert_eq!(info.flush.flush_frequency, 20_000);
        }
    }

    #[tokio::test]
    async fn test_etag_without_cached_config_is_dropped() {
        let (transport, store, profile, fetcher) = setup();
        profile.set_etag("\"stale\"").unwrap();
        assert!(!store.has_user("u1", user::LAST_FLUSH_REFRESH_DELAY).unwrap());
        transport.always("/user_resources_and_campaigns", HttpResponse::new(304, ""));

        fetcher.get_info_for_session().await;

        let requests = transport.requests_to("/user_resources_and_campaigns");
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].url.contains("etag="));
        assert!(profile.etag().is_none());
        assert!(!store.has_user("u1", user::LAST_ETAG).unwrap());
    }

    #[tokio::test]
    async fn test_etag_kept_when_config_cached() {
        let (transport, store, profile, fetcher) = setup();
        profile.set_etag("\"v1\"").unwrap();
        store.set_user("u1", user::LAST_FLUSH_REFRESH_DELAY, &5_000u64).unwrap();
        transport.always("/user_resources_and_campaigns", HttpResponse::new(304, ""));

        fetcher.get_info_for_session().await;
        assert!(transport.requests()[0].url.contains("etag=%22v1%22"));
    }

    #[test]
    fn test_refresh_interval_never_below_delay() {
        let flush = FlushConfig {
            flush_frequency: 1_000,
            flush_refresh_delay: 5_000,
        };
        assert_eq!(refresh_interval(&flush), Duration::from_millis(5_000));
        assert_eq!(
            refresh_interval(&FlushConfig::default()),
            Duration::from_millis(60_000)
        );
    }
}
