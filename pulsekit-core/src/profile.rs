//! User identity and per-user counters
//!
//! A [`Profile`] maps the caller's external user id to the server-issued
//! user id. Stored profiles resolve without any network call; otherwise the
//! session has to [`Profile::identify`] before anything else can run.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::storage::{user, LocalStore};
use crate::transport::Transport;

/// Point-in-time copy of the profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSnapshot {
    pub external_user_id: String,
    pub user_id: Option<String>,
    /// ms since epoch, set once
    pub first_session: Option<i64>,
    /// ms since epoch, updated at session end
    pub last_session: Option<i64>,
    /// Next sequence number to stamp
    pub seqnum: u64,
    pub etag: Option<String>,
    pub qa: bool,
    pub identity_resolved: bool,
}

/// Parameters of the identify call
#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub identify_url: String,
    pub api_key: String,
    pub unique_device_id: String,
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    swrve_id: String,
}

/// Identity and counters for one external user
pub struct Profile {
    store: LocalStore,
    state: Mutex<ProfileSnapshot>,
}

impl Profile {
    /// Resolve the profile for `external_user_id` from the store.
    ///
    /// The profile is resolved only when the user id, first session and
    /// sequence number are all present.
    pub fn load(store: LocalStore, external_user_id: &str) -> Result<Self> {
        let mut state = ProfileSnapshot {
            external_user_id: external_user_id.to_string(),
            user_id: None,
            first_session: None,
            last_session: None,
            seqnum: 0,
            etag: None,
            qa: false,
            identity_resolved: false,
        };

        if let Some(user_id) = store.internal_user_id(external_user_id)? {
            let first_session: Option<i64> = store.get_user(&user_id, user::FIRST_SESSION)?;
            let seqnum: Option<u64> = store.get_user(&user_id, user::SEQNUM)?;

            if let (Some(first_session), Some(seqnum)) = (first_session, seqnum) {
                state.last_session = store.get_user(&user_id, user::LAST_SESSION)?;
                state.etag = store.get_user(&user_id, user::LAST_ETAG)?;
                state.qa = store.get_user(&user_id, user::QA_STATUS)?.unwrap_or(false);
                state.first_session = Some(first_session);
                state.seqnum = seqnum;
                state.identity_resolved = true;

                tracing::info!(
                    user_id = %user_id,
                    external_user_id,
                    seqnum,
                    "Profile restored from storage"
                );
                state.user_id = Some(user_id);
            } else {
                tracing::warn!(
                    user_id = %user_id,
                    "Stored profile is incomplete, identify required"
                );
            }
        } else {
            tracing::info!(external_user_id, "No stored profile, identify required");
        }

        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Ask the identity service for a user id and persist a fresh profile.
    ///
    /// Any non-200 response, unparseable body or transport error leaves the
    /// profile unresolved and returns [`Error::Identity`].
    pub async fn identify(&self, transport: &dyn Transport, request: &IdentifyRequest) -> Result<()> {
        let external_user_id = self.external_user_id();
        let candidate = uuid::Uuid::new_v4().to_string();
        let body = json!({
            "api_key": request.api_key,
            "swrve_id": candidate,
            "external_user_id": external_user_id,
            "unique_device_id": request.unique_device_id,
        });

        let response = match transport.post_json(&request.identify_url, &body).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Identify request failed");
                return Err(Error::Identity(e.to_string()));
            }
        };

        if response.status != 200 {
            tracing::error!(
                status = response.status,
                body = %response.body,
                "Identify failed"
            );
            return Err(Error::Identity(format!(
                "identify returned status {}",
                response.status
            )));
        }

        let parsed: IdentifyResponse = serde_json::from_str(&response.body).map_err(|e| {
            tracing::error!(error = %e, body = %response.body, "Identify response unreadable");
            Error::Identity(format!("unreadable identify response: {}", e))
        })?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut state = self.state.lock().unwrap();
        state.user_id = Some(parsed.swrve_id);
        state.first_session = Some(now);
        state.last_session = None;
        state.seqnum = 0;
        state.etag = None;
        state.qa = false;
        state.identity_resolved = true;
        self.persist(&state)?;

        tracing::info!(
            user_id = state.user_id.as_deref().unwrap_or_default(),
            external_user_id = %state.external_user_id,
            "Identity resolved"
        );
        Ok(())
    }

    fn persist(&self, state: &ProfileSnapshot) -> Result<()> {
        let Some(user_id) = state.user_id.as_deref() else {
            return Ok(());
        };
        self.store
            .set_internal_user_id(&state.external_user_id, user_id)?;
        self.store.set_user(user_id, user::SEQNUM, &state.seqnum)?;
        self.store.set_user(user_id, user::QA_STATUS, &state.qa)?;
        if let Some(first_session) = state.first_session {
            self.store
                .set_user(user_id, user::FIRST_SESSION, &first_session)?;
        }
        if let Some(last_session) = state.last_session {
            self.store.set_user(user_id, user::LAST_SESSION, &last_session)?;
        }
        if let Some(etag) = &state.etag {
            self.store.set_user(user_id, user::LAST_ETAG, etag)?;
        }
        Ok(())
    }

    fn resolved_user<'a>(state: &'a ProfileSnapshot) -> Result<&'a str> {
        match (&state.user_id, state.identity_resolved) {
            (Some(user_id), true) => Ok(user_id),
            _ => Err(Error::Identity("profile is not resolved".to_string())),
        }
    }

    // ============================================
    // Sequence numbers
    // ============================================

    /// Increment the counter and return its new value. The counter is
    /// persisted before returning.
    pub fn update_seqnum(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let user_id = Self::resolved_user(&state)?.to_string();
        state.seqnum += 1;
        self.store.set_user(&user_id, user::SEQNUM, &state.seqnum)?;
        Ok(state.seqnum)
    }

    /// Claim the sequence number for the next event
    pub fn next_seqnum(&self) -> Result<u64> {
        Ok(self.update_seqnum()? - 1)
    }

    /// Run `write` with the next sequence number while the profile stays
    /// locked, so events land in storage in seqnum order. The counter only
    /// advances when `write` succeeds.
    pub fn with_next_seqnum<T, F>(&self, write: F) -> Result<T>
    where
        F: FnOnce(u64) -> Result<T>,
    {
        let mut state = self.state.lock().unwrap();
        let user_id = Self::resolved_user(&state)?.to_string();
        let written = write(state.seqnum)?;
        state.seqnum += 1;
        self.store.set_user(&user_id, user::SEQNUM, &state.seqnum)?;
        Ok(written)
    }

    // ============================================
    // Session lifecycle
    // ============================================

    /// Stamp the session end and persist a full snapshot
    pub fn save_before_session_end(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.identity_resolved {
            return Ok(());
        }
        state.last_session = Some(chrono::Utc::now().timestamp_millis());
        self.persist(&state)
    }

    pub fn set_etag(&self, etag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.etag = Some(etag.to_string());
        if let Some(user_id) = state.user_id.clone() {
            self.store.set_user(&user_id, user::LAST_ETAG, etag)?;
        }
        Ok(())
    }

    pub fn clear_etag(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.etag = None;
        if let Some(user_id) = state.user_id.clone() {
            self.store.remove_user(&user_id, user::LAST_ETAG)?;
        }
        Ok(())
    }

    pub fn set_qa(&self, qa: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.qa = qa;
        if let Some(user_id) = state.user_id.clone() {
            self.store.set_user(&user_id, user::QA_STATUS, &qa)?;
        }
        Ok(())
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn snapshot(&self) -> ProfileSnapshot {
        self.state.lock().unwrap().clone()
    }

    pub fn external_user_id(&self) -> String {
        self.state.lock().unwrap().external_user_id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().unwrap().user_id.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().unwrap().identity_resolved
    }

    pub fn is_qa(&self) -> bool {
        self.state.lock().unwrap().qa
    }

    pub fn etag(&self) -> Option<String> {
        self.state.lock().unwrap().etag.clone()
    }

    pub fn seqnum(&self) -> u64 {
        self.state.lock().unwrap().seqnum
    }

    pub fn first_session(&self) -> Option<i64> {
        self.state.lock().unwrap().first_session
    }

    pub fn last_session(&self) -> Option<i64> {
        self.state.lock().unwrap().last_session
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }
}
