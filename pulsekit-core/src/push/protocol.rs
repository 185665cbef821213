//! Messages exchanged between the page and the push worker
//!
//! Requests travel over the worker's mailbox together with a one-shot reply
//! handle. Push lifecycle notices go the other way, broadcast to every
//! listening page.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::types::{PushEventRecord, WorkerUser};

/// Page to worker request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PageRequest {
    /// Mark `user_id` as the worker's current user
    SetUserSession { user_id: String },
    /// Hand over, then forget, every captured event for `user_id`
    FetchPushData { user_id: String },
}

/// Worker to page reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WorkerReply {
    UserSession(WorkerUser),
    /// Records sorted by timestamp, oldest first
    PushData(Vec<PushEventRecord>),
    Error(String),
}

/// A request plus where to send its reply
#[derive(Debug)]
pub struct Envelope {
    pub request: PageRequest,
    pub reply: oneshot::Sender<WorkerReply>,
}

/// Notification content carried by a push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    /// Campaign id (`_p`)
    pub campaign_id: i64,
    pub title: String,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub image: Option<String>,
    /// Deep link (`_sd`) opened on click
    pub deeplink: Option<String>,
    /// Custom key/values attached by the campaign
    pub custom_payload: Option<serde_json::Value>,
}

impl PushPayload {
    /// Parse a push message body. Messages without a campaign id are not
    /// ours and yield `None`.
    ///
    /// ```json
    /// {"title": "...", "body": "...", "icon": "...", "image": "...",
    ///  "payload": {...}, "data": {"pulse": {"_p": 42, "_sd": "app://x"}}}
    /// ```
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let meta = value.get("data")?.get("pulse")?;
        let campaign_id = match meta.get("_p")? {
            serde_json::Value::Number(n) => n.as_i64()?,
            serde_json::Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let text = |v: &serde_json::Value, key: &str| {
            v.get(key).and_then(|x| x.as_str()).map(str::to_string)
        };

        Some(Self {
            campaign_id,
            title: text(meta, "title")
                .or_else(|| text(value, "title"))
                .unwrap_or_default(),
            body: text(value, "body"),
            icon: text(value, "icon"),
            image: text(value, "image"),
            deeplink: text(meta, "_sd"),
            custom_payload: value.get("payload").cloned(),
        })
    }
}

/// Browser-originated events delivered to the worker
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserEvent {
    Push(PushPayload),
    NotificationClick(PushPayload),
    NotificationClose(PushPayload),
}

/// Everything the worker's mailbox carries
#[derive(Debug)]
pub enum WorkerInput {
    Message(Envelope),
    Browser(BrowserEvent),
}

/// Worker to page broadcast about a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PushReceived {
        id: i64,
    },
    PushClicked {
        id: i64,
        deeplink: Option<String>,
        custom_payload: Option<serde_json::Value>,
    },
    PushClosed,
}
