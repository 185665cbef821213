//! Core domain types for pulsekit
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **External user id** | Caller-supplied identifier, opaque to the SDK |
//! | **User id** | Server-issued identifier returned by identify, used on every event |
//! | **Seqnum** | Per-user monotonic counter stamped on every event |
//! | **Flush** | Shipping queued events to the collector and clearing them locally |
//! | **QA shadow event** | Immediately-sent copy of an event for users flagged QA |
//!
//! Queued events serialize to the collector's wire shape: a flat JSON object
//! with a `type` tag, `seqnum`, `time` and the type-specific fields.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default milliseconds between background flushes
pub const DEFAULT_FLUSH_FREQUENCY_MS: u64 = 60_000;

/// Default minimum milliseconds between configuration refreshes
pub const DEFAULT_FLUSH_REFRESH_DELAY_MS: u64 = 5_000;

/// Event schema version sent with every batch
pub const EVENT_SCHEMA_VERSION: u32 = 3;

/// Prefix reserved for events the SDK emits on its own
pub const INTERNAL_EVENT_PREFIX: &str = "Pulse.";

/// Name of the event queued the first time a user starts a session
pub const FIRST_SESSION_EVENT_NAME: &str = "Pulse.first_session";

/// App store reported in events and resource requests
pub const APP_STORE: &str = "web";

// ============================================
// Queued events
// ============================================

/// Wire tag of a queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    Event,
    /// User attribute update; the collector calls this type `user`
    #[serde(rename = "user")]
    UserUpdate,
    Purchase,
    CurrencyGiven,
    Iap,
    DeviceUpdate,
    GenericCampaignEvent,
    QaLogEvent,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::Event => "event",
            EventType::UserUpdate => "user",
            EventType::Purchase => "purchase",
            EventType::CurrencyGiven => "currency_given",
            EventType::Iap => "iap",
            EventType::DeviceUpdate => "device_update",
            EventType::GenericCampaignEvent => "generic_campaign_event",
            EventType::QaLogEvent => "qa_log_event",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribute map carried by user and device updates
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Reward granted as part of an in-app purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    pub amount: f64,
    #[serde(rename = "type")]
    pub reward_type: String,
}

/// Campaign kinds understood by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignType {
    Push,
}

/// Actions reported for a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Impression,
    Engaged,
    ButtonClick,
    Influenced,
}

/// Details of a QA log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaLogDetails {
    /// Type of the event being mirrored
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub parameters: serde_json::Value,
    pub seqnum: u64,
    pub client_time: i64,
}

/// Type-specific body of a queued event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Event {
        name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    #[serde(rename = "user")]
    UserUpdate { attributes: Attributes },
    Purchase {
        item: String,
        currency: String,
        cost: f64,
        quantity: u32,
    },
    CurrencyGiven {
        given_currency: String,
        given_amount: f64,
    },
    Iap {
        app_store: String,
        cost: f64,
        local_currency: String,
        product_id: String,
        quantity: u32,
        #[serde(default)]
        rewards: BTreeMap<String, Reward>,
    },
    DeviceUpdate { attributes: Attributes },
    GenericCampaignEvent {
        #[serde(rename = "actionType")]
        action_type: ActionType,
        #[serde(rename = "campaignType")]
        campaign_type: CampaignType,
        #[serde(rename = "campaignId")]
        campaign_id: i64,
        id: i64,
    },
    QaLogEvent {
        log_source: String,
        log_type: String,
        log_details: QaLogDetails,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::SessionStart { .. } => EventType::SessionStart,
            EventKind::Event { .. } => EventType::Event,
            EventKind::UserUpdate { .. } => EventType::UserUpdate,
            EventKind::Purchase { .. } => EventType::Purchase,
            EventKind::CurrencyGiven { .. } => EventType::CurrencyGiven,
            EventKind::Iap { .. } => EventType::Iap,
            EventKind::DeviceUpdate { .. } => EventType::DeviceUpdate,
            EventKind::GenericCampaignEvent { .. } => EventType::GenericCampaignEvent,
            EventKind::QaLogEvent { .. } => EventType::QaLogEvent,
        }
    }
}

/// One user or system action, immutable once queued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Profile sequence number claimed at construction
    pub seqnum: u64,
    /// Construction time, ms since epoch
    pub time: i64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl QueuedEvent {
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

// ============================================
// Session configuration
// ============================================

/// Background flush cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushConfig {
    /// Milliseconds between background flush attempts
    pub flush_frequency: u64,
    /// Minimum milliseconds before the configuration itself is re-fetched
    pub flush_refresh_delay: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            flush_frequency: DEFAULT_FLUSH_FREQUENCY_MS,
            flush_refresh_delay: DEFAULT_FLUSH_REFRESH_DELAY_MS,
        }
    }
}

/// Everything the resources endpoint tells a session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionInfo {
    pub flush: FlushConfig,
    pub qa: bool,
    pub web_push_public_key: Option<String>,
}

// ============================================
// Push bridge
// ============================================

/// Lifecycle stage of a captured push notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEventType {
    Received,
    Clicked,
    Closed,
}

impl PushEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushEventType::Received => "received",
            PushEventType::Clicked => "clicked",
            PushEventType::Closed => "closed",
        }
    }
}

impl std::str::FromStr for PushEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(PushEventType::Received),
            "clicked" => Ok(PushEventType::Clicked),
            "closed" => Ok(PushEventType::Closed),
            _ => Err(format!("unknown push event type: {}", s)),
        }
    }
}

/// A push lifecycle event recorded by the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEventRecord {
    /// Worker store row id
    pub id: i64,
    pub event_type: PushEventType,
    /// Event name referencing the campaign, e.g. `Pulse.Messages.Push-42.delivered`
    pub event: String,
    pub campaign_id: Option<i64>,
    /// The worker's current user at capture time
    pub user_id: String,
    /// Capture time, ms since epoch
    pub timestamp: i64,
}

/// A user known to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerUser {
    pub user_id: String,
    /// Last time the page marked this user current, ms since epoch
    pub last_active: i64,
}

/// Name of the event recorded when a campaign's push is delivered
pub fn push_delivered_event_name(campaign_id: i64) -> String {
    format!("{}Messages.Push-{}.delivered", INTERNAL_EVENT_PREFIX, campaign_id)
}

/// Name of the event recorded when a campaign's push is engaged
pub fn push_engaged_event_name(campaign_id: i64) -> String {
    format!("{}Messages.Push-{}.engaged", INTERNAL_EVENT_PREFIX, campaign_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_named_event_wire_shape() {
        let event = QueuedEvent {
            seqnum: 4,
            time: 1_700_000_000_000,
            kind: EventKind::Event {
                name: "level_up".to_string(),
                payload: json!({"level": "2"}),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "event",
                "seqnum": 4,
                "time": 1_700_000_000_000i64,
                "name": "level_up",
                "payload": {"level": "2"},
            })
        );
    }

    #[test]
    fn test_user_update_uses_collector_tag() {
        let mut attributes = Attributes::new();
        attributes.insert("plan".to_string(), json!("pro"));
        let event = QueuedEvent {
            seqnum: 0,
            time: 1,
            kind: EventKind::UserUpdate { attributes },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(value["attributes"]["plan"], "pro");
        assert_eq!(event.event_type().as_str(), "user");
    }

    #[test]
    fn test_campaign_event_field_names() {
        let event = QueuedEvent {
            seqnum: 2,
            time: 5,
            kind: EventKind::GenericCampaignEvent {
                action_type: ActionType::Engaged,
                campaign_type: CampaignType::Push,
                campaign_id: 77,
                id: 3,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["actionType"], "engaged");
        assert_eq!(value["campaignType"], "push");
        assert_eq!(value["campaignId"], 77);

        let back: QueuedEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_push_event_names() {
        assert_eq!(push_delivered_event_name(12), "Pulse.Messages.Push-12.delivered");
        assert_eq!(push_engaged_event_name(12), "Pulse.Messages.Push-12.engaged");
    }

    #[test]
    fn test_push_event_type_parse() {
        assert_eq!("clicked".parse::<PushEventType>(), Ok(PushEventType::Clicked));
        assert!("opened".parse::<PushEventType>().is_err());
    }
}
