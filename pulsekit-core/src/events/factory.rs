//! Event construction
//!
//! Builders are pure: the caller supplies the sequence number and time so
//! that claiming a seqnum stays a single synchronous step.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::types::{
    ActionType, Attributes, CampaignType, EventKind, QaLogDetails, QueuedEvent, Reward, APP_STORE,
};

/// `log_source` of every QA log entry
pub const QA_LOG_SOURCE: &str = "sdk";
/// `log_type` of a mirrored event
pub const QA_LOG_TYPE_EVENT: &str = "event";
/// `log_type` of a push engagement
pub const QA_LOG_TYPE_PUSH_ENGAGED: &str = "push-engaged";

fn event(seqnum: u64, time: i64, kind: EventKind) -> QueuedEvent {
    QueuedEvent { seqnum, time, kind }
}

pub fn session_start(seqnum: u64, time: i64) -> QueuedEvent {
    event(
        seqnum,
        time,
        EventKind::SessionStart {
            name: None,
            payload: json!({}),
        },
    )
}

/// Named event; a missing payload is sent as `{}`
pub fn named_event(seqnum: u64, time: i64, name: &str, payload: Option<Value>) -> QueuedEvent {
    event(
        seqnum,
        time,
        EventKind::Event {
            name: name.to_string(),
            payload: payload.unwrap_or_else(|| json!({})),
        },
    )
}

pub fn user_update(seqnum: u64, time: i64, attributes: Attributes) -> QueuedEvent {
    event(seqnum, time, EventKind::UserUpdate { attributes })
}

/// User update carrying `{name, date}` with the date in collector format
pub fn user_update_with_date(seqnum: u64, time: i64, name: &str, date: DateTime<Utc>) -> QueuedEvent {
    let mut attributes = Attributes::new();
    attributes.insert("name".to_string(), json!(name));
    attributes.insert("date".to_string(), json!(format_attribute_date(date)));
    user_update(seqnum, time, attributes)
}

pub fn device_update(seqnum: u64, time: i64, attributes: Attributes) -> QueuedEvent {
    event(seqnum, time, EventKind::DeviceUpdate { attributes })
}

pub fn purchase(
    seqnum: u64,
    time: i64,
    item: &str,
    currency: &str,
    cost: f64,
    quantity: u32,
) -> QueuedEvent {
    event(
        seqnum,
        time,
        EventKind::Purchase {
            item: item.to_string(),
            currency: currency.to_string(),
            cost,
            quantity,
        },
    )
}

pub fn currency_given(seqnum: u64, time: i64, currency: &str, amount: f64) -> QueuedEvent {
    event(
        seqnum,
        time,
        EventKind::CurrencyGiven {
            given_currency: currency.to_string(),
            given_amount: amount,
        },
    )
}

pub fn iap(
    seqnum: u64,
    time: i64,
    rewards: BTreeMap<String, Reward>,
    local_currency: &str,
    cost: f64,
    quantity: u32,
    product_id: &str,
) -> QueuedEvent {
    event(
        seqnum,
        time,
        EventKind::Iap {
            app_store: APP_STORE.to_string(),
            cost,
            local_currency: local_currency.to_string(),
            product_id: product_id.to_string(),
            quantity,
            rewards,
        },
    )
}

pub fn generic_campaign_event(
    seqnum: u64,
    time: i64,
    campaign_type: CampaignType,
    campaign_id: i64,
    id: i64,
    action_type: ActionType,
) -> QueuedEvent {
    event(
        seqnum,
        time,
        EventKind::GenericCampaignEvent {
            action_type,
            campaign_type,
            campaign_id,
            id,
        },
    )
}

// ============================================
// QA shadow events
// ============================================

fn qa_wrapped(source: &QueuedEvent, log_type: &str, parameters: Value) -> QueuedEvent {
    event(
        source.seqnum,
        source.time,
        EventKind::QaLogEvent {
            log_source: QA_LOG_SOURCE.to_string(),
            log_type: log_type.to_string(),
            log_details: QaLogDetails {
                event_type: source.event_type(),
                parameters,
                seqnum: source.seqnum,
                client_time: source.time,
            },
        },
    )
}

/// QA mirror of `source`, or `None` for kinds the QA log does not track
pub fn qa_event(source: &QueuedEvent) -> Option<QueuedEvent> {
    let parameters = match &source.kind {
        EventKind::SessionStart { name: None, .. } => json!({}),
        EventKind::SessionStart {
            name: Some(name),
            payload,
        }
        | EventKind::Event { name, payload } => json!({ "name": name, "payload": payload }),
        EventKind::UserUpdate { attributes } | EventKind::DeviceUpdate { attributes } => {
            json!({ "attributes": attributes })
        }
        EventKind::Purchase {
            item,
            currency,
            cost,
            quantity,
        } => json!({
            "cost": cost,
            "currency": currency,
            "item": item,
            "quantity": quantity,
        }),
        EventKind::CurrencyGiven {
            given_currency,
            given_amount,
        } => json!({
            "given_amount": given_amount,
            "given_currency": given_currency,
        }),
        EventKind::Iap {
            app_store,
            cost,
            local_currency,
            product_id,
            quantity,
            rewards,
        } => json!({
            "app_store": app_store,
            "cost": cost,
            "local_currency": local_currency,
            "product_id": product_id,
            "quantity": quantity,
            "rewards": rewards,
        }),
        EventKind::GenericCampaignEvent { .. } | EventKind::QaLogEvent { .. } => return None,
    };
    Some(qa_wrapped(source, QA_LOG_TYPE_EVENT, parameters))
}

/// QA log entry for a push engagement
pub fn qa_push_engaged(source: &QueuedEvent, campaign_id: i64, deeplink: Option<&str>) -> QueuedEvent {
    qa_wrapped(
        source,
        QA_LOG_TYPE_PUSH_ENGAGED,
        json!({
            "campaign_id": campaign_id,
            "payload": { "deeplink": deeplink },
        }),
    )
}

// ============================================
// Date formats
// ============================================

/// `YYYY-MM-DDTHH:MM:SS.sssZ`
pub fn format_attribute_date(date: DateTime<Utc>) -> String {
    date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// `YYYYMMDD`
pub fn format_install_date(date: DateTime<Utc>) -> String {
    date.format("%Y%m%d").to_string()
}
