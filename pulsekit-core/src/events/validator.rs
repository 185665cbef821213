//! Argument checks for the public event API
//!
//! Rejections are logged and returned as [`Error::InvalidEvent`]; nothing is
//! queued and no sequence number is consumed.

use crate::error::{Error, Result};
use crate::types::{Attributes, Reward};
use std::collections::BTreeMap;

/// Name prefixes reserved for SDK-generated events
const RESERVED_PREFIXES: [&str; 2] = ["Pulse.", "pulse."];

fn reject(message: String) -> Error {
    tracing::error!(reason = %message, "Event will not be queued");
    Error::InvalidEvent(message)
}

/// Custom event names may not be empty or use a reserved prefix
pub fn validate_event_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(reject("event name is empty".to_string()));
    }
    if let Some(prefix) = RESERVED_PREFIXES.iter().find(|p| name.starts_with(*p)) {
        return Err(reject(format!(
            "event names cannot begin with '{}': {}",
            prefix, name
        )));
    }
    Ok(())
}

pub fn validate_user_update(attributes: &Attributes) -> Result<()> {
    if attributes.is_empty() {
        return Err(reject(
            "user update needs at least one key/value pair".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_user_update_with_date(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(reject("user update with date needs a name".to_string()));
    }
    Ok(())
}

pub fn validate_purchase(item: &str, currency: &str, cost: f64, quantity: u32) -> Result<()> {
    if item.is_empty() || currency.is_empty() {
        return Err(reject("purchase needs an item and a currency".to_string()));
    }
    if !(cost.is_finite() && cost > 0.0) || quantity == 0 {
        return Err(reject(format!(
            "purchase needs a positive cost and quantity (cost={}, quantity={})",
            cost, quantity
        )));
    }
    Ok(())
}

pub fn validate_currency_given(currency: &str, amount: f64) -> Result<()> {
    if currency.is_empty() || !(amount.is_finite() && amount != 0.0) {
        return Err(reject(
            "currency given needs a currency and a non-zero amount".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_iap(
    product_id: &str,
    local_currency: &str,
    cost: f64,
    quantity: u32,
    rewards: &BTreeMap<String, Reward>,
) -> Result<()> {
    if product_id.is_empty() || local_currency.is_empty() {
        return Err(reject(
            "iap needs a product id and a local currency".to_string(),
        ));
    }
    if !(cost.is_finite() && cost > 0.0) || quantity == 0 {
        return Err(reject("iap needs a positive cost and quantity".to_string()));
    }
    if let Some((name, _)) = rewards.iter().find(|(_, r)| r.reward_type.is_empty()) {
        return Err(reject(format!("iap reward '{}' has no type", name)));
    }
    Ok(())
}

pub fn validate_campaign_ids(campaign_id: i64, id: i64) -> Result<()> {
    if campaign_id <= 0 || id < 0 {
        return Err(reject(format!(
            "campaign event needs a positive campaign id (campaign_id={}, id={})",
            campaign_id, id
        )));
    }
    Ok(())
}
