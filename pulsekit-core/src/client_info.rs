//! Host and device description
//!
//! Reported once per session as a `device_update` and reused for the
//! resources request query string.

use chrono::{Local, Offset};
use serde_json::json;

use crate::types::{Attributes, APP_STORE};

/// SDK version reported to the collector
pub const SDK_VERSION: &str = concat!("Rust ", env!("CARGO_PKG_VERSION"));

const UNKNOWN: &str = "Unknown";

/// Device-update attribute names
pub mod attr {
    pub const APP_STORE: &str = "pulse.app_store";
    pub const DEVICE_ID: &str = "pulse.device_id";
    pub const DEVICE_NAME: &str = "pulse.device_name";
    pub const INSTALL_DATE: &str = "pulse.install_date";
    pub const LANGUAGE: &str = "pulse.language";
    pub const OS: &str = "pulse.os";
    pub const OS_VERSION: &str = "pulse.os_version";
    pub const SDK_VERSION: &str = "pulse.sdk_version";
    pub const TIMEZONE_NAME: &str = "pulse.timezone_name";
    pub const UTC_OFFSET_SECONDS: &str = "pulse.utc_offset_seconds";
    pub const DEVICE_WIDTH: &str = "pulse.device_width";
    pub const DEVICE_HEIGHT: &str = "pulse.device_height";
    pub const PUSH_TOKEN: &str = "pulse.web_push_token";
    pub const PUSH_PERMISSION: &str = "pulse.permission.web.push_notifications";
}

/// What the SDK knows about the host it runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub os: String,
    pub os_version: String,
    pub device_name: String,
    pub language: String,
    pub timezone_name: String,
    pub utc_offset_seconds: i32,
    /// Screen size when known (width, height)
    pub screen: Option<(u32, u32)>,
}

impl ClientInfo {
    /// Describe the current host; `language` overrides the locale lookup
    pub fn collect(language: Option<&str>) -> Self {
        let os = std::env::consts::OS.to_string();
        let os_version = std::env::consts::ARCH.to_string();
        let device_name = format!("{} {}", os, std::env::consts::ARCH);

        let language = language
            .map(str::to_string)
            .or_else(locale_language)
            .unwrap_or_else(|| UNKNOWN.to_string());

        let timezone_name = std::env::var("TZ")
            .ok()
            .filter(|tz| !tz.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let utc_offset_seconds = Local::now().offset().fix().local_minus_utc();

        Self {
            os,
            os_version,
            device_name,
            language,
            timezone_name,
            utc_offset_seconds,
            screen: None,
        }
    }

    pub fn device_width(&self) -> String {
        self.screen
            .map(|(w, _)| w.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    pub fn device_height(&self) -> String {
        self.screen
            .map(|(_, h)| h.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// Attributes of the session's `device_update` event
    pub fn device_attributes(&self, device_id: &str, install_date: Option<&str>) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(attr::DEVICE_ID.to_string(), json!(device_id));
        attributes.insert(attr::DEVICE_NAME.to_string(), json!(self.device_name));
        attributes.insert(attr::OS.to_string(), json!(self.os));
        attributes.insert(attr::OS_VERSION.to_string(), json!(self.os_version));
        attributes.insert(attr::SDK_VERSION.to_string(), json!(SDK_VERSION));
        attributes.insert(attr::LANGUAGE.to_string(), json!(self.language));
        attributes.insert(attr::TIMEZONE_NAME.to_string(), json!(self.timezone_name));
        attributes.insert(
            attr::UTC_OFFSET_SECONDS.to_string(),
            json!(self.utc_offset_seconds),
        );
        attributes.insert(attr::APP_STORE.to_string(), json!(APP_STORE));
        if let Some((width, height)) = self.screen {
            attributes.insert(attr::DEVICE_WIDTH.to_string(), json!(width));
            attributes.insert(attr::DEVICE_HEIGHT.to_string(), json!(height));
        }
        if let Some(install_date) = install_date {
            attributes.insert(attr::INSTALL_DATE.to_string(), json!(install_date));
        }
        attributes
    }
}

/// Language part of the POSIX locale, e.g. `en` from `en_US.UTF-8`
fn locale_language() -> Option<String> {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.is_empty() && value != "C" && value != "POSIX")
        .and_then(|value| parse_locale_language(&value))
}

fn parse_locale_language(locale: &str) -> Option<String> {
    let language = locale
        .split(['_', '.', '@', '-'])
        .next()
        .filter(|l| !l.is_empty())?;
    Some(language.to_lowercase())
}
