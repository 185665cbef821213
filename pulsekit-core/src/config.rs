//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/pulsekit/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/pulsekit/` (~/.config/pulsekit/)
//! - Data: `$XDG_DATA_HOME/pulsekit/` (~/.local/share/pulsekit/)
//! - State/Logs: `$XDG_STATE_HOME/pulsekit/` (~/.local/state/pulsekit/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// SDK identity and behavior
    #[serde(default)]
    pub sdk: SdkConfig,

    /// Push bridge tuning
    #[serde(default)]
    pub push: PushConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data center hosting the app
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Stack {
    #[default]
    Us,
    Eu,
}

impl Stack {
    fn host_prefix(&self) -> &'static str {
        match self {
            Stack::Us => "",
            Stack::Eu => "eu-",
        }
    }
}

/// Runtime mode; decides how chatty the default log filter is
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dev,
    Test,
    #[default]
    Prod,
}

impl Mode {
    /// Filter used when neither `RUST_LOG` nor `logging.level` is set
    pub fn default_log_filter(&self) -> &'static str {
        match self {
            Mode::Dev => "info",
            Mode::Test | Mode::Prod => "error",
        }
    }
}

/// SDK configuration, the `[sdk]` table
#[derive(Debug, Deserialize, Clone)]
pub struct SdkConfig {
    /// Numeric application id
    #[serde(default)]
    pub app_id: u64,

    /// API key, format `web_sdk-...`
    #[serde(default)]
    pub api_key: String,

    /// Caller-chosen user identifier
    #[serde(default)]
    pub external_user_id: String,

    #[serde(default)]
    pub stack: Stack,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Overrides the language reported by client info
    pub language: Option<String>,

    /// Seconds after which a resumed app starts a new session
    #[serde(default = "default_new_session_interval")]
    pub new_session_interval_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Register for push as part of session start
    #[serde(default)]
    pub auto_push_subscribe: bool,

    /// Worker script registered for push
    #[serde(default = "default_service_worker")]
    pub service_worker: String,

    /// Push subscriptions promise a visible notification for every push
    #[serde(default = "default_true")]
    pub user_visible_only: bool,

    #[serde(default)]
    pub mode: Mode,

    /// Collector base URL override
    pub api_url: Option<String>,

    /// Resources base URL override
    pub content_url: Option<String>,

    /// Identify endpoint override
    pub identify_url: Option<String>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            api_key: String::new(),
            external_user_id: String::new(),
            stack: Stack::default(),
            app_version: default_app_version(),
            language: None,
            new_session_interval_secs: default_new_session_interval(),
            http_timeout_secs: default_http_timeout(),
            auto_push_subscribe: false,
            service_worker: default_service_worker(),
            user_visible_only: true,
            mode: Mode::default(),
            api_url: None,
            content_url: None,
            identify_url: None,
        }
    }
}

fn default_app_version() -> String {
    "1.0".to_string()
}

fn default_new_session_interval() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    10
}

fn default_service_worker() -> String {
    "service_worker.js".to_string()
}

fn default_true() -> bool {
    true
}

const API_KEY_PREFIX: &str = "web_sdk-";

impl SdkConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.app_id == 0 {
            return Err(Error::Config("sdk.app_id must be a positive integer".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("sdk.api_key is required".to_string()));
        }
        if !self.api_key.starts_with(API_KEY_PREFIX) {
            return Err(Error::Config(format!(
                "sdk.api_key must start with '{}'",
                API_KEY_PREFIX
            )));
        }
        if self.external_user_id.trim().is_empty() {
            return Err(Error::Config("sdk.external_user_id is required".to_string()));
        }
        if !is_dotted_version(&self.app_version) {
            return Err(Error::Config(format!(
                "sdk.app_version '{}' must look like 1.2 or 1.2.3",
                self.app_version
            )));
        }
        if self.new_session_interval_secs == 0 {
            return Err(Error::Config(
                "sdk.new_session_interval_secs must be greater than 0".to_string(),
            ));
        }
        for (field, value) in [
            ("sdk.api_url", &self.api_url),
            ("sdk.content_url", &self.content_url),
            ("sdk.identify_url", &self.identify_url),
        ] {
            if let Some(url) = value {
                validate_http_url(field, url)?;
            }
        }
        Ok(())
    }

    /// Collector base URL
    pub fn api_url(&self) -> String {
        self.api_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}.{}api.pulsekit.io",
                self.app_id,
                self.stack.host_prefix()
            )
        })
    }

    /// Resources base URL
    pub fn content_url(&self) -> String {
        self.content_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.content.pulsekit.io", self.app_id))
    }

    /// Identify endpoint
    pub fn identify_url(&self) -> String {
        self.identify_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}.{}identity.pulsekit.io/identify",
                self.app_id,
                self.stack.host_prefix()
            )
        })
    }
}

fn is_dotted_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() >= 2
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    let url = reqwest::Url::parse(value)
        .map_err(|e| Error::Config(format!("{} '{}' is not a valid URL: {}", field, value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Config(format!(
            "{} must use http or https, got '{}'",
            field, other
        ))),
    }
}

/// Push bridge configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PushConfig {
    /// Seconds between pulls of worker-captured push events
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How long the page waits for a worker reply
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            reply_timeout_ms: default_reply_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_reply_timeout() -> u64 {
    5000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level override (trace, debug, info, warn, error); defaults follow `sdk.mode`
    pub level: Option<String>,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            max_files: default_max_log_files(),
        }
    }
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/pulsekit/config.toml` (~/.config/pulsekit/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("pulsekit").join("config.toml")
    }

    /// Returns the data directory path (for SQLite databases)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("pulsekit")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("pulsekit")
    }

    /// Page-side store: `$XDG_DATA_HOME/pulsekit/store.db`
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }

    /// Worker-side store: `$XDG_DATA_HOME/pulsekit/worker.db`
    pub fn worker_store_path() -> PathBuf {
        Self::data_dir().join("worker.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("pulsekit.log")
    }

    /// Ensure XDG base directory environment variables are set.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_sdk() -> SdkConfig {
        SdkConfig {
            app_id: 30512,
            api_key: "web_sdk-abc".to_string(),
            external_user_id: "abc".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sdk.new_session_interval_secs, 30);
        assert_eq!(config.sdk.mode, Mode::Prod);
        assert_eq!(config.push.poll_interval_secs, 30);
        assert_eq!(config.push.reply_timeout_ms, 5000);
        assert!(config.logging.level.is_none());
        // Nothing identifies the app yet
        assert!(config.sdk.validate().is_err());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sdk]
app_id = 30512
api_key = "web_sdk-abc"
external_user_id = "abc"
stack = "eu"
app_version = "2.4.1"
mode = "dev"

[push]
poll_interval_secs = 10

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.sdk.app_id, 30512);
        assert_eq!(config.sdk.stack, Stack::Eu);
        assert_eq!(config.sdk.mode, Mode::Dev);
        assert_eq!(config.push.poll_interval_secs, 10);
        assert_eq!(config.push.reply_timeout_ms, 5000);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert!(config.sdk.validate().is_ok());
    }

    #[test]
    fn test_url_resolution() {
        let mut sdk = valid_sdk();
        assert_eq!(sdk.api_url(), "https://30512.api.pulsekit.io");
        assert_eq!(sdk.content_url(), "https://30512.content.pulsekit.io");
        assert_eq!(sdk.identify_url(), "https://30512.identity.pulsekit.io/identify");

        sdk.stack = Stack::Eu;
        assert_eq!(sdk.api_url(), "https://30512.eu-api.pulsekit.io");
        assert_eq!(sdk.content_url(), "https://30512.content.pulsekit.io");
        assert_eq!(
            sdk.identify_url(),
            "https://30512.eu-identity.pulsekit.io/identify"
        );

        sdk.api_url = Some("http://localhost:8080".to_string());
        assert_eq!(sdk.api_url(), "http://localhost:8080");
    }

    #[test]
    fn test_validation_rules() {
        assert!(valid_sdk().validate().is_ok());

        let cases: Vec<Box<dyn Fn(&mut SdkConfig)>> = vec![
            Box::new(|c| c.app_id = 0),
            Box::new(|c| c.api_key = String::new()),
            Box::new(|c| c.api_key = "abc".to_string()),
            Box::new(|c| c.external_user_id = " ".to_string()),
            Box::new(|c| c.app_version = "1".to_string()),
            Box::new(|c| c.app_version = "1.x".to_string()),
            Box::new(|c| c.new_session_interval_secs = 0),
            Box::new(|c| c.content_url = Some("ftp://example.com".to_string())),
            Box::new(|c| c.api_url = Some("not a url".to_string())),
        ];

        for (i, mutate) in cases.iter().enumerate() {
            let mut sdk = valid_sdk();
            mutate(&mut sdk);
            let err = sdk.validate().unwrap_err();
            assert!(
                matches!(err, Error::Config(_)),
                "case {} should be a config error",
                i
            );
        }
    }

    #[test]
    fn test_mode_log_filters() {
        assert_eq!(Mode::Dev.default_log_filter(), "info");
        assert_eq!(Mode::Test.default_log_filter(), "error");
        assert_eq!(Mode::Prod.default_log_filter(), "error");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sdk]\napp_id = 7\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.sdk.app_id, 7);

        std::fs::write(&path, "[sdk\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
