use std::path::Path;
use std::time::Duration;

use hub_client::{HubConfig, TimingConfig, Value};
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

pub(crate) const DEFAULT_DEVICE_ID: &str = "d72dc7b5-14d2-4896-83e4-cfc7a3fd625f";
pub(crate) const DEFAULT_SUBSCRIPTION: &str = "SubscribeToMarketStatusUpdatedEvent";
pub(crate) const DEFAULT_EXCHANGE: &str = "DSE";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub login_url: String,
    pub signalr_url: String,
    /// May be left blank when supplied through [`Credentials`].
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Connection tuning, mapped onto [`TimingConfig`].
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub message_buffer: usize,
    /// Connect straight to the WebSocket endpoint.
    pub skip_negotiation: bool,
}

impl Default for HubSection {
    fn default() -> Self {
        let timing = TimingConfig::default();
        Self {
            reconnect_base_delay_ms: millis(timing.reconnect_base_delay),
            reconnect_max_delay_ms: millis(timing.reconnect_max_delay),
            max_reconnect_attempts: timing.max_reconnect_attempts,
            heartbeat_interval_secs: timing.heartbeat_interval.as_secs(),
            ping_timeout_secs: timing.ping_timeout.as_secs(),
            connect_timeout_secs: timing.connect_timeout.as_secs(),
            message_buffer: timing.message_buffer,
            skip_negotiation: false,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl HubSection {
    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            message_buffer: self.message_buffer,
        }
    }
}

/// Service loop intervals.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub token_refresh_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// Pause before the re-login that follows a failed first connect.
    pub initial_retry_delay_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            token_refresh_interval_secs: 50 * 60,
            stats_interval_secs: 15,
            initial_retry_delay_secs: 5,
        }
    }
}

impl ServiceSection {
    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_secs(self.initial_retry_delay_secs)
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl SubscriptionConfig {
    pub fn hub_args(&self) -> Vec<Value> {
        self.args.iter().cloned().map(Value::from).collect()
    }
}

fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_string()
}

fn default_subscriptions() -> Vec<SubscriptionConfig> {
    vec![SubscriptionConfig {
        method: DEFAULT_SUBSCRIPTION.to_string(),
        args: vec![serde_json::Value::String(DEFAULT_EXCHANGE.to_string())],
    }]
}

impl FeedConfig {
    /// Hub client configuration for the given bearer token.
    pub fn hub_config(&self, token: String) -> HubConfig {
        let mut config = HubConfig::new(self.signalr_url.clone(), token);
        config.timing = self.hub.timing();
        config
    }
}

/// Login credentials from the command line or environment. Set fields win
/// over the config file.
#[derive(Debug, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Load a feed config from a YAML file, apply `overrides`, then validate.
pub async fn load(path: &Path, overrides: Credentials) -> FeedResult<FeedConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FeedError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: FeedConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| FeedError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(username) = overrides.username {
        config.username = username;
    }
    if let Some(password) = overrides.password {
        config.password = password;
    }
    validate(&config)?;
    Ok(config)
}

fn validate(config: &FeedConfig) -> FeedResult<()> {
    for (label, url) in [
        ("login_url", &config.login_url),
        ("signalr_url", &config.signalr_url),
    ] {
        reqwest::Url::parse(url).map_err(|e| FeedError::Config(format!("{label}: {e}")))?;
    }
    if config.username.is_empty() {
        return Err(FeedError::Config("username must not be empty".into()));
    }
    if config.password.is_empty() {
        return Err(FeedError::Config("password must not be empty".into()));
    }
    if config.hub.reconnect_base_delay_ms == 0 {
        return Err(FeedError::Config(
            "hub.reconnect_base_delay_ms must be positive".into(),
        ));
    }
    for (label, secs) in [
        ("hub.heartbeat_interval_secs", config.hub.heartbeat_interval_secs),
        ("hub.ping_timeout_secs", config.hub.ping_timeout_secs),
        ("hub.connect_timeout_secs", config.hub.connect_timeout_secs),
    ] {
        if secs == 0 {
            return Err(FeedError::Config(format!("{label} must be positive")));
        }
    }
    if config.service.token_refresh_interval_secs == 0 || config.service.stats_interval_secs == 0 {
        return Err(FeedError::Config(
            "service intervals must be positive".into(),
        ));
    }
    if let Some(sub) = config.subscriptions.iter().find(|s| s.method.is_empty()) {
        return Err(FeedError::Config(format!(
            "subscription with empty method (args: {:?})",
            sub.args
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
login_url: https://api.example.com/auth/login
signalr_url: https://feed.example.com/marketHub
username: trader
password: secret
";

    async fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, content).await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn load_minimal_config_applies_defaults() {
        let (_dir, path) = write_config(MINIMAL).await;
        let config = load(&path, Credentials::default()).await.unwrap();

        assert_eq!(config.username, "trader");
        assert_eq!(config.device_id, DEFAULT_DEVICE_ID);
        assert_eq!(config.hub, HubSection::default());
        assert_eq!(config.service, ServiceSection::default());
        assert_eq!(config.subscriptions, default_subscriptions());
        assert_eq!(
            config.service.token_refresh_interval(),
            Duration::from_secs(3000)
        );

        let timing = config.hub.timing();
        assert_eq!(timing.reconnect_base_delay, Duration::from_secs(2));
        assert_eq!(timing.reconnect_max_delay, Duration::from_secs(120));
        assert_eq!(timing.message_buffer, 100);
    }

    #[tokio::test]
    async fn load_full_config() {
        let content = format!(
            "{MINIMAL}\
device_id: custom-device
hub:
  reconnect_base_delay_ms: 500
  max_reconnect_attempts: 3
  skip_negotiation: true
service:
  stats_interval_secs: 60
subscriptions:
  - method: SubscribeToSharePriceUpdatedEvent
    args: [DSE, 42]
  - method: SubscribeToNews
"
        );
        let (_dir, path) = write_config(&content).await;
        let config = load(&path, Credentials::default()).await.unwrap();

        assert_eq!(config.device_id, "custom-device");
        assert_eq!(config.hub.reconnect_base_delay_ms, 500);
        assert_eq!(config.hub.max_reconnect_attempts, 3);
        assert!(config.hub.skip_negotiation);
        assert_eq!(config.hub.heartbeat_interval_secs, 30);
        assert_eq!(config.service.stats_interval_secs, 60);
        assert_eq!(config.service.initial_retry_delay_secs, 5);
        assert_eq!(config.subscriptions.len(), 2);
        assert_eq!(
            config.subscriptions[0].hub_args(),
            vec![Value::from("DSE"), Value::from(42_i64)]
        );
        assert!(config.subscriptions[1].args.is_empty());

        let hub = config.hub_config("tok".into());
        assert_eq!(hub.url, "https://feed.example.com/marketHub");
        assert_eq!(hub.token, "tok");
        assert_eq!(hub.timing.max_reconnect_attempts, 3);
    }

    #[tokio::test]
    async fn missing_required_field_is_an_error() {
        let (_dir, path) = write_config("login_url: https://a.example.com\n").await;
        let err = load(&path, Credentials::default()).await.unwrap_err();
        assert!(matches!(err, FeedError::Config(ref m) if m.contains("parse")), "{err}");
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let content = MINIMAL.replace("https://feed.example.com/marketHub", "not a url");
        let (_dir, path) = write_config(&content).await;
        let err = load(&path, Credentials::default()).await.unwrap_err();
        assert!(err.to_string().contains("signalr_url"), "{err}");
    }

    #[tokio::test]
    async fn empty_password_is_rejected() {
        let content = MINIMAL.replace("password: secret", "password: \"\"");
        let (_dir, path) = write_config(&content).await;
        assert!(load(&path, Credentials::default()).await.is_err());
    }

    #[tokio::test]
    async fn blank_credentials_come_from_overrides() {
        let content = MINIMAL
            .replace("username: trader", "username: \"\"")
            .replace("password: secret", "password: \"\"");
        let (_dir, path) = write_config(&content).await;

        let err = load(&path, Credentials::default()).await.unwrap_err();
        assert!(err.to_string().contains("username must not be empty"), "{err}");

        let overrides = Credentials {
            username: Some("env-user".into()),
            password: Some("env-pass".into()),
        };
        let config = load(&path, overrides).await.unwrap();
        assert_eq!(config.username, "env-user");
        assert_eq!(config.password, "env-pass");
    }

    #[tokio::test]
    async fn omitted_credentials_come_from_overrides() {
        let content = "\
login_url: https://api.example.com/auth/login
signalr_url: https://feed.example.com/marketHub
";
        let (_dir, path) = write_config(content).await;
        let overrides = Credentials {
            username: Some("env-user".into()),
            password: Some("env-pass".into()),
        };
        let config = load(&path, overrides).await.unwrap();
        assert_eq!(config.username, "env-user");
    }

    #[tokio::test]
    async fn override_replaces_file_credentials() {
        let (_dir, path) = write_config(MINIMAL).await;
        let overrides = Credentials {
            username: Some("other".into()),
            password: None,
        };
        let config = load(&path, overrides).await.unwrap();
        assert_eq!(config.username, "other");
        assert_eq!(config.password, "secret");
    }

    #[tokio::test]
    async fn zero_timeouts_are_rejected() {
        for field in ["ping_timeout_secs", "connect_timeout_secs"] {
            let content = format!("{MINIMAL}hub:\n  {field}: 0\n");
            let (_dir, path) = write_config(&content).await;
            let err = load(&path, Credentials::default()).await.unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = load(Path::new("/nonexistent/config.yaml"), Credentials::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read"), "{err}");
    }
}
