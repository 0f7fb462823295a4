//! Client configuration: raw options, defaults, normalization and loading.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::scheduler::ReconnectDelays;
use crate::types::{ConnectParams, Error, Result};

pub(crate) const DEFAULT_PORT: u16 = 1883;
pub(crate) const DEFAULT_RECONNECT_DELAYS: [i64; 6] = [1000, 1000, 1000, 10_000, 10_000, 60_000];
pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 15_000;
const CLIENT_ID_PREFIX: &str = "session-";

/// Retry delay in milliseconds, either a single value or a full table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ReconnectDelaySetting {
    Single(i64),
    Table(Vec<i64>),
}

/// Raw client options as written by the caller or read from a config file.
///
/// Every field is optional; [`ConnectionConfig::from_options`] fills in the
/// defaults and rejects invalid combinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    pub uri: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(alias = "clientID", alias = "client")]
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    /// Automatic reconnection. Defaults to `true`.
    pub reconnect: Option<bool>,
    pub reconnect_delay: Option<ReconnectDelaySetting>,
    pub timeout_ms: Option<u64>,
    pub report_connection_status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// Validated, immutable configuration for one [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker URI, always ending in `/`.
    pub uri: String,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Option<Duration>,
    pub connect_timeout: Duration,
    pub reconnect_delays: ReconnectDelays,
    /// Whether failed or lost sessions are retried automatically.
    pub restore_connection: bool,
    /// Whether status text is forwarded to the [`StatusSink`](crate::StatusSink).
    pub report_status: bool,
}

impl ConnectionConfig {
    /// Configuration for `uri` with every other option at its default.
    pub fn new(uri: impl Into<String>) -> Result<Self> {
        Self::from_options(ClientOptions {
            uri: Some(uri.into()),
            ..Default::default()
        })
    }

    pub fn from_options(opts: ClientOptions) -> Result<Self> {
        let uri = normalize_uri(opts.uri.as_deref(), opts.host.as_deref(), opts.port)?;

        let client_id = opts
            .client_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_client_id);

        let credentials = match (opts.username, opts.password) {
            (Some(username), password) => Some(Credentials { username, password }),
            (None, Some(_)) => {
                return Err(Error::Config("password given without username".into()));
            }
            (None, None) => None,
        };

        let reconnect_delays = match opts.reconnect_delay {
            None => ReconnectDelays::new(DEFAULT_RECONNECT_DELAYS.to_vec())?,
            Some(ReconnectDelaySetting::Single(ms)) => ReconnectDelays::new(vec![ms])?,
            Some(ReconnectDelaySetting::Table(table)) => ReconnectDelays::new(table)?,
        };

        Ok(Self {
            uri,
            client_id,
            credentials,
            keep_alive: opts.keep_alive_secs.map(Duration::from_secs),
            connect_timeout: Duration::from_millis(opts.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            reconnect_delays,
            restore_connection: opts.reconnect.unwrap_or(true),
            report_status: opts.report_connection_status,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let opts: ClientOptions = serde_yaml_ng::from_str(content)
            .map_err(|e| Error::Config(format!("parse options: {e}")))?;
        Self::from_options(opts)
    }

    /// Connect timeout in whole seconds, rounded up, never below one.
    pub fn timeout_secs(&self) -> u64 {
        let ms = u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX);
        ms.div_ceil(1000).max(1)
    }

    /// Parameters for [`Transport::connect`](crate::Transport::connect).
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            user_name: self.credentials.as_ref().map(|c| c.username.clone()),
            password: self.credentials.as_ref().and_then(|c| c.password.clone()),
            keep_alive_interval: self.keep_alive,
            timeout_secs: Some(self.timeout_secs()),
        }
    }
}

/// Load and validate a client config from a YAML file.
pub async fn load(path: &Path) -> Result<ConnectionConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    ConnectionConfig::from_yaml_str(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

fn normalize_uri(uri: Option<&str>, host: Option<&str>, port: Option<u16>) -> Result<String> {
    let mut uri = match (uri.filter(|u| !u.is_empty()), host) {
        (Some(uri), _) => uri.to_string(),
        (None, Some(host)) if !host.is_empty() => {
            format!("mqtt://{host}:{}", port.unwrap_or(DEFAULT_PORT))
        }
        _ => return Err(Error::Config("either uri or host is required".into())),
    };
    if !uri.ends_with('/') {
        uri.push('/');
    }
    url::Url::parse(&uri).map_err(|e| Error::Config(format!("invalid uri {uri}: {e}")))?;
    Ok(uri)
}

fn generate_client_id() -> String {
    format!(
        "{CLIENT_ID_PREFIX}{:08x}",
        uuid::Uuid::new_v4().as_u128() as u32
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_host() {
        let config = ConnectionConfig::from_options(ClientOptions {
            host: Some("broker.local".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.uri, "mqtt://broker.local:1883/");
        assert!(config.client_id.starts_with("session-"));
        assert_eq!(config.client_id.len(), "session-".len() + 8);
        assert!(config.restore_connection);
        assert!(!config.report_status);
        assert_eq!(config.reconnect_delays.as_slice(), &DEFAULT_RECONNECT_DELAYS);
        assert_eq!(config.connect_timeout, Duration::from_millis(15_000));
        assert_eq!(config.timeout_secs(), 15);
        assert_eq!(config.keep_alive, None);
    }

    #[test]
    fn uri_gets_trailing_slash() {
        let config = ConnectionConfig::new("ws://10.0.0.1:9001/mqtt").unwrap();
        assert_eq!(config.uri, "ws://10.0.0.1:9001/mqtt/");
        let config = ConnectionConfig::new("mqtt://localhost:1883/").unwrap();
        assert_eq!(config.uri, "mqtt://localhost:1883/");
    }

    #[test]
    fn uri_wins_over_host() {
        let config = ConnectionConfig::from_options(ClientOptions {
            uri: Some("mqtt://a:1".into()),
            host: Some("b".into()),
            port: Some(2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.uri, "mqtt://a:1/");
    }

    #[test]
    fn missing_endpoint_rejected() {
        let err = ConnectionConfig::from_options(ClientOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn invalid_uri_rejected() {
        let err = ConnectionConfig::new("not a uri").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn empty_delay_table_rejected() {
        let err = ConnectionConfig::from_options(ClientOptions {
            host: Some("h".into()),
            reconnect_delay: Some(ReconnectDelaySetting::Table(vec![])),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn single_delay_becomes_table() {
        let config = ConnectionConfig::from_options(ClientOptions {
            host: Some("h".into()),
            reconnect_delay: Some(ReconnectDelaySetting::Single(5000)),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.reconnect_delays.as_slice(), &[5000]);
    }

    #[test]
    fn timeout_rounds_up_to_seconds() {
        let mut config = ConnectionConfig::new("mqtt://h:1").unwrap();
        config.connect_timeout = Duration::from_millis(1500);
        assert_eq!(config.timeout_secs(), 2);
        config.connect_timeout = Duration::ZERO;
        assert_eq!(config.timeout_secs(), 1);
    }

    #[test]
    fn password_without_username_rejected() {
        let err = ConnectionConfig::from_options(ClientOptions {
            host: Some("h".into()),
            password: Some("secret".into()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn connect_params_carry_credentials_and_keep_alive() {
        let config = ConnectionConfig::from_options(ClientOptions {
            host: Some("h".into()),
            username: Some("user".into()),
            password: Some("pw".into()),
            keep_alive_secs: Some(30),
            timeout_ms: Some(5000),
            ..Default::default()
        })
        .unwrap();
        let params = config.connect_params();
        assert_eq!(params.user_name.as_deref(), Some("user"));
        assert_eq!(params.password.as_deref(), Some("pw"));
        assert_eq!(params.keep_alive_interval, Some(Duration::from_secs(30)));
        assert_eq!(params.timeout_secs, Some(5));
    }

    #[test]
    fn yaml_options() {
        let yaml = r#"
host: broker.example.com
port: 8883
clientID: dashboard-1
reconnect: false
reconnectDelay: [500, 2000, -1]
timeoutMs: 3000
reportConnectionStatus: true
"#;
        let config = ConnectionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.uri, "mqtt://broker.example.com:8883/");
        assert_eq!(config.client_id, "dashboard-1");
        assert!(!config.restore_connection);
        assert!(config.report_status);
        assert_eq!(config.reconnect_delays.as_slice(), &[500, 2000, -1]);
        assert_eq!(config.timeout_secs(), 3);
    }

    #[test]
    fn yaml_scalar_delay() {
        let config =
            ConnectionConfig::from_yaml_str("uri: mqtt://h:1\nreconnectDelay: 750\n").unwrap();
        assert_eq!(config.reconnect_delays.as_slice(), &[750]);
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.yaml");
        std::fs::write(&path, "uri: mqtt://localhost:1883\nclientId: loader\n").unwrap();
        let config = load(&path).await.unwrap();
        assert_eq!(config.client_id, "loader");
        assert_eq!(config.uri, "mqtt://localhost:1883/");
    }

    #[tokio::test]
    async fn load_missing_file() {
        let err = load(Path::new("/nonexistent/client.yaml")).await.unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("read")));
    }
}
