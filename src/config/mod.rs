use crate::error::SourceError;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Transport kind of a source, as written in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceKind {
    WebSocket,
    DiscordGateway,
    SlackSocket,
    Cron,
    Sse,
    Rss,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::WebSocket,
        SourceKind::DiscordGateway,
        SourceKind::SlackSocket,
        SourceKind::Cron,
        SourceKind::Sse,
        SourceKind::Rss,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::WebSocket => "websocket",
            SourceKind::DiscordGateway => "discord-gateway",
            SourceKind::SlackSocket => "slack-socket",
            SourceKind::Cron => "cron",
            SourceKind::Sse => "sse",
            SourceKind::Rss => "rss",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SourceError::UnknownKind(s.to_string()))
    }
}

impl TryFrom<String> for SourceKind {
    type Error = SourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceKind> for String {
    fn from(kind: SourceKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Configuration for one source instance.
///
/// `options` is an opaque bag whose meaning depends on `kind`; each transport
/// decodes it into its own typed options at construction time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Unique within a manager
    pub id: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Event types to let through; `None` disables filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<HashSet<String>>,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Fixed delay before a reconnect attempt, in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    /// Absent means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    5000
}

impl SourceConfig {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            options: Map::new(),
            filter: None,
            reconnect: default_reconnect(),
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: None,
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn with_filter<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true when an event of this type passes the configured filter.
    pub fn accepts(&self, event_type: &str) -> bool {
        match &self.filter {
            Some(types) => types.contains(event_type),
            None => true,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay)
    }

    /// Decodes the options bag into a kind-specific options struct.
    pub fn decode_options<T: DeserializeOwned>(&self) -> Result<T, SourceError> {
        serde_json::from_value(Value::Object(self.options.clone())).map_err(|e| {
            SourceError::InvalidOption {
                option: "options".to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Returns the value of a required string option, failing when it is
    /// absent or empty.
    pub fn require<'a>(
        &self,
        option: &'static str,
        value: &'a Option<String>,
    ) -> Result<&'a str, SourceError> {
        match value.as_deref() {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(SourceError::MissingOption {
                kind: self.kind,
                option,
            }),
        }
    }
}

/// Runner configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceBusConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    3002
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

/// Load runner configuration from a TOML file
pub fn load_config(path: &str) -> Result<SourceBusConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file '{}'", path))?;
    let config: SourceBusConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file '{}'", path))?;
    info!(path = %path, sources = config.sources.len(), "Configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_config_defaults() {
        let config: SourceConfig = serde_json::from_value(json!({
            "kind": "websocket",
            "id": "feed",
            "options": {"url": "wss://example.com"}
        }))
        .unwrap();

        assert_eq!(config.kind, SourceKind::WebSocket);
        assert!(config.reconnect);
        assert_eq!(config.reconnect_delay, 5000);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, None);
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_source_config_camel_case_fields() {
        let config: SourceConfig = serde_json::from_value(json!({
            "kind": "sse",
            "id": "stream",
            "reconnect": false,
            "reconnectDelay": 250,
            "maxReconnectAttempts": 3,
            "filter": ["update"]
        }))
        .unwrap();

        assert!(!config.reconnect);
        assert_eq!(config.reconnect_delay, 250);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert!(config.accepts("update"));
        assert!(!config.accepts("ping"));
    }

    #[test]
    fn test_unknown_kind_names_the_kind() {
        let result: Result<SourceConfig, _> = serde_json::from_value(json!({
            "kind": "bogus",
            "id": "x",
            "options": {}
        }));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("bogus"), "error should name the kind: {}", err);

        let parsed = "bogus".parse::<SourceKind>();
        assert_eq!(parsed, Err(SourceError::UnknownKind("bogus".to_string())));
    }

    #[test]
    fn test_kind_wire_names_roundtrip() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>(), Ok(kind));
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn test_no_filter_accepts_everything() {
        let config = SourceConfig::new(SourceKind::Cron, "ticker");
        assert!(config.accepts("tick"));
        assert!(config.accepts("anything"));
    }

    #[test]
    fn test_require_rejects_missing_and_blank() {
        let config = SourceConfig::new(SourceKind::Sse, "stream");
        assert_eq!(
            config.require("url", &None),
            Err(SourceError::MissingOption {
                kind: SourceKind::Sse,
                option: "url"
            })
        );
        assert!(config.require("url", &Some("  ".to_string())).is_err());
        assert_eq!(
            config.require("url", &Some("http://x".to_string())),
            Ok("http://x")
        );
    }

    #[test]
    fn test_runner_config_from_toml() {
        let toml = r#"
            [api]
            port = 4100

            [[sources]]
            kind = "cron"
            id = "heartbeat"
            reconnect = false

            [sources.options]
            schedule = "30s"
            immediate = true

            [[sources]]
            kind = "rss"
            id = "blog"
            filter = ["new_item"]

            [sources.options]
            url = "https://example.com/feed.xml"
            interval = "10m"
        "#;

        let config: SourceBusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.api.port, 4100);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].kind, SourceKind::Cron);
        assert_eq!(config.sources[0].options["schedule"], "30s");
        assert_eq!(config.sources[0].options["immediate"], true);
        assert!(!config.sources[0].reconnect);
        assert_eq!(config.sources[1].options["interval"], "10m");
        assert!(config.sources[1].accepts("new_item"));
    }

    #[test]
    fn test_runner_config_empty_file_uses_defaults() {
        let config: SourceBusConfig = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 3002);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.toml");
        std::fs::write(
            &path,
            r#"
            [[sources]]
            kind = "sse"
            id = "updates"

            [sources.options]
            url = "http://localhost:9000/events"
            "#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].id, "updates");
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/nonexistent/sources.toml");
        assert!(result.is_err());
    }
}
