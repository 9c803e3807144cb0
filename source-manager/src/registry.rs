//! Source registry - maps a configuration's kind to its transport.

use crate::source::EventSource;
use crate::sources::{
    CronSource, DiscordGatewaySource, RssSource, SlackSocketSource, SseSource, WebSocketSource,
};
use anyhow::Result;
use serde_json::Value;
use sourcebus::{SourceConfig, SourceError, SourceKind};
use std::sync::Arc;

/// Builds the transport for `config.kind`.
///
/// Options are validated here; a missing required option fails before any
/// I/O is attempted.
pub fn create_source(config: SourceConfig) -> Result<Arc<dyn EventSource>> {
    let source: Arc<dyn EventSource> = match config.kind {
        SourceKind::WebSocket => Arc::new(WebSocketSource::new(config)?),
        SourceKind::DiscordGateway => Arc::new(DiscordGatewaySource::new(config)?),
        SourceKind::SlackSocket => Arc::new(SlackSocketSource::new(config)?),
        SourceKind::Cron => Arc::new(CronSource::new(config)?),
        SourceKind::Sse => Arc::new(SseSource::new(config)?),
        SourceKind::Rss => Arc::new(RssSource::new(config)?),
    };
    Ok(source)
}

/// Decodes an untyped configuration as received at the boundary.
///
/// An unrecognised `kind` fails with [`SourceError::UnknownKind`]; any other
/// shape problem is an [`SourceError::InvalidOption`] on `config`.
pub fn parse_config(config: Value) -> Result<SourceConfig, SourceError> {
    if let Some(kind) = config.get("kind").and_then(Value::as_str) {
        kind.parse::<SourceKind>()?;
    }
    serde_json::from_value(config).map_err(|e| SourceError::InvalidOption {
        option: "config".to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sourcebus::{SourceError, SourceStatus};

    #[test]
    fn test_creates_each_kind() {
        let configs = vec![
            SourceConfig::new(SourceKind::WebSocket, "ws").with_option("url", "wss://example.com"),
            SourceConfig::new(SourceKind::DiscordGateway, "bot").with_option("token", "t"),
            SourceConfig::new(SourceKind::SlackSocket, "slack").with_option("appToken", "xapp"),
            SourceConfig::new(SourceKind::Cron, "cron").with_option("schedule", "5s"),
            SourceConfig::new(SourceKind::Sse, "sse").with_option("url", "http://localhost/events"),
            SourceConfig::new(SourceKind::Rss, "rss").with_option("url", "http://localhost/feed"),
        ];

        for config in configs {
            let kind = config.kind;
            let id = config.id.clone();
            let source = create_source(config).unwrap();
            assert_eq!(source.kind(), kind);
            assert_eq!(source.id(), id);
            assert_eq!(source.status(), SourceStatus::Disconnected);
        }
    }

    #[test]
    fn test_missing_option_fails_fast() {
        let err = create_source(SourceConfig::new(SourceKind::Rss, "feed")).err().unwrap();
        assert_eq!(
            err.downcast_ref::<SourceError>(),
            Some(&SourceError::MissingOption {
                kind: SourceKind::Rss,
                option: "url"
            })
        );
    }

    #[test]
    fn test_parse_config_unknown_kind() {
        let err = parse_config(json!({"kind": "bogus", "id": "x", "options": {}})).unwrap_err();
        assert_eq!(err, SourceError::UnknownKind("bogus".to_string()));
        assert!(err.to_string().contains("bogus"), "{}", err);
    }

    #[test]
    fn test_parse_config_shape_errors() {
        let err = parse_config(json!({"kind": "cron"})).unwrap_err();
        assert!(matches!(err, SourceError::InvalidOption { ref option, .. } if option == "config"));

        let err = parse_config(json!({"kind": 7, "id": "x"})).unwrap_err();
        assert!(matches!(err, SourceError::InvalidOption { .. }));

        let config = parse_config(json!({"kind": "cron", "id": "c", "options": {"schedule": "5s"}})).unwrap();
        assert_eq!(config.kind, SourceKind::Cron);
        assert_eq!(config.id, "c");
    }

    #[test]
    fn test_malformed_options_rejected() {
        let config = SourceConfig::new(SourceKind::Cron, "cron").with_option("schedule", 5);
        let err = create_source(config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::InvalidOption { .. })
        ));
    }
}
