use super::core::{into_object, reconnector, SourceCore};
use super::{close_writer, install_writer, shared_writer, SharedWriter, TaskSlot, WsStream};
use crate::source::EventSource;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use sourcebus::{SourceConfig, SourceError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
struct WebSocketOptions {
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Generic WebSocket feed.
///
/// Every text or binary frame becomes one event. Frames are decoded as JSON
/// when possible; the event type comes from a `type` or `event` field and
/// defaults to `"message"`.
pub struct WebSocketSource {
    core: Arc<SourceCore>,
    url: String,
    headers: HashMap<String, String>,
    writer: SharedWriter,
    reader: TaskSlot,
}

impl WebSocketSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let options: WebSocketOptions = config.decode_options()?;
        let url = config.require("url", &options.url)?.to_string();

        Ok(Self {
            core: Arc::new(SourceCore::new(config)),
            url,
            headers: options.headers,
            writer: shared_writer(),
            reader: TaskSlot::default(),
        })
    }

    async fn open(&self) -> Result<WsStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("Invalid WebSocket URL '{}'", self.url))?;

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("Invalid header name '{}'", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header '{}'", name))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request).await?;
        Ok(stream)
    }

    async fn read_loop(self: Arc<Self>, mut reader: SplitStream<WsStream>) {
        let mut reason = None;

        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
                Ok(Message::Binary(bytes)) => self.handle_frame(&String::from_utf8_lossy(&bytes)),
                Ok(Message::Close(frame)) => {
                    reason = frame.map(|f| f.reason.as_str().to_string());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    reason = Some(e.to_string());
                    break;
                }
            }
        }

        self.writer.lock().await.take();
        let reconnect = reconnector(&self);
        self.core.handle_disconnect(reason, reconnect);
    }

    fn handle_frame(&self, text: &str) {
        let (event_type, data) = decode_frame(text);
        debug!(source_id = %self.core.id(), event_type = %event_type, "Frame received");
        self.core
            .emit_event(&event_type, data, Some(Value::String(text.to_string())));
    }
}

/// Best-effort JSON decode of one frame into `(type, data)`.
pub(crate) fn decode_frame(text: &str) -> (String, Map<String, Value>) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            let event_type = ["type", "event"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
                .unwrap_or("message")
                .to_string();
            (event_type, into_object(value, "message"))
        }
        Err(_) => (
            "message".to_string(),
            into_object(Value::String(text.to_string()), "message"),
        ),
    }
}

#[async_trait]
impl EventSource for WebSocketSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        self.core.mark_connecting()?;
        info!(source_id = %self.core.id(), url = %self.url, "Opening WebSocket");

        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                self.core.mark_failed(&e.to_string());
                return Err(SourceError::ConnectFailed {
                    id: self.core.id().to_string(),
                    reason: format!("{:#}", e),
                }
                .into());
            }
        };

        let (writer, reader) = stream.split();
        install_writer(&self.core, &self.writer, writer).await?;

        // Connected must be recorded before the reader can observe a close
        self.core.mark_connected();
        let source = Arc::clone(&self);
        self.reader.set(tokio::spawn(source.read_loop(reader)));
        Ok(())
    }

    async fn disconnect(&self) {
        self.reader.abort();
        close_writer(&self.writer).await;
    }

    async fn send(&self, data: Value) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| SourceError::NotConnected(self.core.id().to_string()))?;

        let text = match data {
            Value::String(text) => text,
            other => other.to_string(),
        };
        sink.send(Message::Text(text.into()))
            .await
            .context("Failed to send WebSocket frame")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sourcebus::SourceKind;

    #[test]
    fn test_url_is_required() {
        let err = WebSocketSource::new(SourceConfig::new(SourceKind::WebSocket, "ws"))
            .err()
            .unwrap();
        assert_eq!(
            err,
            SourceError::MissingOption {
                kind: SourceKind::WebSocket,
                option: "url"
            }
        );
    }

    #[test]
    fn test_decode_frame_type_field() {
        let (event_type, data) = decode_frame(r#"{"type":"trade","price":1.5}"#);
        assert_eq!(event_type, "trade");
        assert_eq!(data["price"], 1.5);
    }

    #[test]
    fn test_decode_frame_event_field() {
        let (event_type, _) = decode_frame(r#"{"event":"subscribed"}"#);
        assert_eq!(event_type, "subscribed");
    }

    #[test]
    fn test_decode_frame_defaults_to_message() {
        let (event_type, data) = decode_frame(r#"{"price":2}"#);
        assert_eq!(event_type, "message");
        assert_eq!(data["price"], 2);

        let (event_type, _) = decode_frame(r#"{"type":42}"#);
        assert_eq!(event_type, "message");
    }

    #[test]
    fn test_decode_frame_wraps_plain_text() {
        let (event_type, data) = decode_frame("hello there");
        assert_eq!(event_type, "message");
        assert_eq!(Value::Object(data), json!({"message": "hello there"}));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let config = SourceConfig::new(SourceKind::WebSocket, "ws").with_option("url", "ws://127.0.0.1:1");
        let source = WebSocketSource::new(config).unwrap();

        let err = source.send(json!({"op": "ping"})).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<SourceError>(),
            Some(&SourceError::NotConnected("ws".to_string()))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_rejects_and_marks_error() {
        let config = SourceConfig::new(SourceKind::WebSocket, "ws").with_option("url", "ws://127.0.0.1:1");
        let source = Arc::new(WebSocketSource::new(config).unwrap());

        let err = source.clone().connect().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SourceError>(),
            Some(SourceError::ConnectFailed { .. })
        ));
        assert_eq!(source.status(), sourcebus::SourceStatus::Error);
    }
}
