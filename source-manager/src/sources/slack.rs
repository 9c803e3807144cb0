//! Socket-mode chat bot transport.
//!
//! `connect()` asks the REST API for a short-lived socket URL, opens it and
//! waits for the server's `hello`. Every frame carrying an `envelope_id` is
//! acknowledged before anything else happens to it.

use super::core::{into_object, reconnector, SourceCore};
use super::{
    close_writer, install_writer, send_json, shared_writer, SharedWriter, TaskSlot, WsStream,
};
use crate::source::EventSource;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sourcebus::{SourceConfig, SourceError};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const DEFAULT_API_URL: &str = "https://slack.com/api";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocketModeOptions {
    app_token: Option<String>,
    api_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpenResponse {
    ok: bool,
    url: Option<String>,
    error: Option<String>,
}

/// What to do with one inbound frame after it has been acknowledged.
#[derive(Debug, PartialEq)]
pub(crate) enum Routed {
    Hello,
    Emit { event_type: String, data: Value },
    Disconnect(Option<String>),
    Ignore,
}

/// Routes a socket-mode frame by its `type`.
pub(crate) fn route(frame: &Value) -> Routed {
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);

    match frame.get("type").and_then(Value::as_str) {
        Some("hello") => Routed::Hello,
        Some("events_api") => {
            let event = payload.get("event").cloned().unwrap_or(Value::Null);
            let event_type = event
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("event")
                .to_string();
            Routed::Emit {
                event_type,
                data: event,
            }
        }
        Some("interactive") => Routed::Emit {
            event_type: "interactive".to_string(),
            data: payload,
        },
        Some("slash_commands") => Routed::Emit {
            event_type: "slash_command".to_string(),
            data: payload,
        },
        Some("disconnect") => Routed::Disconnect(
            frame
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
        _ => Routed::Ignore,
    }
}

type ReadySender = oneshot::Sender<std::result::Result<(), String>>;

pub struct SlackSocketSource {
    core: Arc<SourceCore>,
    app_token: String,
    api_url: String,
    http: reqwest::Client,
    writer: SharedWriter,
    reader: TaskSlot,
}

impl SlackSocketSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let options: SocketModeOptions = config.decode_options()?;
        let app_token = config.require("appToken", &options.app_token)?.to_string();
        let api_url = options
            .api_url
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            core: Arc::new(SourceCore::new(config)),
            app_token,
            api_url,
            http: reqwest::Client::new(),
            writer: shared_writer(),
            reader: TaskSlot::default(),
        })
    }

    /// Obtains the ephemeral socket URL.
    async fn open_connection_url(&self) -> Result<String> {
        let endpoint = format!("{}/apps.connections.open", self.api_url);
        let response: ConnectionsOpenResponse = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.app_token)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send()
            .await
            .with_context(|| format!("Failed to call {}", endpoint))?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse apps.connections.open response")?;

        if !response.ok {
            return Err(anyhow!(
                "apps.connections.open failed: {}",
                response.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
        response
            .url
            .ok_or_else(|| anyhow!("apps.connections.open returned no url"))
    }

    async fn read_loop(self: Arc<Self>, mut reader: SplitStream<WsStream>, ready: ReadySender) {
        let mut ready = Some(ready);
        let reason = self.run(&mut reader, &mut ready).await;

        close_writer(&self.writer).await;

        match ready.take() {
            Some(tx) => {
                let _ = tx.send(Err(reason.unwrap_or_else(|| "socket closed before hello".to_string())));
            }
            None => {
                let reconnect = reconnector(&self);
                self.core.handle_disconnect(reason, reconnect);
            }
        }
    }

    async fn run(
        &self,
        reader: &mut SplitStream<WsStream>,
        ready: &mut Option<ReadySender>,
    ) -> Option<String> {
        while let Some(message) = reader.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_string(),
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(frame)) => return frame.map(|f| f.reason.as_str().to_string()),
                Ok(_) => continue,
                Err(e) => return Some(e.to_string()),
            };

            let frame: Value = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(source_id = %self.core.id(), error = %e, "Ignoring non-JSON frame");
                    continue;
                }
            };

            if let Some(envelope_id) = frame.get("envelope_id").and_then(Value::as_str) {
                let ack = json!({ "envelope_id": envelope_id });
                if let Err(e) = send_json(&self.writer, &ack).await {
                    warn!(source_id = %self.core.id(), envelope_id = %envelope_id, error = %e, "Failed to acknowledge envelope");
                }
            }

            match route(&frame) {
                Routed::Hello => {
                    self.core.mark_connected();
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Routed::Emit { event_type, data } => {
                    self.core
                        .emit_event(&event_type, into_object(data, "data"), Some(frame));
                }
                Routed::Disconnect(reason) => {
                    info!(source_id = %self.core.id(), reason = ?reason, "Server requested disconnect");
                    return Some(reason.unwrap_or_else(|| "server requested disconnect".to_string()));
                }
                Routed::Ignore => {}
            }
        }
        None
    }

    fn connect_failed(&self, reason: String) -> anyhow::Error {
        self.core.mark_failed(&reason);
        SourceError::ConnectFailed {
            id: self.core.id().to_string(),
            reason,
        }
        .into()
    }
}

#[async_trait]
impl EventSource for SlackSocketSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        self.core.mark_connecting()?;

        let url = match self.open_connection_url().await {
            Ok(url) => url,
            Err(e) => return Err(self.connect_failed(format!("{:#}", e))),
        };
        self.core.ensure_active()?;
        info!(source_id = %self.core.id(), "Opening socket-mode connection");

        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => return Err(self.connect_failed(e.to_string())),
        };

        let (writer, reader) = stream.split();
        install_writer(&self.core, &self.writer, writer).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        self.reader
            .set(tokio::spawn(Arc::clone(&self).read_loop(reader, ready_tx)));

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(self.connect_failed(reason)),
            Err(_) => Err(anyhow!("socket reader for '{}' ended before hello", self.core.id())),
        }
    }

    async fn disconnect(&self) {
        self.reader.abort();
        close_writer(&self.writer).await;
    }
}
