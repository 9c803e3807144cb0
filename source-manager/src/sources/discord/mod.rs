//! Gateway-protocol chat bot transport.
//!
//! Opcode-framed WebSocket protocol with a server-driven heartbeat and
//! session resume. A fresh connection sends IDENTIFY after HELLO; a
//! connection made while a session is stored (from an earlier READY in this
//! process) goes to the stored resume URL and sends RESUME instead.
//!
//! `connect()` resolves on READY (or RESUMED) rather than on socket open.

pub mod protocol;

use self::protocol::{
    GatewayPayload, DEFAULT_GATEWAY_URL, DEFAULT_INTENTS, OP_DISPATCH, OP_HEARTBEAT,
    OP_HEARTBEAT_ACK, OP_HELLO, OP_INVALID_SESSION, OP_RECONNECT,
};
use super::core::{into_object, reconnector, SourceCore};
use super::{
    close_writer, install_writer, send_json, shared_writer, SharedWriter, TaskSlot, WsStream,
};
use crate::source::EventSource;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::SplitStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use sourcebus::{SourceConfig, SourceError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayOptions {
    token: Option<String>,
    intents: Option<u64>,
    gateway_url: Option<String>,
}

/// Resume state kept across connections for the lifetime of the source.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GatewaySession {
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    /// Last sequence number seen on any payload
    pub sequence: Option<u64>,
}

impl GatewaySession {
    fn resumable(&self) -> Option<(&str, &str)> {
        match (&self.session_id, &self.resume_url) {
            (Some(id), Some(url)) => Some((id.as_str(), url.as_str())),
            _ => None,
        }
    }
}

/// Why the read loop ended.
enum LoopExit {
    Closed(Option<String>),
    Reconnect,
    InvalidSession,
}

impl LoopExit {
    fn reason(self) -> String {
        match self {
            LoopExit::Closed(reason) => reason.unwrap_or_else(|| "gateway closed".to_string()),
            LoopExit::Reconnect => "server requested reconnect".to_string(),
            LoopExit::InvalidSession => "invalid session".to_string(),
        }
    }
}

type ReadySender = oneshot::Sender<std::result::Result<(), String>>;

pub struct DiscordGatewaySource {
    core: Arc<SourceCore>,
    token: String,
    intents: u64,
    gateway_url: String,
    session: Mutex<GatewaySession>,
    writer: SharedWriter,
    reader: TaskSlot,
    heartbeat: TaskSlot,
}

impl DiscordGatewaySource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let options: GatewayOptions = config.decode_options()?;
        let token = config.require("token", &options.token)?.to_string();

        Ok(Self {
            core: Arc::new(SourceCore::new(config)),
            token,
            intents: options.intents.unwrap_or(DEFAULT_INTENTS),
            gateway_url: options
                .gateway_url
                .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            session: Mutex::new(GatewaySession::default()),
            writer: shared_writer(),
            reader: TaskSlot::default(),
            heartbeat: TaskSlot::default(),
        })
    }

    fn session(&self) -> MutexGuard<'_, GatewaySession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the stored resume state.
    pub fn session_state(&self) -> GatewaySession {
        self.session().clone()
    }

    fn endpoint(&self) -> String {
        let session = self.session();
        let base = session
            .resumable()
            .map(|(_, url)| url)
            .unwrap_or(self.gateway_url.as_str());
        protocol::gateway_endpoint(base)
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let sequence = self.session().sequence;
        send_json(&self.writer, &protocol::heartbeat(sequence)).await?;
        debug!(source_id = %self.core.id(), sequence = ?sequence, "Heartbeat sent");
        Ok(())
    }

    /// Sends one heartbeat now, then every `period`.
    async fn start_heartbeat(self: &Arc<Self>, period: Duration) {
        if let Err(e) = self.send_heartbeat().await {
            warn!(source_id = %self.core.id(), error = %e, "Heartbeat failed");
        }

        let source = Arc::clone(self);
        self.heartbeat.set(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = source.send_heartbeat().await {
                    warn!(source_id = %source.core.id(), error = %e, "Heartbeat failed");
                    break;
                }
            }
        }));
    }

    /// Sends RESUME when a session is stored, IDENTIFY otherwise.
    async fn authenticate(&self) -> Result<()> {
        let payload = {
            let session = self.session();
            match session.resumable() {
                Some((session_id, _)) => {
                    info!(source_id = %self.core.id(), "Resuming gateway session");
                    protocol::resume(&self.token, session_id, session.sequence)
                }
                None => {
                    info!(source_id = %self.core.id(), "Identifying with gateway");
                    protocol::identify(&self.token, self.intents)
                }
            }
        };
        send_json(&self.writer, &payload).await?;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut reader: SplitStream<WsStream>, ready: ReadySender) {
        let mut ready = Some(ready);
        let exit = self.run_protocol(&mut reader, &mut ready).await;

        self.heartbeat.abort();
        close_writer(&self.writer).await;

        let reason = exit.reason();
        match ready.take() {
            // Closed before READY: the pending connect fails
            Some(tx) => {
                let _ = tx.send(Err(reason));
            }
            None => {
                let reconnect = reconnector(&self);
                self.core.handle_disconnect(Some(reason), reconnect);
            }
        }
    }

    async fn run_protocol(
        self: &Arc<Self>,
        reader: &mut SplitStream<WsStream>,
        ready: &mut Option<ReadySender>,
    ) -> LoopExit {
        while let Some(message) = reader.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_string(),
                Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Ok(Message::Close(frame)) => {
                    return LoopExit::Closed(frame.map(|f| f.reason.as_str().to_string()));
                }
                Ok(_) => continue,
                Err(e) => return LoopExit::Closed(Some(e.to_string())),
            };

            let raw: Value = match serde_json::from_str(&text) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(source_id = %self.core.id(), error = %e, "Ignoring non-JSON gateway frame");
                    continue;
                }
            };
            let payload: GatewayPayload = match serde_json::from_value(raw.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(source_id = %self.core.id(), error = %e, "Ignoring malformed gateway frame");
                    continue;
                }
            };

            if let Some(sequence) = payload.s {
                self.session().sequence = Some(sequence);
            }

            match payload.op {
                OP_HELLO => {
                    let period = Duration::from_millis(payload.heartbeat_interval().unwrap_or(41_250));
                    self.start_heartbeat(period).await;
                    if let Err(e) = self.authenticate().await {
                        return LoopExit::Closed(Some(e.to_string()));
                    }
                }
                OP_HEARTBEAT => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!(source_id = %self.core.id(), error = %e, "Heartbeat failed");
                    }
                }
                OP_HEARTBEAT_ACK => {}
                OP_DISPATCH => self.handle_dispatch(payload, raw, ready),
                OP_RECONNECT => {
                    info!(source_id = %self.core.id(), "Gateway requested reconnect");
                    return LoopExit::Reconnect;
                }
                OP_INVALID_SESSION => {
                    warn!(source_id = %self.core.id(), "Gateway session invalidated");
                    *self.session() = GatewaySession::default();
                    return LoopExit::InvalidSession;
                }
                other => {
                    debug!(source_id = %self.core.id(), op = other, "Unhandled gateway opcode");
                }
            }
        }

        LoopExit::Closed(None)
    }

    fn handle_dispatch(&self, payload: GatewayPayload, raw: Value, ready: &mut Option<ReadySender>) {
        let Some(name) = payload.t else {
            return;
        };

        match name.as_str() {
            "READY" => {
                {
                    let mut session = self.session();
                    session.session_id = payload
                        .d
                        .get("session_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    session.resume_url = payload
                        .d
                        .get("resume_gateway_url")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                self.complete_connect(ready);
            }
            "RESUMED" => self.complete_connect(ready),
            _ => {}
        }

        self.core
            .emit_event(&name, into_object(payload.d, "data"), Some(raw));
    }

    fn complete_connect(&self, ready: &mut Option<ReadySender>) {
        self.core.mark_connected();
        self.core.reset_reconnect_attempts();
        if let Some(tx) = ready.take() {
            let _ = tx.send(Ok(()));
        }
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
impl EventSource for DiscordGatewaySource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        self.core.mark_connecting()?;

        let endpoint = self.endpoint();
        info!(source_id = %self.core.id(), endpoint = %endpoint, "Connecting to gateway");

        let stream = match connect_async(endpoint.as_str()).await {
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
            Err(_) => Err(anyhow!("gateway reader for '{}' ended before READY", self.core.id())),
        }
    }

    async fn disconnect(&self) {
        self.heartbeat.abort();
        self.reader.abort();
        close_writer(&self.writer).await;
    }
}
