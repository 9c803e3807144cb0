//! Transport implementations.
//!
//! Each transport composes a [`core::SourceCore`] and implements
//! [`EventSource`](crate::source::EventSource) for its protocol.

pub mod core;
pub mod cron;
pub mod discord;
pub mod rss;
pub mod slack;
pub mod sse;
pub mod websocket;

pub use self::cron::CronSource;
pub use self::discord::DiscordGatewaySource;
pub use self::rss::RssSource;
pub use self::slack::SlackSocketSource;
pub use self::sse::SseSource;
pub use self::websocket::WebSocketSource;

use self::core::SourceCore;
use anyhow::{Context, Result};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a socket, shared between a reader task and its callers.
pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>>;

pub(crate) fn shared_writer() -> SharedWriter {
    Arc::new(tokio::sync::Mutex::new(None))
}

/// Serializes `value` and writes it as a text frame.
///
/// Returns `Ok(false)` when no socket is open.
pub(crate) async fn send_json(writer: &SharedWriter, value: &Value) -> Result<bool> {
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(sink) => {
            sink.send(Message::Text(value.to_string().into()))
                .await
                .context("Failed to write WebSocket frame")?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Stores the write half of a freshly opened socket.
///
/// Fails without storing it when the source was stopped while the socket
/// was opening; the caller must not start a reader in that case.
pub(crate) async fn install_writer(
    core: &SourceCore,
    writer: &SharedWriter,
    sink: SplitSink<WsStream, Message>,
) -> Result<()> {
    let mut slot = writer.lock().await;
    core.ensure_active()?;
    *slot = Some(sink);
    Ok(())
}

/// Drops the write half, sending a close frame first.
pub(crate) async fn close_writer(writer: &SharedWriter) {
    if let Some(mut sink) = writer.lock().await.take() {
        let _ = sink.close().await;
    }
}

/// Owns at most one background task; replacing or clearing it aborts the old one.
#[derive(Default)]
pub(crate) struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    pub(crate) fn set(&self, handle: JoinHandle<()>) {
        let previous = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub(crate) fn abort(&self) {
        let current = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(current) = current {
            current.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
