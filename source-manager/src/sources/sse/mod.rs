//! Server-Sent Events client.
//!
//! `connect()` resolves once the response status is known to be a success;
//! the body is consumed in the background until the stream ends.

pub mod parser;

use self::parser::{SseMessage, SseParser};
use super::core::{into_object, reconnector, SourceCore};
use super::TaskSlot;
use crate::source::EventSource;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Deserialize;
use serde_json::Value;
use sourcebus::{SourceConfig, SourceError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
struct SseOptions {
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

pub struct SseSource {
    core: Arc<SourceCore>,
    url: String,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    stream: TaskSlot,
}

impl SseSource {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let options: SseOptions = config.decode_options()?;
        let url = config.require("url", &options.url)?.to_string();

        Ok(Self {
            core: Arc::new(SourceCore::new(config)),
            url,
            headers: options.headers,
            http: reqwest::Client::new(),
            stream: TaskSlot::default(),
        })
    }

    async fn open(&self) -> Result<reqwest::Response, String> {
        let mut request = self
            .http
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        Ok(response)
    }

    async fn consume(self: Arc<Self>, response: reqwest::Response) {
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut reason = None;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for message in parser.feed(&bytes) {
                        self.dispatch(message);
                    }
                }
                Err(e) => {
                    reason = Some(e.to_string());
                    break;
                }
            }
        }

        let reason = reason.unwrap_or_else(|| "stream ended".to_string());
        let reconnect = reconnector(&self);
        self.core.handle_disconnect(Some(reason), reconnect);
    }

    fn dispatch(&self, message: SseMessage) {
        debug!(source_id = %self.core.id(), event_type = %message.event_type, "SSE event");
        let data = match serde_json::from_str::<Value>(&message.data) {
            Ok(value) => into_object(value, "data"),
            Err(_) => into_object(Value::String(message.data.clone()), "data"),
        };
        self.core
            .emit_event(&message.event_type, data, Some(Value::String(message.data)));
    }
}

#[async_trait]
impl EventSource for SseSource {
    fn core(&self) -> &SourceCore {
        &self.core
    }

    async fn connect(self: Arc<Self>) -> Result<()> {
        self.core.mark_connecting()?;
        info!(source_id = %self.core.id(), url = %self.url, "Opening event stream");

        let response = match self.open().await {
            Ok(response) => response,
            Err(reason) => {
                self.core.mark_failed(&reason);
                return Err(SourceError::ConnectFailed {
                    id: self.core.id().to_string(),
                    reason,
                }
                .into());
            }
        };
        self.core.ensure_active()?;

        self.core.mark_connected();
        self.stream
            .set(tokio::spawn(Arc::clone(&self).consume(response)));
        Ok(())
    }

    async fn disconnect(&self) {
        self.stream.abort();
    }
}
