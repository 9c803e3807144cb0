//! Shared state machine composed by every transport.
//!
//! Tracks status and counters, applies the event-type filter, publishes
//! signals onto the source's own channel, and runs the reconnect-on-disconnect
//! algorithm. Nothing here knows about a particular protocol; reconnecting
//! goes through a [`Reconnector`] closure supplied by the transport.

use crate::reconnect::ReconnectPolicy;
use crate::source::{EventSource, SourceSignal};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use sourcebus::{Event, SourceConfig, SourceStats, SourceStatus};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Re-runs a transport's `connect()`; used by the reconnect timer.
pub type Reconnector = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builds a [`Reconnector`] that calls `connect()` on the given source.
pub fn reconnector<S: EventSource + 'static>(source: &Arc<S>) -> Reconnector {
    let source = Arc::clone(source);
    Arc::new(move || {
        let source = Arc::clone(&source);
        Box::pin(async move { source.connect().await })
    })
}

/// Wraps a non-object payload as `{key: value}`; objects pass through.
pub fn into_object(value: Value, key: &str) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(key.to_string(), other);
            map
        }
    }
}

#[derive(Debug)]
struct CoreState {
    status: SourceStatus,
    events_received: u64,
    last_event_at: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    policy: ReconnectPolicy,
}

/// Status, counters and reconnect handling for one source.
pub struct SourceCore {
    config: SourceConfig,
    state: Mutex<CoreState>,
    /// The single pending reconnect timer
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    signals_tx: mpsc::UnboundedSender<SourceSignal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<SourceSignal>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SourceCore {
    pub fn new(config: SourceConfig) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy::from_config(&config);
        Self {
            config,
            state: Mutex::new(CoreState {
                status: SourceStatus::Disconnected,
                events_received: 0,
                last_event_at: None,
                connected_at: None,
                policy,
            }),
            reconnect_timer: Mutex::new(None),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn status(&self) -> SourceStatus {
        lock(&self.state).status
    }

    pub fn is_stopped(&self) -> bool {
        self.status().is_stopped()
    }

    pub fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<SourceSignal>> {
        lock(&self.signals_rx).take()
    }

    pub fn stats(&self) -> SourceStats {
        let state = lock(&self.state);
        SourceStats {
            id: self.config.id.clone(),
            kind: self.config.kind,
            status: state.status,
            events_received: state.events_received,
            last_event_at: state.last_event_at,
            connected_at: state.connected_at,
            reconnect_attempts: state.policy.attempts(),
        }
    }

    /// Moves to `status` unless the source has been stopped.
    fn transition(&self, status: SourceStatus) -> bool {
        let mut state = lock(&self.state);
        if state.status.is_stopped() {
            return false;
        }
        state.status = status;
        true
    }

    /// Called by `connect()` before any I/O.
    pub fn mark_connecting(&self) -> Result<()> {
        if !self.transition(SourceStatus::Connecting) {
            return Err(anyhow!("source '{}' is stopped", self.config.id));
        }
        debug!(source_id = %self.config.id, kind = %self.config.kind, "Connecting");
        Ok(())
    }

    /// Called once the protocol-specific ready signal has arrived.
    pub fn mark_connected(&self) {
        {
            let mut state = lock(&self.state);
            if state.status.is_stopped() {
                return;
            }
            state.status = SourceStatus::Connected;
            state.connected_at = Some(Utc::now());
        }
        info!(source_id = %self.config.id, kind = %self.config.kind, "Source connected");
        self.signal(SourceSignal::Connected {
            source: self.config.id.clone(),
        });
    }

    /// Records a failed connect attempt.
    pub fn mark_failed(&self, reason: &str) {
        if self.transition(SourceStatus::Error) {
            warn!(source_id = %self.config.id, reason = %reason, "Connect failed");
        }
    }

    /// Fails when the source was stopped while a connect was in flight, so
    /// the transport can drop whatever it just opened.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(anyhow!("source '{}' was stopped during connect", self.config.id));
        }
        Ok(())
    }

    pub fn reset_reconnect_attempts(&self) {
        lock(&self.state).policy.reset();
    }

    /// Publishes an event unless the filter rejects its type.
    ///
    /// Returns false when the event was filtered out or the source is
    /// stopped; in that case no counter moves and nothing is published.
    pub fn emit_event(&self, event_type: &str, data: Map<String, Value>, raw: Option<Value>) -> bool {
        if !self.config.accepts(event_type) {
            debug!(source_id = %self.config.id, event_type = %event_type, "Event filtered");
            return false;
        }

        let event = Event::new(self.config.id.clone(), event_type, data, raw);
        {
            let mut state = lock(&self.state);
            if state.status.is_stopped() {
                return false;
            }
            state.events_received += 1;
            state.last_event_at = Some(event.timestamp);
        }
        self.signal(SourceSignal::Event(event));
        true
    }

    /// Publishes a non-fatal error signal.
    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(source_id = %self.config.id, error = %message, "Source error");
        self.signal(SourceSignal::Error {
            source: self.config.id.clone(),
            message,
        });
    }

    fn signal(&self, signal: SourceSignal) {
        // Receiver gone means nobody is listening any more
        let _ = self.signals_tx.send(signal);
    }

    /// Sets status to `stopped` and clears the pending reconnect timer.
    pub fn begin_stop(&self) {
        lock(&self.state).status = SourceStatus::Stopped;
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.abort();
        }
    }

    /// Moves to `disconnected` and announces it. Returns false if stopped.
    fn enter_disconnected(&self, reason: Option<&str>) -> bool {
        {
            let mut state = lock(&self.state);
            if state.status.is_stopped() {
                return false;
            }
            state.status = SourceStatus::Disconnected;
            state.connected_at = None;
        }
        info!(
            source_id = %self.config.id,
            reason = reason.unwrap_or("unknown"),
            "Source disconnected"
        );
        self.signal(SourceSignal::Disconnected {
            source: self.config.id.clone(),
            reason: reason.map(str::to_string),
        });
        true
    }

    fn should_retry(&self) -> bool {
        lock(&self.state).policy.should_retry()
    }

    /// Handles a dropped connection.
    ///
    /// No-op once stopped. Otherwise announces the disconnect and, while the
    /// policy allows, schedules a single retry after the fixed delay. The
    /// timer re-checks `stopped` when it fires. A failed attempt is reported
    /// as an error and then handled like the new connection dropping.
    pub fn handle_disconnect(self: &Arc<Self>, reason: Option<String>, reconnect: Reconnector) {
        if !self.enter_disconnected(reason.as_deref()) {
            return;
        }
        if !self.should_retry() {
            debug!(source_id = %self.config.id, "Reconnect not scheduled");
            return;
        }

        let core = Arc::clone(self);
        let delay = self.config.reconnect_delay();
        let timer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;

                let attempt = {
                    let mut state = lock(&core.state);
                    if state.status.is_stopped() {
                        return;
                    }
                    state.policy.record_attempt()
                };
                info!(source_id = %core.config.id, attempt = attempt, "Reconnecting");

                match reconnect().await {
                    Ok(()) => return,
                    Err(e) => {
                        error!(source_id = %core.config.id, attempt = attempt, error = %e, "Reconnect failed");
                        core.emit_error(format!("reconnect failed: {}", e));
                        if !core.enter_disconnected(Some(&e.to_string())) || !core.should_retry() {
                            return;
                        }
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.reconnect_timer).replace(timer) {
            previous.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn has_pending_reconnect(&self) -> bool {
        lock(&self.reconnect_timer)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}
