//! Source manager - owns every source and fans their signals into one bus.
//!
//! Each source produces onto its own channel. `add` spawns a forwarder per
//! source that feeds the waiter registry and republishes on a broadcast bus.

use crate::registry::create_source;
use crate::source::{EventSource, SourceSignal};
use crate::waiters::{WaitOptions, WaiterRegistry};
use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde_json::Value;
use sourcebus::{Event, SourceConfig, SourceError, SourceStats};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Signals on the bus are source signals, tagged with their source id.
pub type BusSignal = SourceSignal;

const BUS_CAPACITY: usize = 1024;

struct ManagedSource {
    source: Arc<dyn EventSource>,
    /// Moves this source's signals onto the bus
    forwarder: JoinHandle<()>,
}

/// Source manager - the multiplexing event bus.
///
/// # Responsibilities
/// - Create sources from configuration and connect them
/// - Forward every source's signals onto one broadcast bus
/// - Resolve one-shot waiters against the event stream
/// - Stop and discard sources on removal or shutdown
pub struct SourceManager {
    sources: Mutex<HashMap<String, ManagedSource>>,
    bus: broadcast::Sender<BusSignal>,
    waiters: Arc<WaiterRegistry>,
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceManager {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sources: Mutex::new(HashMap::new()),
            bus,
            waiters: Arc::new(WaiterRegistry::new()),
        }
    }

    /// Subscribes to every signal from every source added from now on.
    ///
    /// Slow receivers lag rather than throttle sources.
    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.bus.subscribe()
    }

    /// Creates, registers and connects a source.
    ///
    /// Resolves once the source reports ready. If that initial connect
    /// fails, the source is stopped and discarded so the id can be reused.
    pub async fn add(&self, config: SourceConfig) -> Result<Arc<dyn EventSource>> {
        let id = config.id.clone();
        let kind = config.kind;

        let source = {
            let mut sources = self.sources.lock().await;
            if sources.contains_key(&id) {
                return Err(SourceError::DuplicateSource(id).into());
            }

            let source = create_source(config)?;
            let signals = source
                .take_signals()
                .ok_or_else(|| anyhow!("signals for source '{}' already taken", id))?;
            let forwarder = tokio::spawn(forward(
                signals,
                self.bus.clone(),
                Arc::clone(&self.waiters),
            ));

            sources.insert(
                id.clone(),
                ManagedSource {
                    source: Arc::clone(&source),
                    forwarder,
                },
            );
            source
        };

        info!(source_id = %id, kind = %kind, "Source added");

        if let Err(e) = Arc::clone(&source).connect().await {
            warn!(source_id = %id, error = %e, "Initial connect failed, discarding source");
            let managed = {
                let mut sources = self.sources.lock().await;
                match sources.get(&id) {
                    Some(managed) if Arc::ptr_eq(&managed.source, &source) => sources.remove(&id),
                    _ => None,
                }
            };
            source.stop().await;
            if let Some(managed) = managed {
                managed.forwarder.abort();
            }
            return Err(e);
        }

        Ok(source)
    }

    /// Stops and discards a source. Returns false if the id is unknown.
    pub async fn remove(&self, id: &str) -> bool {
        let Some(managed) = self.sources.lock().await.remove(id) else {
            return false;
        };

        managed.source.stop().await;
        managed.forwarder.abort();
        info!(source_id = %id, "Source removed");
        true
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn EventSource>> {
        self.sources
            .lock()
            .await
            .get(id)
            .map(|managed| Arc::clone(&managed.source))
    }

    /// Stats for every owned source, ordered by id.
    pub async fn stats(&self) -> Vec<SourceStats> {
        let mut stats: Vec<SourceStats> = self
            .sources
            .lock()
            .await
            .values()
            .map(|managed| managed.source.stats())
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    pub async fn len(&self) -> usize {
        self.sources.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sources.lock().await.is_empty()
    }

    /// Sends data through a source that supports it.
    pub async fn send(&self, id: &str, data: Value) -> Result<()> {
        let source = self
            .get(id)
            .await
            .ok_or_else(|| SourceError::SourceNotFound(id.to_string()))?;
        source.send(data).await
    }

    /// Resolves with the first event matching `options`, or fails with
    /// [`SourceError::WaitTimeout`] once the timeout elapses.
    pub async fn wait_for_event(&self, options: WaitOptions) -> Result<Event> {
        self.waiters.wait(options).await
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.pending()
    }

    /// Stops every source in parallel and clears the collection.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, ManagedSource)> = self.sources.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "Stopping all sources");
        join_all(drained.iter().map(|(_, managed)| managed.source.stop())).await;
        for (_, managed) in drained {
            managed.forwarder.abort();
        }
    }
}

/// Moves one source's signals onto the bus, resolving waiters on the way.
async fn forward(
    mut signals: mpsc::UnboundedReceiver<SourceSignal>,
    bus: broadcast::Sender<BusSignal>,
    waiters: Arc<WaiterRegistry>,
) {
    while let Some(signal) = signals.recv().await {
        if let SourceSignal::Event(event) = &signal {
            waiters.dispatch(event);
        }
        // No subscribers is fine
        let _ = bus.send(signal);
    }
}
