use crate::sources::core::SourceCore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sourcebus::{Event, SourceConfig, SourceError, SourceKind, SourceStats, SourceStatus};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Signal produced by a source onto its own outbound channel.
#[derive(Clone, Debug)]
pub enum SourceSignal {
    Event(Event),
    Connected {
        source: String,
    },
    Disconnected {
        source: String,
        reason: Option<String>,
    },
    Error {
        source: String,
        message: String,
    },
}

/// Transport interface for event sources.
///
/// Every transport composes a [`SourceCore`] for status, counters, filtering
/// and reconnection, and implements the protocol-specific parts itself.
///
/// # Lifecycle
/// 1. Factory builds the source from a [`SourceConfig`] (options validated here)
/// 2. Manager takes the signal receiver via [`take_signals`](EventSource::take_signals)
/// 3. Manager calls [`connect`](EventSource::connect); status moves to
///    `connecting`, then `connected` once the protocol's ready signal arrives
/// 4. Dropped connections go through [`SourceCore::handle_disconnect`]
/// 5. [`stop`](EventSource::stop) makes the source permanently inert
///
/// # Example
/// ```no_run
/// use source_manager::registry::create_source;
/// use sourcebus::{SourceConfig, SourceKind};
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = SourceConfig::new(SourceKind::Cron, "ticker").with_option("schedule", "5s");
/// let source = create_source(config)?;
/// let mut signals = source.take_signals().expect("fresh source");
/// source.clone().connect().await?;
/// while let Some(signal) = signals.recv().await {
///     println!("{:?}", signal);
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Shared state machine for this source.
    fn core(&self) -> &SourceCore;

    fn id(&self) -> &str {
        &self.core().config().id
    }

    fn kind(&self) -> SourceKind {
        self.core().config().kind
    }

    fn config(&self) -> &SourceConfig {
        self.core().config()
    }

    fn status(&self) -> SourceStatus {
        self.core().status()
    }

    fn stats(&self) -> SourceStats {
        self.core().stats()
    }

    /// Hands out the receiving half of this source's signal channel.
    ///
    /// Returns `None` after the first call.
    fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<SourceSignal>> {
        self.core().take_signals()
    }

    /// Opens the connection (or starts the timer) and resolves once the
    /// protocol-specific ready signal has been seen.
    async fn connect(self: Arc<Self>) -> Result<()>;

    /// Tears down the live connection or timer without touching status.
    async fn disconnect(&self);

    /// Marks the source stopped, clears the pending reconnect, then
    /// disconnects. Safe to call in any state and more than once.
    async fn stop(&self) {
        self.core().begin_stop();
        self.disconnect().await;
    }

    /// Sends data over the source's connection, when the kind supports it.
    async fn send(&self, _data: Value) -> Result<()> {
        Err(SourceError::SendUnsupported(self.kind()).into())
    }
}
