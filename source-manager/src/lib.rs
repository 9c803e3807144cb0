//! Source Manager - live and polled event sources behind one event bus.
//!
//! Each source speaks one protocol (raw WebSocket, a chat gateway, socket
//! mode, cron ticks, Server-Sent Events, RSS/Atom polling) and turns what it
//! receives into [`sourcebus::Event`]s. The manager owns the sources and
//! republishes their events, with a one-shot "wait for the next matching
//! event" primitive on top.
//!
//! # Architecture
//!
//! ```text
//!   WebSocket   Gateway   Socket mode   Cron   SSE   RSS/Atom
//!        \         |          |          |      |      /
//! ┌─────────────────────────────────────────────────────────┐
//! │   Source (implements EventSource, composes SourceCore)   │
//! │  - Protocol handshake / framing / polling                │
//! │  - Status, counters, type filter                         │
//! │  - Fixed-delay reconnect                                 │
//! └─────────────────────────────────────────────────────────┘
//!          ↓  own signal channel per source
//! ┌─────────────────────────────────────────────────────────┐
//! │       Source Manager                                     │
//! │  - add / remove / get / stats                            │
//! │  - Fan-in onto a broadcast bus                           │
//! │  - Resolve one-shot waiters                              │
//! └─────────────────────────────────────────────────────────┘
//!          ↓
//!   Subscribers, waiters, HTTP API
//! ```
//!
//! # Core Types
//!
//! - [`EventSource`] - Transport interface every source implements
//! - [`SourceManager`] - Owns sources and the event bus
//! - [`WaitOptions`] - Criteria for [`SourceManager::wait_for_event`]
//! - [`ReconnectPolicy`] - Fixed-delay retry budget
//!
//! # Waiting for an event
//!
//! ```no_run
//! use source_manager::{SourceManager, WaitOptions};
//! use sourcebus::{SourceConfig, SourceKind};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = SourceManager::new();
//! manager
//!     .add(SourceConfig::new(SourceKind::Cron, "heartbeat").with_option("schedule", "10s"))
//!     .await?;
//!
//! let event = manager
//!     .wait_for_event(
//!         WaitOptions::new()
//!             .source("heartbeat")
//!             .event_type("tick")
//!             .timeout(Duration::from_secs(15)),
//!     )
//!     .await?;
//! println!("{}", event.data["scheduledAt"]);
//!
//! manager.stop_all().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod manager;
pub mod reconnect;
pub mod registry;
pub mod source;
pub mod sources;
pub mod waiters;

// Re-export public types
pub use manager::{BusSignal, SourceManager};
pub use reconnect::ReconnectPolicy;
pub use registry::create_source;
pub use source::{EventSource, SourceSignal};
pub use waiters::{WaitOptions, WaiterRegistry};

// Re-export the data model for convenience
pub use sourcebus::{Event, SourceConfig, SourceError, SourceKind, SourceStats, SourceStatus};
