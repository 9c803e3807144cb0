// Event model, status and stats
pub mod event;

// Source configuration and runner file loading
pub mod config;

// Domain error vocabulary
pub mod error;

pub use config::{SourceConfig, SourceKind};
pub use error::SourceError;
pub use event::{Event, SourceStats, SourceStatus};
