use crate::config::SourceKind;
use std::fmt;
use std::time::Duration;

/// Domain errors raised by sources and the manager.
///
/// These travel inside `anyhow::Error`; callers that need to branch on the
/// failure use `err.downcast_ref::<SourceError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    UnknownKind(String),
    MissingOption {
        kind: SourceKind,
        option: &'static str,
    },
    InvalidOption {
        option: String,
        reason: String,
    },
    DuplicateSource(String),
    SourceNotFound(String),
    SendUnsupported(SourceKind),
    NotConnected(String),
    WaitTimeout(Duration),
    ConnectFailed {
        id: String,
        reason: String,
    },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::UnknownKind(kind) => write!(f, "unknown source kind '{}'", kind),
            SourceError::MissingOption { kind, option } => {
                write!(f, "{} source requires options.{}", kind, option)
            }
            SourceError::InvalidOption { option, reason } => {
                write!(f, "invalid option '{}': {}", option, reason)
            }
            SourceError::DuplicateSource(id) => write!(f, "source '{}' already exists", id),
            SourceError::SourceNotFound(id) => write!(f, "source '{}' not found", id),
            SourceError::SendUnsupported(kind) => {
                write!(f, "{} sources do not support send", kind)
            }
            SourceError::NotConnected(id) => write!(f, "source '{}' is not connected", id),
            SourceError::WaitTimeout(timeout) => {
                write!(f, "timed out after {}ms waiting for event", timeout.as_millis())
            }
            SourceError::ConnectFailed { id, reason } => {
                write!(f, "source '{}' failed to connect: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for SourceError {}
