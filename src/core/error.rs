//! Error taxonomy
//!
//! Three failure classes with very different handling: validation failures
//! are returned to the caller before anything mutates, adapter failures are
//! logged and treated as failed no-ops for the affected (viewer, target)
//! pair, and hook vetoes are ordinary negative results.

use std::path::PathBuf;

use thiserror::Error;

use super::color::HighlightColor;
use super::types::ViewerId;

/// Failure reported by a [`ProtocolAdapter`](super::protocol::ProtocolAdapter).
///
/// Always retryable; callers leave their own state untouched when they see
/// one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("viewer {0:?} has no live connection")]
    Disconnected(ViewerId),
    #[error("host binding failure: {0}")]
    Binding(String),
    #[error("message encode failure: {0}")]
    Encode(String),
}

/// Failure of a highlight operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HighlightError {
    /// The given token is a style code, not a paintable color. Rejected
    /// before any state or wire mutation.
    #[error("{0:?} is not a paintable color")]
    InvalidColor(HighlightColor),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    /// A registered hook denied the operation. Not an error condition;
    /// nothing was sent and nothing was mutated.
    #[error("operation vetoed by a registered hook")]
    Vetoed,
}

/// Failure while loading a [`HighlightConfig`](super::config::HighlightConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
