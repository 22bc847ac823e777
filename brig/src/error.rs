//! Error types for brig host operations.

use std::path::PathBuf;

use brig_proto::EncodeError;

/// Alias for `Result<T, brig::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while preparing or running a sandbox.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A required helper binary was not found.
    #[error("cannot find {name} (searched {})", display_paths(searched))]
    BinaryNotFound {
        /// File name that was looked for.
        name: &'static str,
        /// Every candidate that was checked, in order.
        searched: Vec<PathBuf>,
    },

    /// A port or socket forwarding spec is malformed.
    #[error("invalid forward {spec:?}: {reason}")]
    InvalidForward {
        /// The spec as given.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A directory share spec is malformed or points nowhere.
    #[error("invalid share {spec:?}: {reason}")]
    InvalidShare {
        /// The spec as given.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A resource limit spec is malformed.
    #[error("invalid limit {spec:?}: {reason}")]
    InvalidLimit {
        /// The spec as given.
        spec: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The guest memory size is not a number with an optional K/M/G suffix.
    #[error("invalid memory size {0:?}")]
    InvalidMemory(String),

    /// No command was given to run.
    #[error("no command given")]
    NoCommand,

    /// The configuration could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// An I/O error while preparing, launching or supervising the guest.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller supplied bad input, as opposed to a runtime failure.
    pub const fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::BinaryNotFound { .. }
                | Self::InvalidForward { .. }
                | Self::InvalidShare { .. }
                | Self::InvalidLimit { .. }
                | Self::InvalidMemory(_)
                | Self::NoCommand
        )
    }
}

/// Comma-joined paths for diagnostics.
fn display_paths(paths: &[PathBuf]) -> String {
    let parts: Vec<_> = paths.iter().map(|p| p.display().to_string()).collect();
    parts.join(", ")
}
