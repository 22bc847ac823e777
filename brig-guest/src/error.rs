//! Guest-side failures, grouped by the phase that raised them.

use std::io;

use brig_proto::{DecodeError, Resource};

/// Anything that stops the supervisor or a child before its command runs.
#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    /// Device nodes, console, environment or confinement-root setup.
    #[error("{step}: {source}")]
    Bootstrap {
        /// The setup step that failed.
        step: &'static str,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// The configuration image could not be read or decoded.
    #[error(transparent)]
    Config(#[from] DecodeError),

    /// A `mount(2)` for a configured entry failed.
    #[error("mount {target}: {source}")]
    Mount {
        /// Full guest path of the mount point.
        target: String,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// Process creation or per-child setup failed.
    #[error("{step}: {source}")]
    Spawn {
        /// The spawn step that failed.
        step: &'static str,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// A resource limit could not be applied.
    #[error("setrlimit {resource}: {source}")]
    Limit {
        /// The resource being limited.
        resource: Resource,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// No candidate for the command could be executed.
    #[error("{cmd}? {source}")]
    Exec {
        /// The command as configured.
        cmd: String,
        /// Error from the last meaningful exec attempt.
        #[source]
        source: io::Error,
    },
}

/// Attaches the failing step to a raw syscall result.
pub trait StepExt<T> {
    /// Tags the error as a bootstrap failure.
    fn bootstrap(self, step: &'static str) -> Result<T, GuestError>;
    /// Tags the error as a spawn failure.
    fn spawn_step(self, step: &'static str) -> Result<T, GuestError>;
}

impl<T, E: Into<io::Error>> StepExt<T> for Result<T, E> {
    fn bootstrap(self, step: &'static str) -> Result<T, GuestError> {
        self.map_err(|e| GuestError::Bootstrap {
            step,
            source: e.into(),
        })
    }

    fn spawn_step(self, step: &'static str) -> Result<T, GuestError> {
        self.map_err(|e| GuestError::Spawn {
            step,
            source: e.into(),
        })
    }
}
