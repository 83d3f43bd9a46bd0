//! Error types for the build-avoidance engine.

use std::path::PathBuf;

/// Errors raised by the engine.
///
/// Filesystem cleanup and state persistence are fail-safe and only log their
/// problems; the variants here cover the operations that do fail hard, plus
/// [`BuildFailed`](BuildError::BuildFailed), the one error a successful
/// commit path can end in.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A required argument was empty or otherwise unusable.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: &'static str,
    },

    /// An operation was invoked on a committed or closed build context.
    #[error("illegal state: {reason}")]
    IllegalState {
        /// Which lifecycle rule was violated.
        reason: &'static str,
    },

    /// An I/O error during a probe, scan, read, write, rename, or delete.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An include or exclude pattern could not be compiled.
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying compile error.
        #[source]
        source: globset::Error,
    },

    /// The persisted model could not be serialized.
    #[error("could not serialize build state for {path}: {reason}")]
    Serialization {
        /// The state file path.
        path: PathBuf,
        /// Description of the serialization failure.
        reason: String,
    },

    /// A state file was present but could not be decoded.
    ///
    /// Recovered locally: the caller treats the state as absent and the next
    /// build is full. Exposed so that load sites can log the reason.
    #[error("could not decode build state from {path}: {reason}")]
    Decode {
        /// The state file path.
        path: PathBuf,
        /// Description of the decode failure.
        reason: String,
    },

    /// The commit found persisted error-severity messages for selected inputs.
    #[error("{errors} error(s) encountered, see previous build log for details")]
    BuildFailed {
        /// Number of persisted error-severity messages.
        errors: usize,
    },
}

impl BuildError {
    /// Convenience constructor for [`BuildError::Io`].
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}
