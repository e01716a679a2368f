//! Error types for xpbuild operations.

use thiserror::Error;

/// Errors produced while compiling, executing or interpreting a pipeline.
///
/// Cancellation is deliberately not represented here: an interrupted run is a
/// distinct terminal outcome (see [`crate::pipeline::Outcome`]), not a failure.
#[derive(Error, Debug)]
pub enum XpBuildError {
    /// Missing toolchain binary or required source path. Raised before any
    /// process is spawned.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Subrule names that could not be matched to directories anywhere in the
    /// content tree. The caller must pick a fallback compilation scope.
    #[error("unresolved subrules: {}", unresolved.join(", "))]
    AmbiguousDependencies { unresolved: Vec<String> },

    /// The toolchain process could not be started at all.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The toolchain ran but the run cannot be treated as a success and no
    /// structured diagnostics explain why. Raw output is attached for
    /// diagnosis; runs mutate shared output directories and are not retried.
    #[error("toolchain execution failed: {message}")]
    Execution { message: String, raw_output: String },

    /// A pipeline document violated the declaration-order invariant.
    #[error("invalid pipeline: {0}")]
    Pipeline(String),

    /// Malformed caller input (empty tests, rule outside content roots, ...).
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for xpbuild operations.
pub type Result<T> = std::result::Result<T, XpBuildError>;
