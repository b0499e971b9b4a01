//! Runner error types.
//!
//! All orchestration subsystems surface errors through [`RunnerError`].
//! Failures in one event never affect concurrent events; most variants are
//! logged with the event's trace id and the pipeline degrades rather than
//! aborting.

use crate::broker::BrokerError;

/// Unified error type for the orchestration pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Configuration loading or validation failed (fatal at startup).
    #[error(transparent)]
    Config(#[from] herald_config::ConfigError),

    /// A platform operation (publish/subscribe/request) failed.
    #[error("platform error: {reason}")]
    Platform { reason: String },

    /// A completion request failed or its response could not be parsed.
    #[error("completion failed: {reason}")]
    Completion { reason: String },

    /// Platform session creation failed; the event continues without memory.
    #[error("session error: {reason}")]
    Session { reason: String },

    /// A tool-broker failure (unknown tool or remote execution error).
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// An adapter operation failed.
    #[error(transparent)]
    Plugin(#[from] herald_plugin::PluginError),

    /// The operation exceeded its deadline; only the current event's
    /// in-flight calls are aborted.
    #[error("deadline exceeded after {seconds}s")]
    Timeout { seconds: u64 },

    /// The completion loop ended without ever producing a response.
    #[error("no response from model")]
    NoResponse,
}

impl RunnerError {
    /// Wraps an arbitrary platform failure.
    pub fn platform(err: impl std::fmt::Display) -> Self {
        Self::Platform {
            reason: err.to_string(),
        }
    }

    /// Wraps an arbitrary completion failure.
    pub fn completion(err: impl std::fmt::Display) -> Self {
        Self::Completion {
            reason: err.to_string(),
        }
    }
}

/// Convenience alias used throughout the runner crate.
pub type Result<T> = std::result::Result<T, RunnerError>;
