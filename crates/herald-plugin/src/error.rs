//! Plugin error types.
//!
//! All plugin subsystems surface errors through [`PluginError`]. Load
//! failures are fatal to the affected adapter only; everything else is
//! recoverable by the caller.

/// Unified error type for the plugin host.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The sandbox could not be built or the script failed to load.
    #[error("failed to load plugin '{plugin}': {reason}")]
    Load { plugin: String, reason: String },

    /// The script called a capability that is restricted for this adapter.
    #[error("plugin '{plugin}' permission denied: {reason}")]
    Permission { plugin: String, reason: String },

    /// An entry-point invocation failed inside the script.
    #[error("plugin '{plugin}' execution failed: {reason}")]
    Execution { plugin: String, reason: String },

    /// No plugin with the given name is loaded.
    #[error("plugin not found: {name}")]
    NotFound { name: String },

    /// The script does not define the requested entry point.
    #[error("plugin '{plugin}' does not define a {entry} function")]
    EntryPointMissing { plugin: String, entry: &'static str },

    /// The adapter's worker thread has shut down.
    #[error("plugin '{plugin}' is closed")]
    Closed { plugin: String },
}

impl PluginError {
    /// Classifies an error raised inside the interpreter.
    ///
    /// Capability denials are tagged by the bridge with a fixed marker so
    /// they can be told apart from ordinary script failures after unwinding.
    pub(crate) fn from_lua(plugin: &str, err: mlua::Error) -> Self {
        let reason = flatten_lua_error(&err);
        if reason.contains("is restricted for this plugin") {
            Self::Permission {
                plugin: plugin.to_owned(),
                reason,
            }
        } else {
            Self::Execution {
                plugin: plugin.to_owned(),
                reason,
            }
        }
    }
}

/// Unwraps mlua's error nesting down to the message a script author would
/// recognize.
fn flatten_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => flatten_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        other => other.to_string(),
    }
}

/// Convenience alias used throughout the plugin crate.
pub type Result<T> = std::result::Result<T, PluginError>;
