//! Configuration error types.

/// Unified error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid YAML or does not match the schema.
    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// One or more required fields are missing or ill-formed.
    ///
    /// Validation collects every problem before reporting, so `problems`
    /// lists all of them at once.
    #[error("invalid configuration:\n{}", problems.join("\n"))]
    Invalid { problems: Vec<String> },

    /// A duration string could not be parsed (e.g. `connection.timeout`).
    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: String, value: String },
}

/// Convenience alias used throughout the config crate.
pub type Result<T> = std::result::Result<T, ConfigError>;
