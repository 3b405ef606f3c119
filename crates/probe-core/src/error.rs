//! Error types for probe-core
//!
//! These are programmer and configuration errors. Network failures met
//! while measuring are not errors in this sense: they are classified into
//! [`NetError`](crate::failure::NetError) values and archived.

use thiserror::Error;

/// Main error type for probe-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// An endpoint is not of the `ip:port` form
    #[error("Invalid endpoint: {address}")]
    InvalidEndpoint {
        /// The invalid endpoint
        address: String,
    },

    /// Memoryless timing parameters are inconsistent
    #[error("Invalid memoryless configuration: {0}")]
    Memoryless(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// URL parsing error
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an invalid endpoint error
    pub fn invalid_endpoint(address: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            address: address.into(),
        }
    }
}
