//! Error types for the Emlog meter bridge.
//!
//! Fetch errors never leave the coordinator; they are folded into the next
//! snapshot. Configuration errors are the only ones surfaced at startup.

use thiserror::Error;

/// Reasons a single export fetch can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The device answered with something other than 200
    #[error("HTTP {status} from {host} (index {meter_index})")]
    Status {
        status: u16,
        host: String,
        meter_index: u8,
    },

    /// No answer within the request timeout
    #[error("Timeout connecting to {host} (index {meter_index})")]
    Timeout { host: String, meter_index: u8 },

    /// Connection refused, DNS failure, reset, ...
    #[error("Transport error at {host} (index {meter_index}): {message}")]
    Transport {
        host: String,
        meter_index: u8,
        message: String,
    },

    /// Body was not valid JSON
    #[error("Invalid JSON from {host} (index {meter_index}): {message}")]
    Decode {
        host: String,
        meter_index: u8,
        message: String,
    },
}

/// Outcome of probing a device before it is polled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Response is not an Emlog export, missing fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
}

/// Configuration problems detected while loading or validating settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required setting {key}")]
    Missing { key: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    pub fn missing<S: Into<String>>(key: S) -> Self {
        ConfigError::Missing { key: key.into() }
    }

    pub fn invalid<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}
