//! Error types for the capture and streaming pipeline.
//!
//! Every fallible operation in the crate returns [`StreamError`]. The variants follow
//! the pipeline's failure taxonomy:
//!
//! - **Allocation**: both memory pools exhausted while growing a frame slot. Fatal; the
//!   whole pipeline has to be re-initialised.
//! - **Admission**: a stream request arrived while the client registry was full.
//! - **Disconnect**: a stream client went away; recovered locally by dropping it.
//! - **Sensor**: the capture driver failed to deliver a frame.
//! - **Settings / Config / Persistence**: rejected parameters and file problems.
//!
//! ## Fatal errors
//!
//! ```rust
//! use framecast::StreamError;
//!
//! let error = StreamError::allocation_exhausted(48_000);
//! assert!(error.is_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::registry::ClientId;

/// Result type alias for pipeline operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for the capture and streaming pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Frame buffer allocation of {requested} bytes failed in every memory pool")]
    AllocationExhausted { requested: usize },

    #[error("Client registry is full ({capacity} clients)")]
    RegistryFull { capacity: usize },

    #[error("Stream client {client} disconnected")]
    Disconnected {
        client: ClientId,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Sensor capture failed: {reason}")]
    Sensor {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Unknown setting '{key}'")]
    UnknownSetting { key: String },

    #[error("Value {value} out of range for '{key}' (expected {min}..={max})")]
    InvalidSetting { key: &'static str, value: i32, min: i32, max: i32 },

    #[error("Configuration error in {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("Settings store error: {path}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed request: {details}")]
    Request { details: String },

    #[error("Restart requested: {reason}")]
    RestartRequested { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Returns whether the pipeline cannot continue after this error.
    ///
    /// Fatal errors end every worker; the caller is expected to rebuild the pipeline
    /// from scratch.
    pub fn is_fatal(&self) -> bool {
        match self {
            StreamError::AllocationExhausted { .. } => true,
            StreamError::RestartRequested { .. } => true,
            StreamError::RegistryFull { .. } => false,
            StreamError::Disconnected { .. } => false,
            StreamError::Sensor { .. } => false,
            StreamError::UnknownSetting { .. } => false,
            StreamError::InvalidSetting { .. } => false,
            StreamError::Config { .. } => false,
            StreamError::Persistence { .. } => false,
            StreamError::Request { .. } => false,
            StreamError::Io(_) => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            StreamError::AllocationExhausted { .. } => vec![
                "Restart the device",
                "Lower the frame size or JPEG quality",
                "Enable external memory if the board has it",
            ],
            StreamError::RegistryFull { .. } => {
                vec!["Close an existing stream", "Retry the connection later"]
            }
            StreamError::Disconnected { .. } => vec!["Reconnect to the stream endpoint"],
            StreamError::Sensor { .. } => vec![
                "Check the sensor wiring and power",
                "Verify the frame source is readable",
            ],
            StreamError::UnknownSetting { .. } => vec!["Check the setting name spelling"],
            StreamError::InvalidSetting { .. } => vec!["Use a value inside the documented range"],
            StreamError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Remove the file to fall back to defaults",
            ],
            StreamError::Persistence { .. } => vec![
                "Check the settings file permissions",
                "Reset the stored settings",
            ],
            StreamError::Request { .. } => vec!["Send a well-formed HTTP GET request"],
            StreamError::RestartRequested { .. } => vec!["Wait for the pipeline to come back"],
            StreamError::Io(_) => vec!["Check network connectivity"],
        }
    }

    /// Helper constructor for allocation failures.
    pub fn allocation_exhausted(requested: usize) -> Self {
        StreamError::AllocationExhausted { requested }
    }

    /// Helper constructor for sensor failures.
    pub fn sensor_failed(reason: impl Into<String>) -> Self {
        StreamError::Sensor { reason: reason.into(), source: None }
    }

    /// Helper constructor for sensor failures with source.
    pub fn sensor_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        StreamError::Sensor { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for disconnects.
    pub fn disconnected(client: ClientId, source: Option<std::io::Error>) -> Self {
        StreamError::Disconnected { client, source }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        StreamError::Config { path: path.into(), details: details.into() }
    }

    /// Helper constructor for settings store errors.
    pub fn persistence_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamError::Persistence { path: path.into(), source }
    }

    /// Helper constructor for malformed requests.
    pub fn bad_request(details: impl Into<String>) -> Self {
        StreamError::Request { details: details.into() }
    }

    /// Helper constructor for restart requests.
    pub fn restart_requested(reason: impl Into<String>) -> Self {
        StreamError::RestartRequested { reason: reason.into() }
    }
}
