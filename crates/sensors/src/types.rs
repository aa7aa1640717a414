//! Common types for the Rhythm device drivers

use ephys_types::SensorError as StreamError;
use thiserror::Error;

/// Status of a device driver
#[derive(Debug, Clone, PartialEq)]
pub enum DriverStatus {
    /// No hardware handle has been acquired
    NotInitialized,
    /// Hardware is open and configured but idle
    Stopped,
    /// Hardware is actively streaming
    Running,
    /// Driver encountered an error
    Error(String),
}

/// Errors that can occur in the device drivers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// A stream-level error reported to consumers.
    #[error("Sensor error: {0}")]
    SensorError(#[from] StreamError),
    /// No hardware handle could be acquired
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    /// Register or frame I/O reported a non-success status
    #[error("Transport error {code}: {context}")]
    TransportError { code: i32, context: String },
    /// Frame header did not carry the expected magic number
    #[error("Framing error: {0}")]
    FramingError(String),
    /// A requested value was rejected
    #[error("Configuration out of range: {0}")]
    ConfigurationOutOfRange(String),
    /// On-board memory self check failed
    #[error("Board memory fault: {0}")]
    BoardMemoryFault(String),
    /// Timeout error
    #[error("Timeout error: {0}")]
    TimeoutError(String),
    /// Operation was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,
    /// Driver not initialized
    #[error("Driver not initialized")]
    NotInitialized,
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),
    /// Generic error
    #[error("Error: {0}")]
    Other(String),
}

impl DriverError {
    pub fn transport(code: i32, context: impl Into<String>) -> Self {
        DriverError::TransportError { code, context: context.into() }
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        DriverError::ConfigurationOutOfRange(msg.into())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::IoError(err.to_string())
    }
}

impl From<DriverError> for StreamError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::SensorError(e) => e,
            DriverError::DeviceNotFound(_) => StreamError::Disconnected,
            DriverError::FramingError(msg) => StreamError::HardwareFault(msg),
            other => StreamError::DriverError(other.to_string()),
        }
    }
}
