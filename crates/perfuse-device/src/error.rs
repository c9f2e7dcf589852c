/*!
 * Error types for the Perfuse device crate.
 */
use std::time::Duration;

use thiserror::Error;

use perfuse_core::error::Error as CoreError;

use crate::frame::{DecodeError, ExecutionStatus};

/// Error type for device and protocol operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The link is not connected
    #[error("Device link not connected")]
    NotConnected,

    /// A command is already in flight
    #[error("A command is already in flight (uid {0})")]
    Busy(u16),

    /// The device echo has not matched the host for longer than the fault
    /// threshold
    #[error("Host and MCU out of sync for {0:?}")]
    Desync(Duration),

    /// The device reported a command execution failure
    #[error("Command execution failed on the device: {0:?}")]
    CommandFailed(ExecutionStatus),

    /// An inbound frame could not be decoded
    #[error("Frame decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error on the link
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial backend error
    #[error("Serial error: {0}")]
    Serial(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }

    /// Whether this error is fatal for the current run
    ///
    /// Desync and command-execution faults require operator intervention;
    /// everything else is a local link problem.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, DeviceError::Desync(_) | DeviceError::CommandFailed(_))
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for DeviceError {
    fn from(err: serialport::Error) -> Self {
        DeviceError::Serial(err.to_string())
    }
}
