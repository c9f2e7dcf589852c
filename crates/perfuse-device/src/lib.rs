/*!
 * Perfuse Device
 *
 * This crate provides everything that touches the instrument MCU link:
 * the framed binary wire codec, telemetry decoding and calibration, the
 * link transport abstraction (real serial and simulated), and the
 * protocol synchronizer that keeps host and device agreed on the
 * current command.
 */

#![warn(missing_docs)]

// Re-export core types
pub use perfuse_core::prelude;

pub mod command;
pub mod error;
pub mod frame;
pub mod link;
pub mod sync;
pub mod telemetry;

// Re-export the main types for convenience
pub use command::{Command, ControlMode};
pub use error::{DeviceError, Result};
pub use frame::{DecodeError, ExecutionStatus, TelemetryFrame, CMD_FRAME_LEN, MSG_FRAME_LEN};
pub use link::{Link, SimulatedLink};
pub use sync::{LinkStatus, ProtocolSynchronizer};
pub use telemetry::{TelemetryDecoder, TelemetrySnapshot};

// Conditional compilation for the real serial backend
#[cfg(feature = "serial")]
pub use link::SerialLink;

/// Perfuse device crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> std::result::Result<(), perfuse_core::error::Error> {
    tracing::info!("Perfuse Device {} initialized", VERSION);
    Ok(())
}
