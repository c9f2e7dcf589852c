/*!
 * Device command definitions.
 *
 * Commands are a tagged enum with named, typed fields; byte packing is
 * confined to the wire codec in [`crate::frame`]. The rest of the stack
 * never sees the positional payload layout.
 */
use std::time::Duration;

use serde::{Deserialize, Serialize};

use perfuse_core::types::FluidicPort;

/// Command id for the clear/idle sentinel, sent once at synchronization
/// start
pub const CMD_CLEAR: u8 = 0;
/// Command id for adding medium from a selector port
pub const CMD_ADD_MEDIUM: u8 = 1;
/// Command id for removing medium from the flow cell
pub const CMD_REMOVE_MEDIUM: u8 = 2;

/// Pump control mode for medium delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Pump driven at constant power
    ConstantPower,
    /// Pump regulated to a constant pressure
    ConstantPressure,
}

impl ControlMode {
    /// Wire encoding of the control mode
    pub fn as_byte(&self) -> u8 {
        match self {
            ControlMode::ConstantPower => 1,
            ControlMode::ConstantPressure => 2,
        }
    }
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::ConstantPressure
    }
}

/// A device command
///
/// The uid is not part of the command; it is allocated by the protocol
/// synchronizer when the command is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Clear/idle sentinel; resets the MCU command slot
    Clear,
    /// Deliver medium from a selector port into the flow cell
    AddMedium {
        /// Selector valve port to draw from
        port: FluidicPort,
        /// Pump control mode
        mode: ControlMode,
        /// Power or pressure setpoint (command-specific units)
        setpoint: u16,
        /// How long to flow
        duration: Duration,
    },
    /// Remove medium from the flow cell to waste
    RemoveMedium,
}

impl Command {
    /// Wire command id
    pub fn id(&self) -> u8 {
        match self {
            Command::Clear => CMD_CLEAR,
            Command::AddMedium { .. } => CMD_ADD_MEDIUM,
            Command::RemoveMedium => CMD_REMOVE_MEDIUM,
        }
    }

    /// Human-readable name for log messages
    pub fn name(&self) -> &'static str {
        match self {
            Command::Clear => "clear",
            Command::AddMedium { .. } => "add medium",
            Command::RemoveMedium => "remove medium",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids() {
        assert_eq!(Command::Clear.id(), 0);
        assert_eq!(
            Command::AddMedium {
                port: FluidicPort::new(8).unwrap(),
                mode: ControlMode::default(),
                setpoint: 125,
                duration: Duration::from_secs(15),
            }
            .id(),
            1
        );
        assert_eq!(Command::RemoveMedium.id(), 2);
    }

    #[test]
    fn test_control_mode_bytes() {
        assert_eq!(ControlMode::ConstantPower.as_byte(), 1);
        assert_eq!(ControlMode::ConstantPressure.as_byte(), 2);
        assert_eq!(ControlMode::default(), ControlMode::ConstantPressure);
    }
}
