/*!
 * Wire codec for the MCU link.
 *
 * Both directions use fixed-length, big-endian frames. This is the only
 * module that knows the positional byte layout; everything above it works
 * with [`Command`] and [`TelemetryFrame`].
 *
 * Frame revision is fixed at compile time. Outbound frames are 15 bytes:
 *
 * ```text
 * uid:u16 | command_id:u8 | mode:u8 | port:u8 | setpoint:u16 |
 * duration_ms:u32 | reserved[3] | checksum:u8
 * ```
 *
 * Inbound frames are 24 bytes:
 *
 * ```text
 * uid:u16 | command_id:u8 | status:u8 | program:u8 | valves:u16 |
 * pump_power:u8 | selector_valve:u8 | pressure_raw[2]:u16 |
 * flow_raw[2]:u16 | reserved[6] | checksum:u8
 * ```
 */
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Command;

/// Outbound command frame length in bytes
pub const CMD_FRAME_LEN: usize = 15;

/// Inbound telemetry frame length in bytes
pub const MSG_FRAME_LEN: usize = 24;

/// Lowest raw count of the 14-bit sensor transfer window
pub const SENSOR_OUTPUT_MIN: u16 = 1638;

/// Highest raw count of the 14-bit sensor transfer window
pub const SENSOR_OUTPUT_MAX: u16 = 14745;

/// Error type for frame decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is not exactly one telemetry frame long
    #[error("Wrong frame length: expected {expected} bytes, got {actual}")]
    WrongLength {
        /// Expected frame length
        expected: usize,
        /// Actual buffer length
        actual: usize,
    },

    /// The execution status byte is not a known status
    #[error("Unknown execution status byte: {0}")]
    UnknownStatus(u8),
}

/// Command execution status reported by the MCU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Command completed without errors
    Completed,
    /// Command execution in progress
    InProgress,
    /// The MCU rejected the frame checksum
    ChecksumError,
    /// The MCU did not recognize the command
    InvalidCommand,
    /// The command failed during execution
    ExecutionError,
}

impl ExecutionStatus {
    /// Decode the status byte
    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(ExecutionStatus::Completed),
            1 => Ok(ExecutionStatus::InProgress),
            2 => Ok(ExecutionStatus::ChecksumError),
            3 => Ok(ExecutionStatus::InvalidCommand),
            4 => Ok(ExecutionStatus::ExecutionError),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }

    /// Wire encoding of the status
    pub fn as_byte(&self) -> u8 {
        match self {
            ExecutionStatus::Completed => 0,
            ExecutionStatus::InProgress => 1,
            ExecutionStatus::ChecksumError => 2,
            ExecutionStatus::InvalidCommand => 3,
            ExecutionStatus::ExecutionError => 4,
        }
    }

    /// Whether the device reports this command as failed
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::ChecksumError
                | ExecutionStatus::InvalidCommand
                | ExecutionStatus::ExecutionError
        )
    }
}

/// A decoded inbound telemetry frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Last command uid the MCU has fully processed
    pub uid: u16,
    /// Last command id the MCU has fully processed
    pub command_id: u8,
    /// Execution status of that command
    pub status: ExecutionStatus,
    /// Device-internal program id
    pub internal_program: u8,
    /// Valve and sensor bit-fields
    pub valves: u16,
    /// Pump power (raw, 0-255)
    pub pump_power: u8,
    /// Selector valve position
    pub selector_valve: u8,
    /// Raw pressure readings (positive-pressure channel, vacuum channel),
    /// clamped to the sensor transfer window
    pub pressure_raw: [u16; 2],
    /// Raw flow readings, clamped to the sensor transfer window
    pub flow_raw: [u16; 2],
}

/// Serialize a command into an outbound frame
///
/// Infallible: all inputs are host-controlled and pre-validated. Reserved
/// bytes and the checksum byte are zero-filled; the checksum is carried on
/// the wire but never computed (see [`verify_checksum`]).
pub fn encode(command: &Command, uid: u16) -> [u8; CMD_FRAME_LEN] {
    let mut frame = [0u8; CMD_FRAME_LEN];
    let mut buf = &mut frame[..];

    buf.put_u16(uid);
    buf.put_u8(command.id());

    match command {
        Command::Clear | Command::RemoveMedium => {
            // No payload; mode/port/setpoint/duration stay zero.
        }
        Command::AddMedium {
            port,
            mode,
            setpoint,
            duration,
        } => {
            buf.put_u8(mode.as_byte());
            buf.put_u8(port.get());
            buf.put_u16(*setpoint);
            buf.put_u32(duration.as_millis().min(u32::MAX as u128) as u32);
        }
    }

    frame
}

/// Decode one inbound telemetry frame
///
/// Fails with [`DecodeError::WrongLength`] unless the buffer is exactly
/// [`MSG_FRAME_LEN`] bytes. Sensor fields are clamped to the transfer
/// window before anything downstream sees them.
pub fn decode(buffer: &[u8]) -> Result<TelemetryFrame, DecodeError> {
    if buffer.len() != MSG_FRAME_LEN {
        return Err(DecodeError::WrongLength {
            expected: MSG_FRAME_LEN,
            actual: buffer.len(),
        });
    }

    let mut buf = buffer;
    let uid = buf.get_u16();
    let command_id = buf.get_u8();
    let status = ExecutionStatus::from_byte(buf.get_u8())?;
    let internal_program = buf.get_u8();
    let valves = buf.get_u16();
    let pump_power = buf.get_u8();
    let selector_valve = buf.get_u8();
    let pressure_raw = [clamp_raw(buf.get_u16()), clamp_raw(buf.get_u16())];
    let flow_raw = [clamp_raw(buf.get_u16()), clamp_raw(buf.get_u16())];

    Ok(TelemetryFrame {
        uid,
        command_id,
        status,
        internal_program,
        valves,
        pump_power,
        selector_valve,
        pressure_raw,
        flow_raw,
    })
}

/// Clamp a raw sensor reading to the transfer window
///
/// Protects downstream calibration arithmetic from saturation artifacts.
pub fn clamp_raw(raw: u16) -> u16 {
    raw.clamp(SENSOR_OUTPUT_MIN, SENSOR_OUTPUT_MAX)
}

/// Verify the frame checksum
///
/// The checksum byte is reserved in the layout but the deployed firmware
/// never computes it, so this always passes. The seam exists so a firmware
/// that does enforce it can be supported without touching callers.
pub fn verify_checksum(_buffer: &[u8]) -> bool {
    true
}

impl TelemetryFrame {
    /// Serialize this frame back into wire bytes
    ///
    /// Used by the simulated link and by loopback tests; the codec is a
    /// fixed bijection over the non-reserved fields.
    pub fn encode(&self) -> [u8; MSG_FRAME_LEN] {
        let mut frame = [0u8; MSG_FRAME_LEN];
        let mut buf = &mut frame[..];

        buf.put_u16(self.uid);
        buf.put_u8(self.command_id);
        buf.put_u8(self.status.as_byte());
        buf.put_u8(self.internal_program);
        buf.put_u16(self.valves);
        buf.put_u8(self.pump_power);
        buf.put_u8(self.selector_valve);
        buf.put_u16(self.pressure_raw[0]);
        buf.put_u16(self.pressure_raw[1]);
        buf.put_u16(self.flow_raw[0]);
        buf.put_u16(self.flow_raw[1]);

        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ControlMode;
    use perfuse_core::types::FluidicPort;
    use std::time::Duration;

    fn add_medium() -> Command {
        Command::AddMedium {
            port: FluidicPort::new(8).unwrap(),
            mode: ControlMode::ConstantPressure,
            setpoint: 0x0102,
            duration: Duration::from_secs(15),
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode(&add_medium(), 0x0304);

        assert_eq!(frame.len(), CMD_FRAME_LEN);
        assert_eq!(&frame[0..2], &[0x03, 0x04]); // uid
        assert_eq!(frame[2], 1); // command id
        assert_eq!(frame[3], 2); // constant pressure
        assert_eq!(frame[4], 8); // port
        assert_eq!(&frame[5..7], &[0x01, 0x02]); // setpoint
        assert_eq!(&frame[7..11], &15_000u32.to_be_bytes()); // duration ms
        assert_eq!(&frame[11..15], &[0, 0, 0, 0]); // reserved + checksum
    }

    #[test]
    fn test_encode_no_payload() {
        let frame = encode(&Command::Clear, 0);
        assert_eq!(frame, [0u8; CMD_FRAME_LEN]);

        let frame = encode(&Command::RemoveMedium, 7);
        assert_eq!(&frame[0..2], &[0, 7]);
        assert_eq!(frame[2], 2);
        assert_eq!(&frame[3..], &[0u8; CMD_FRAME_LEN - 3]);
    }

    #[test]
    fn test_telemetry_round_trip() {
        let frame = TelemetryFrame {
            uid: 42,
            command_id: 1,
            status: ExecutionStatus::InProgress,
            internal_program: 3,
            valves: 0b1010_0000_0101_0001,
            pump_power: 200,
            selector_valve: 8,
            pressure_raw: [2000, 14000],
            flow_raw: [1700, 9000],
        };

        let decoded = decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_wrong_length() {
        let err = decode(&[0u8; MSG_FRAME_LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::WrongLength {
                expected: MSG_FRAME_LEN,
                actual: MSG_FRAME_LEN - 1,
            }
        );

        assert!(decode(&[0u8; 2 * MSG_FRAME_LEN]).is_err());
    }

    #[test]
    fn test_decode_unknown_status() {
        let mut buf = [0u8; MSG_FRAME_LEN];
        buf[3] = 250;
        assert_eq!(decode(&buf).unwrap_err(), DecodeError::UnknownStatus(250));
    }

    #[test]
    fn test_sensor_clamping() {
        let frame = TelemetryFrame {
            uid: 1,
            command_id: 0,
            status: ExecutionStatus::Completed,
            internal_program: 0,
            valves: 0,
            pump_power: 0,
            selector_valve: 0,
            pressure_raw: [0, 0xFFFF],
            flow_raw: [100, 16000],
        };

        let decoded = decode(&frame.encode()).unwrap();
        assert_eq!(decoded.pressure_raw, [SENSOR_OUTPUT_MIN, SENSOR_OUTPUT_MAX]);
        assert_eq!(decoded.flow_raw, [SENSOR_OUTPUT_MIN, SENSOR_OUTPUT_MAX]);
    }

    #[test]
    fn test_status_bytes() {
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::InProgress,
            ExecutionStatus::ChecksumError,
            ExecutionStatus::InvalidCommand,
            ExecutionStatus::ExecutionError,
        ] {
            assert_eq!(ExecutionStatus::from_byte(status.as_byte()), Ok(status));
        }
        assert!(ExecutionStatus::from_byte(99).is_err());
        assert!(ExecutionStatus::ExecutionError.is_error());
        assert!(!ExecutionStatus::Completed.is_error());
        assert!(!ExecutionStatus::InProgress.is_error());
    }
}
