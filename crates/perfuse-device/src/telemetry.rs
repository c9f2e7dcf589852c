/*!
 * Telemetry decoding.
 *
 * Converts clamped raw sensor counts from an inbound frame into calibrated
 * physical values. Pure arithmetic: the wire codec has already clamped the
 * raw counts to the sensor transfer window, so there is no failure mode
 * here.
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use perfuse_core::config::{CalibrationConfig, ChannelScale};

use crate::frame::{ExecutionStatus, TelemetryFrame};

/// Linearly scale a clamped raw count onto a channel's physical range
///
/// Total over all inputs: a degenerate scale with no output span (rejected
/// at config load, but representable) reads as `physical_min` instead of
/// dividing by zero.
pub fn scale_raw(scale: &ChannelScale, raw: u16) -> f64 {
    let span = scale.output_max.saturating_sub(scale.output_min);
    if span == 0 {
        return scale.physical_min;
    }
    let raw = raw.clamp(scale.output_min, scale.output_max);
    (raw - scale.output_min) as f64 * (scale.physical_max - scale.physical_min) / span as f64
        + scale.physical_min
}

/// A calibrated view of one telemetry frame
///
/// This is what engine events carry to display collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Last command uid the MCU has fully processed
    pub uid: u16,
    /// Last command id the MCU has fully processed
    pub command_id: u8,
    /// Execution status of that command
    pub status: ExecutionStatus,
    /// Pump power (raw, 0-255)
    pub pump_power: u8,
    /// Selector valve position
    pub selector_valve: u8,
    /// Valve bit-fields
    pub valves: u16,
    /// Positive pressure in psi
    pub pressure_psi: f64,
    /// Vacuum in psi (negative by convention)
    pub vacuum_psi: f64,
    /// Flow readings in microliters per minute
    pub flow_ul_min: [f64; 2],
    /// When the frame was decoded
    pub timestamp: DateTime<Utc>,
}

/// Decoder holding the per-channel calibrations
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    pressure: ChannelScale,
    vacuum: ChannelScale,
    flow: ChannelScale,
}

impl TelemetryDecoder {
    /// Create a decoder from the calibration configuration
    pub fn new(calibration: &CalibrationConfig) -> Self {
        Self {
            pressure: calibration.pressure,
            vacuum: calibration.vacuum,
            flow: calibration.flow,
        }
    }

    /// Build a calibrated snapshot from a decoded frame
    ///
    /// Channel 0 of the pressure pair reads as positive pressure, channel 1
    /// as vacuum.
    pub fn decode(&self, frame: &TelemetryFrame) -> TelemetrySnapshot {
        TelemetrySnapshot {
            uid: frame.uid,
            command_id: frame.command_id,
            status: frame.status,
            pump_power: frame.pump_power,
            selector_valve: frame.selector_valve,
            valves: frame.valves,
            pressure_psi: scale_raw(&self.pressure, frame.pressure_raw[0]),
            vacuum_psi: scale_raw(&self.vacuum, frame.pressure_raw[1]),
            flow_ul_min: [
                scale_raw(&self.flow, frame.flow_raw[0]),
                scale_raw(&self.flow, frame.flow_raw[1]),
            ],
            timestamp: Utc::now(),
        }
    }
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self::new(&CalibrationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{SENSOR_OUTPUT_MAX, SENSOR_OUTPUT_MIN};

    fn frame_with_raw(pressure: [u16; 2], flow: [u16; 2]) -> TelemetryFrame {
        TelemetryFrame {
            uid: 0,
            command_id: 0,
            status: ExecutionStatus::Completed,
            internal_program: 0,
            valves: 0,
            pump_power: 128,
            selector_valve: 3,
            pressure_raw: pressure,
            flow_raw: flow,
        }
    }

    #[test]
    fn test_scale_endpoints() {
        let scale = ChannelScale {
            output_min: SENSOR_OUTPUT_MIN,
            output_max: SENSOR_OUTPUT_MAX,
            physical_min: 0.0,
            physical_max: 5.0,
        };

        assert_eq!(scale_raw(&scale, SENSOR_OUTPUT_MIN), 0.0);
        assert_eq!(scale_raw(&scale, SENSOR_OUTPUT_MAX), 5.0);

        let mid = (SENSOR_OUTPUT_MIN + SENSOR_OUTPUT_MAX) / 2;
        let value = scale_raw(&scale, mid);
        assert!((value - 2.5).abs() < 0.001);
    }

    #[test]
    fn test_scale_clamps_out_of_window() {
        let scale = ChannelScale {
            output_min: SENSOR_OUTPUT_MIN,
            output_max: SENSOR_OUTPUT_MAX,
            physical_min: 0.0,
            physical_max: 5.0,
        };

        assert_eq!(scale_raw(&scale, 0), 0.0);
        assert_eq!(scale_raw(&scale, u16::MAX), 5.0);
    }

    #[test]
    fn test_degenerate_scale_does_not_panic() {
        let inverted = ChannelScale {
            output_min: SENSOR_OUTPUT_MAX,
            output_max: SENSOR_OUTPUT_MIN,
            physical_min: 0.0,
            physical_max: 5.0,
        };
        assert_eq!(scale_raw(&inverted, 8000), 0.0);

        let collapsed = ChannelScale {
            output_min: 8000,
            output_max: 8000,
            physical_min: -1.0,
            physical_max: 1.0,
        };
        assert_eq!(scale_raw(&collapsed, 8000), -1.0);
    }

    #[test]
    fn test_vacuum_sign_convention() {
        let decoder = TelemetryDecoder::default();
        let snapshot =
            decoder.decode(&frame_with_raw([SENSOR_OUTPUT_MAX, SENSOR_OUTPUT_MAX], [0, 0]));

        assert!(snapshot.pressure_psi > 0.0);
        assert!(snapshot.vacuum_psi < 0.0);
        assert_eq!(snapshot.pressure_psi, 5.0);
        assert_eq!(snapshot.vacuum_psi, -5.0);
    }

    #[test]
    fn test_snapshot_carries_frame_fields() {
        let decoder = TelemetryDecoder::default();
        let mut frame = frame_with_raw([SENSOR_OUTPUT_MIN; 2], [SENSOR_OUTPUT_MIN; 2]);
        frame.uid = 17;
        frame.command_id = 1;
        frame.status = ExecutionStatus::InProgress;

        let snapshot = decoder.decode(&frame);
        assert_eq!(snapshot.uid, 17);
        assert_eq!(snapshot.command_id, 1);
        assert_eq!(snapshot.status, ExecutionStatus::InProgress);
        assert_eq!(snapshot.pump_power, 128);
        assert_eq!(snapshot.selector_valve, 3);
        assert_eq!(snapshot.flow_ul_min, [0.0, 0.0]);
    }
}
