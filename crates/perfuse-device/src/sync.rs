/*!
 * Protocol synchronizer.
 *
 * Owns the serial link, the single outstanding-command slot, and the
 * monotonically increasing command uid. The MCU echoes the uid and id of
 * the last command it has fully processed; that echo is the fencing token
 * the host uses to decide whether it may advance. The host never acts on
 * a status byte from a frame whose echo does not match the last command
 * sent.
 */
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::error::{DeviceError, Result};
use crate::frame::{self, TelemetryFrame};
use crate::link::Link;

/// Outcome of reconciling one telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Synced, no command outstanding
    Idle,
    /// The device echo has not caught up with the last sent command
    AwaitingSync,
    /// The device is executing the current command
    Executing,
    /// The current command just completed; the caller may send the next one
    ///
    /// Reported exactly once per command: repeats of the same completed
    /// echo return [`LinkStatus::Idle`].
    CommandComplete,
}

/// Synchronizes host command state with the instrument MCU
///
/// Exclusively owns the link; no other component writes to it. Enforces
/// at most one command in flight.
#[derive(Debug)]
pub struct ProtocolSynchronizer {
    link: Box<dyn Link>,
    last_sent_uid: u16,
    last_sent_command_id: u8,
    in_flight: bool,
    mismatch_since: Option<Instant>,
    fault_threshold: Duration,
    latest_frame: Option<TelemetryFrame>,
}

impl ProtocolSynchronizer {
    /// Create a synchronizer owning the given link
    pub fn new(link: Box<dyn Link>, fault_threshold: Duration) -> Self {
        Self {
            link,
            last_sent_uid: 0,
            last_sent_command_id: 0,
            in_flight: false,
            mismatch_since: None,
            fault_threshold,
            latest_frame: None,
        }
    }

    /// Re-synchronize with the device
    ///
    /// Rewinds the uid counter and sends the clear sentinel with uid 0.
    /// The firmware initializes its echo to a reserved command id, so the
    /// echo mismatches until this sentinel is processed.
    pub fn reset(&mut self) -> Result<()> {
        self.last_sent_uid = 0;
        self.last_sent_command_id = Command::Clear.id();
        self.in_flight = false;
        self.mismatch_since = None;
        self.link.write_frame(&frame::encode(&Command::Clear, 0))?;
        debug!("Sent clear sentinel, awaiting MCU echo");
        Ok(())
    }

    /// Send a command, allocating the next uid
    ///
    /// Errors with [`DeviceError::Busy`] while a command is in flight;
    /// callers must wait for [`LinkStatus::CommandComplete`] first.
    pub fn send(&mut self, command: &Command) -> Result<u16> {
        if self.in_flight {
            return Err(DeviceError::Busy(self.last_sent_uid));
        }

        let uid = self.last_sent_uid + 1;
        self.link.write_frame(&frame::encode(command, uid))?;
        self.last_sent_uid = uid;
        self.last_sent_command_id = command.id();
        self.in_flight = true;
        trace!(uid, command = command.name(), "Command sent");
        Ok(uid)
    }

    /// Reconcile one decoded telemetry frame against the host state
    ///
    /// Two-phase check: first the uid/command echo must match what the host
    /// last sent (a persistent mismatch is a fatal desync), and only then is
    /// the execution status acted upon.
    pub fn on_telemetry(&mut self, frame: &TelemetryFrame, now: Instant) -> Result<LinkStatus> {
        // Phase 1: is the MCU up to date with the host?
        if frame.uid != self.last_sent_uid || frame.command_id != self.last_sent_command_id {
            match self.mismatch_since {
                None => {
                    self.mismatch_since = Some(now);
                    debug!(
                        host_uid = self.last_sent_uid,
                        host_cmd = self.last_sent_command_id,
                        mcu_uid = frame.uid,
                        mcu_cmd = frame.command_id,
                        "MCU echo out of sync with host"
                    );
                }
                Some(since) => {
                    let elapsed = now.duration_since(since);
                    if elapsed >= self.fault_threshold {
                        warn!(?elapsed, "Host and MCU out of sync past the fault threshold");
                        return Err(DeviceError::Desync(elapsed));
                    }
                }
            }
            return Ok(LinkStatus::AwaitingSync);
        }
        self.mismatch_since = None;

        // Phase 2: how did the echoed command fare?
        if frame.status.is_error() {
            return Err(DeviceError::CommandFailed(frame.status));
        }
        if frame.status == frame::ExecutionStatus::InProgress {
            return Ok(LinkStatus::Executing);
        }

        // Completed: report readiness exactly once per command.
        if self.in_flight {
            self.in_flight = false;
            trace!(uid = frame.uid, "Command completed");
            Ok(LinkStatus::CommandComplete)
        } else {
            Ok(LinkStatus::Idle)
        }
    }

    /// Poll the link for one frame and reconcile it
    ///
    /// Returns `None` when no complete frame is available this tick. A
    /// malformed frame is dropped for the tick (logged at debug), which the
    /// desync fault detector covers if it recurs indefinitely.
    pub fn poll(&mut self, now: Instant) -> Result<Option<(TelemetryFrame, LinkStatus)>> {
        let Some(buf) = self.link.read_frame()? else {
            return Ok(None);
        };

        let frame = match frame::decode(&buf) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping malformed telemetry frame: {}", e);
                return Ok(None);
            }
        };

        self.latest_frame = Some(frame.clone());
        let status = self.on_telemetry(&frame, now)?;
        Ok(Some((frame, status)))
    }

    /// The newest successfully decoded telemetry frame
    pub fn latest_frame(&self) -> Option<&TelemetryFrame> {
        self.latest_frame.as_ref()
    }

    /// Whether a command is currently in flight
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// The uid of the last command sent
    pub fn last_sent_uid(&self) -> u16 {
        self.last_sent_uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ControlMode;
    use crate::frame::ExecutionStatus;
    use crate::link::SimulatedLink;
    use perfuse_core::types::FluidicPort;

    const THRESHOLD: Duration = Duration::from_secs(3);

    fn add_medium() -> Command {
        Command::AddMedium {
            port: FluidicPort::new(8).unwrap(),
            mode: ControlMode::ConstantPressure,
            setpoint: 125,
            duration: Duration::from_secs(15),
        }
    }

    fn sync_with_sim(latency: Duration) -> (ProtocolSynchronizer, SimulatedLink) {
        let link = SimulatedLink::new(latency);
        let sync = ProtocolSynchronizer::new(Box::new(link.clone()), THRESHOLD);
        (sync, link)
    }

    fn echo(uid: u16, command_id: u8, status: ExecutionStatus) -> TelemetryFrame {
        TelemetryFrame {
            uid,
            command_id,
            status,
            internal_program: 0,
            valves: 0,
            pump_power: 0,
            selector_valve: 0,
            pressure_raw: [8191, 8191],
            flow_raw: [8191, 8191],
        }
    }

    #[test]
    fn test_uid_strictly_increases() {
        let (mut sync, link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t = Instant::now();
        let uid1 = sync.send(&add_medium()).unwrap();
        sync.poll(t).unwrap();
        let uid2 = sync.send(&Command::RemoveMedium).unwrap();

        assert_eq!(uid1, 1);
        assert_eq!(uid2, 2);
        assert_eq!(link.sent_command_ids().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_busy_while_in_flight() {
        let (mut sync, _link) = sync_with_sim(Duration::from_secs(60));
        sync.reset().unwrap();

        sync.send(&add_medium()).unwrap();
        let err = sync.send(&Command::RemoveMedium).unwrap_err();
        assert!(matches!(err, DeviceError::Busy(1)));
    }

    #[test]
    fn test_completion_reported_once() {
        let (mut sync, _link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t = Instant::now();
        let uid = sync.send(&add_medium()).unwrap();
        let completed = echo(uid, 1, ExecutionStatus::Completed);

        assert_eq!(sync.on_telemetry(&completed, t).unwrap(), LinkStatus::CommandComplete);
        // The same synced, completed echo must not signal a second time
        assert_eq!(sync.on_telemetry(&completed, t).unwrap(), LinkStatus::Idle);
        assert_eq!(sync.on_telemetry(&completed, t).unwrap(), LinkStatus::Idle);
    }

    #[test]
    fn test_in_progress_reports_executing() {
        let (mut sync, _link) = sync_with_sim(Duration::from_secs(60));
        sync.reset().unwrap();

        let t = Instant::now();
        let uid = sync.send(&add_medium()).unwrap();
        let frame = echo(uid, 1, ExecutionStatus::InProgress);
        assert_eq!(sync.on_telemetry(&frame, t).unwrap(), LinkStatus::Executing);
        assert!(sync.in_flight());
    }

    #[test]
    fn test_desync_fault_timing() {
        let (mut sync, _link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t0 = Instant::now();
        let uid = sync.send(&add_medium()).unwrap();
        let stale = echo(uid.wrapping_sub(1), 0, ExecutionStatus::Completed);

        // Mismatch starts the clock but is tolerated below the threshold
        assert_eq!(sync.on_telemetry(&stale, t0).unwrap(), LinkStatus::AwaitingSync);
        assert_eq!(
            sync.on_telemetry(&stale, t0 + Duration::from_millis(2999)).unwrap(),
            LinkStatus::AwaitingSync
        );

        // First tick at or past 3 s is the fault
        let err = sync
            .on_telemetry(&stale, t0 + Duration::from_millis(3000))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Desync(_)));
        assert!(err.is_protocol_fault());
    }

    #[test]
    fn test_desync_recovery_within_threshold() {
        let (mut sync, _link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t0 = Instant::now();
        let uid = sync.send(&add_medium()).unwrap();

        let stale = echo(uid.wrapping_sub(1), 0, ExecutionStatus::Completed);
        assert_eq!(sync.on_telemetry(&stale, t0).unwrap(), LinkStatus::AwaitingSync);

        // Device catches up within a second: no fault, normal progression
        let synced = echo(uid, 1, ExecutionStatus::Completed);
        assert_eq!(
            sync.on_telemetry(&synced, t0 + Duration::from_secs(1)).unwrap(),
            LinkStatus::CommandComplete
        );

        // The mismatch clock must have been cleared by the synced frame
        let stale_again = echo(uid.wrapping_sub(1), 0, ExecutionStatus::Completed);
        assert_eq!(
            sync.on_telemetry(&stale_again, t0 + Duration::from_secs(10)).unwrap(),
            LinkStatus::AwaitingSync
        );
    }

    #[test]
    fn test_status_of_unsynced_frame_is_ignored() {
        let (mut sync, _link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t = Instant::now();
        let uid = sync.send(&add_medium()).unwrap();

        // An error status on a stale echo belongs to an old command and
        // must not fault the run
        let stale_error = echo(uid.wrapping_sub(1), 0, ExecutionStatus::ExecutionError);
        assert_eq!(sync.on_telemetry(&stale_error, t).unwrap(), LinkStatus::AwaitingSync);
    }

    #[test]
    fn test_execution_error_on_synced_frame() {
        let (mut sync, _link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t = Instant::now();
        let uid = sync.send(&add_medium()).unwrap();

        for status in [
            ExecutionStatus::ChecksumError,
            ExecutionStatus::InvalidCommand,
            ExecutionStatus::ExecutionError,
        ] {
            let err = sync.on_telemetry(&echo(uid, 1, status), t).unwrap_err();
            assert!(matches!(err, DeviceError::CommandFailed(s) if s == status));
        }
    }

    #[test]
    fn test_poll_against_simulator() {
        let (mut sync, _link) = sync_with_sim(Duration::ZERO);
        sync.reset().unwrap();

        let t = Instant::now();
        // Clear sentinel echoed with nothing in flight reads as idle
        let (frame, status) = sync.poll(t).unwrap().unwrap();
        assert_eq!(frame.uid, 0);
        assert_eq!(status, LinkStatus::Idle);

        sync.send(&add_medium()).unwrap();
        let (frame, status) = sync.poll(t).unwrap().unwrap();
        assert_eq!(frame.uid, 1);
        assert_eq!(status, LinkStatus::CommandComplete);
        assert!(sync.latest_frame().is_some());
    }
}
