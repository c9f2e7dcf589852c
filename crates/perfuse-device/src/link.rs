/*!
 * Link transports for the MCU connection.
 *
 * A [`Link`] moves whole frames without blocking: reads return at most one
 * complete inbound frame per call and never wait for bytes, writes hand the
 * frame to the transport's transmit buffer. A backlog of unread frames is
 * resolved newest-frame-wins, so a slow poll tick never acts on stale
 * device state.
 */
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use perfuse_core::config::LinkConfig;

use crate::command::CMD_ADD_MEDIUM;
use crate::error::{DeviceError, Result};
use crate::frame::{ExecutionStatus, TelemetryFrame, CMD_FRAME_LEN, MSG_FRAME_LEN};

/// A non-blocking, frame-oriented transport to the instrument MCU
pub trait Link: Send + Debug {
    /// Enqueue one outbound command frame for transmission
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Read the newest complete inbound frame, if one is buffered
    ///
    /// Returns `None` when less than one complete frame is available or the
    /// buffered byte count is not frame-aligned (a frame is still arriving).
    /// When more than one complete frame has accumulated, all but the newest
    /// are discarded.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Given a buffered byte count, how many leading stale bytes to discard
/// before the newest complete frame
///
/// Returns `None` when no complete, frame-aligned message is available yet.
pub(crate) fn stale_backlog(available: usize) -> Option<usize> {
    if available < MSG_FRAME_LEN || available % MSG_FRAME_LEN != 0 {
        return None;
    }
    Some(available - MSG_FRAME_LEN)
}

/// Serial transport over a real port (feature `serial`)
#[cfg(feature = "serial")]
#[derive(Debug)]
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialLink {
    /// Open the configured serial port
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;
        info!("Fluid controller connected on {} at {} baud", port_name, baud_rate);
        Ok(Self { port })
    }
}

#[cfg(feature = "serial")]
impl Link for SerialLink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let available = self.port.bytes_to_read()? as usize;
        let Some(stale) = stale_backlog(available) else {
            return Ok(None);
        };

        if stale > 0 {
            let mut discard = vec![0u8; stale];
            self.port.read_exact(&mut discard)?;
            debug!("Discarded {} stale telemetry bytes", stale);
        }

        let mut buf = vec![0u8; MSG_FRAME_LEN];
        self.port.read_exact(&mut buf)?;
        Ok(Some(buf))
    }
}

/// Software MCU for development and tests
///
/// Mirrors the firmware's observable behavior: echoes the last received
/// command uid/id, reports `InProgress` until a configurable completion
/// latency elapses, then `Completed`. Clones share state, so a test can
/// keep a handle for scripting and inspection after the engine takes
/// ownership of the link.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    inner: Arc<Mutex<SimInner>>,
}

#[derive(Debug)]
struct SimInner {
    latency: Duration,
    current_uid: u16,
    current_cmd: u8,
    selector_valve: u8,
    status: ExecutionStatus,
    busy_until: Option<Instant>,
    completion_status: ExecutionStatus,
    fail_next: Option<ExecutionStatus>,
    desync: bool,
    sent: Vec<Vec<u8>>,
}

impl SimulatedLink {
    /// Create a simulated link with the given command completion latency
    pub fn new(latency: Duration) -> Self {
        info!("MCU simulator connected");
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                latency,
                current_uid: 0,
                current_cmd: 0,
                selector_valve: 0,
                status: ExecutionStatus::Completed,
                busy_until: None,
                completion_status: ExecutionStatus::Completed,
                fail_next: None,
                desync: false,
                sent: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimInner>> {
        self.inner
            .lock()
            .map_err(|_| DeviceError::other("Simulated link state poisoned"))
    }

    /// Script the next command to finish with a failure status
    pub fn fail_next_command(&self, status: ExecutionStatus) -> Result<()> {
        self.lock()?.fail_next = Some(status);
        Ok(())
    }

    /// Force the echoed uid to lag behind the host (desync injection)
    pub fn set_desync(&self, desync: bool) -> Result<()> {
        self.lock()?.desync = desync;
        Ok(())
    }

    /// All command frames written to this link, oldest first
    pub fn sent_frames(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.lock()?.sent.clone())
    }

    /// Command ids written to this link, oldest first
    pub fn sent_command_ids(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.sent.iter().map(|f| f[2]).collect())
    }
}

impl Link for SimulatedLink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() != CMD_FRAME_LEN {
            return Err(DeviceError::other(format!(
                "Command frame must be {} bytes, got {}",
                CMD_FRAME_LEN,
                frame.len()
            )));
        }

        let mut inner = self.lock()?;
        inner.current_uid = u16::from_be_bytes([frame[0], frame[1]]);
        inner.current_cmd = frame[2];
        if frame[2] == CMD_ADD_MEDIUM {
            inner.selector_valve = frame[4];
        }
        inner.sent.push(frame.to_vec());

        // The clear sentinel resets the command slot instantly; real
        // commands occupy the pump for the configured latency.
        if inner.current_cmd == 0 || inner.latency.is_zero() {
            inner.status = inner.fail_next.take().unwrap_or(ExecutionStatus::Completed);
            inner.busy_until = None;
        } else {
            inner.status = ExecutionStatus::InProgress;
            inner.completion_status = inner.fail_next.take().unwrap_or(ExecutionStatus::Completed);
            inner.busy_until = Some(Instant::now() + inner.latency);
        }

        debug!(
            uid = inner.current_uid,
            cmd = inner.current_cmd,
            "Simulated MCU accepted command"
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock()?;

        if let Some(deadline) = inner.busy_until {
            if Instant::now() >= deadline {
                inner.status = inner.completion_status;
                inner.busy_until = None;
            }
        }

        let uid = if inner.desync {
            inner.current_uid.wrapping_sub(1)
        } else {
            inner.current_uid
        };

        let frame = TelemetryFrame {
            uid,
            command_id: inner.current_cmd,
            status: inner.status,
            internal_program: 0,
            valves: 0,
            pump_power: if inner.busy_until.is_some() { 180 } else { 0 },
            selector_valve: inner.selector_valve,
            pressure_raw: [8191, 8191],
            flow_raw: [8191, 8191],
        };

        Ok(Some(frame.encode().to_vec()))
    }
}

/// Open the link selected by the configuration
///
/// A configured port name selects the real serial backend; otherwise the
/// simulator is used.
pub fn open_link(config: &LinkConfig) -> Result<Box<dyn Link>> {
    match &config.port_name {
        #[cfg(feature = "serial")]
        Some(name) => Ok(Box::new(SerialLink::open(name, config.baud_rate)?)),
        #[cfg(not(feature = "serial"))]
        Some(_) => Err(DeviceError::other(
            "Serial port configured but the `serial` feature is not enabled",
        )),
        None => Ok(Box::new(SimulatedLink::new(Duration::from_millis(
            config.simulated_latency_ms,
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;

    #[test]
    fn test_stale_backlog() {
        assert_eq!(stale_backlog(0), None);
        assert_eq!(stale_backlog(MSG_FRAME_LEN - 1), None);
        // Mid-frame arrival: wait for the rest
        assert_eq!(stale_backlog(MSG_FRAME_LEN + 3), None);
        assert_eq!(stale_backlog(MSG_FRAME_LEN), Some(0));
        // Three frames queued: discard the two oldest
        assert_eq!(stale_backlog(3 * MSG_FRAME_LEN), Some(2 * MSG_FRAME_LEN));
    }

    #[test]
    fn test_simulator_idle_echo() {
        let mut link = SimulatedLink::new(Duration::from_secs(2));
        let frame = decode(&link.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(frame.uid, 0);
        assert_eq!(frame.command_id, 0);
        assert_eq!(frame.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_simulator_echoes_command_and_completes() {
        let mut link = SimulatedLink::new(Duration::ZERO);
        let mut cmd = [0u8; CMD_FRAME_LEN];
        cmd[0..2].copy_from_slice(&5u16.to_be_bytes());
        cmd[2] = CMD_ADD_MEDIUM;
        cmd[4] = 8;
        link.write_frame(&cmd).unwrap();

        let frame = decode(&link.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(frame.uid, 5);
        assert_eq!(frame.command_id, CMD_ADD_MEDIUM);
        assert_eq!(frame.status, ExecutionStatus::Completed);
        assert_eq!(frame.selector_valve, 8);
    }

    #[test]
    fn test_simulator_in_progress_until_latency() {
        let mut link = SimulatedLink::new(Duration::from_secs(30));
        let mut cmd = [0u8; CMD_FRAME_LEN];
        cmd[0..2].copy_from_slice(&1u16.to_be_bytes());
        cmd[2] = CMD_ADD_MEDIUM;
        link.write_frame(&cmd).unwrap();

        let frame = decode(&link.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(frame.status, ExecutionStatus::InProgress);
    }

    #[test]
    fn test_simulator_scripted_failure() {
        let mut link = SimulatedLink::new(Duration::ZERO);
        link.fail_next_command(ExecutionStatus::ExecutionError).unwrap();

        let mut cmd = [0u8; CMD_FRAME_LEN];
        cmd[0..2].copy_from_slice(&1u16.to_be_bytes());
        cmd[2] = CMD_ADD_MEDIUM;
        link.write_frame(&cmd).unwrap();

        let frame = decode(&link.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(frame.status, ExecutionStatus::ExecutionError);
    }

    #[test]
    fn test_simulator_desync_injection() {
        let mut link = SimulatedLink::new(Duration::ZERO);
        link.set_desync(true).unwrap();

        let mut cmd = [0u8; CMD_FRAME_LEN];
        cmd[0..2].copy_from_slice(&2u16.to_be_bytes());
        cmd[2] = CMD_ADD_MEDIUM;
        link.write_frame(&cmd).unwrap();

        let frame = decode(&link.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(frame.uid, 1);

        link.set_desync(false).unwrap();
        let frame = decode(&link.read_frame().unwrap().unwrap()).unwrap();
        assert_eq!(frame.uid, 2);
    }

    #[test]
    fn test_rejects_malformed_command_frame() {
        let mut link = SimulatedLink::new(Duration::ZERO);
        assert!(link.write_frame(&[0u8; 3]).is_err());
    }
}
