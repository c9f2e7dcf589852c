/*!
 * Subsequence executor.
 *
 * Runs one atomic unit of work: either "send this device command and wait
 * for its completion echo" or "wait a fixed local duration". Local waits
 * are deadlines checked on each engine tick, never sleeping threads, and
 * they abort immediately on request. Device commands cannot be cancelled
 * on the device side, so abort for them only takes effect after the
 * completion echo.
 */
use std::time::{Duration, Instant};

use tracing::debug;

use perfuse_device::sync::ProtocolSynchronizer;

use crate::error::Result;
use crate::sequence::Subsequence;

/// Executor progress reported to the engine each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Still executing
    Running,
    /// Finished normally
    Done,
    /// Cancelled by an abort request before completion
    Aborted,
}

#[derive(Debug)]
enum ExecKind {
    /// Command sent; waiting for the synced completion echo
    Device,
    /// Local wait with its captured start time
    Wait { started: Instant, duration: Duration },
}

/// State machine for one running subsequence
#[derive(Debug)]
pub struct SubsequenceExecutor {
    kind: ExecKind,
    description: String,
}

impl SubsequenceExecutor {
    /// Start executing a subsequence
    ///
    /// Device commands are sent through the synchronizer immediately; a
    /// send failure is this subsequence's failure.
    pub fn start(
        subsequence: Subsequence,
        now: Instant,
        sync: &mut ProtocolSynchronizer,
    ) -> Result<Self> {
        let description = subsequence.describe();
        let kind = match subsequence {
            Subsequence::DeviceCommand(command) => {
                let uid = sync.send(&command)?;
                debug!(uid, "Dispatched {}", description);
                ExecKind::Device
            }
            Subsequence::LocalWait(duration) => {
                debug!("Started {}", description);
                ExecKind::Wait {
                    started: now,
                    duration,
                }
            }
        };

        Ok(Self { kind, description })
    }

    /// Advance the state machine one tick
    ///
    /// `command_completed` is the edge-triggered completion signal latched
    /// by the engine's device poll since the last tick.
    pub fn tick(&mut self, now: Instant, command_completed: bool, abort_requested: bool) -> ExecStatus {
        match self.kind {
            ExecKind::Device => {
                // Abort never preempts a device command; the pump action
                // runs to completion either way.
                if command_completed {
                    ExecStatus::Done
                } else {
                    ExecStatus::Running
                }
            }
            ExecKind::Wait { started, duration } => {
                if abort_requested {
                    debug!("Aborted {}", self.description);
                    return ExecStatus::Aborted;
                }
                if now.duration_since(started) >= duration {
                    ExecStatus::Done
                } else {
                    ExecStatus::Running
                }
            }
        }
    }

    /// Short description for log messages
    pub fn description(&self) -> &str {
        &self.description
    }
}
