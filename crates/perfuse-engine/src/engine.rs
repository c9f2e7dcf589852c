/*!
 * Execution engine.
 *
 * A FIFO of sequences drained one subsequence at a time, driven by two
 * explicit tick methods: [`Engine::poll_device`] (fast tick, reads at most
 * one telemetry frame) and [`Engine::tick`] (progression tick). Any
 * scheduler may invoke the ticks; the engine itself never blocks and
 * never sleeps.
 *
 * Fault policy: anything the synchronizer reports as a protocol fault
 * (persistent desync, device-reported execution error) halts the engine
 * outright with the FIFO left undrained for operator inspection. The
 * engine never guesses and continues once host and device state may have
 * diverged.
 */
use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use perfuse_core::config::InstrumentConfig;
use perfuse_core::types::Id;
use perfuse_device::error::DeviceError;
use perfuse_device::link::Link;
use perfuse_device::sync::{LinkStatus, ProtocolSynchronizer};
use perfuse_device::telemetry::{TelemetryDecoder, TelemetrySnapshot};

use crate::error::Result;
use crate::executor::{ExecStatus, SubsequenceExecutor};
use crate::sequence::{Sequence, StepParams};

/// Capacity of the engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not executing; the FIFO may hold queued sequences
    Idle,
    /// Draining the FIFO
    Running,
    /// Halted on a protocol fault; requires operator intervention
    Faulted,
}

/// Events emitted to subscribers (the control panel and log collaborators)
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Execution started
    Started {
        /// Event time
        timestamp: DateTime<Utc>,
    },
    /// Execution stopped (FIFO drained or abort completed)
    Stopped {
        /// Event time
        timestamp: DateTime<Utc>,
    },
    /// A sequence was popped from the FIFO and began executing
    SequenceStarted {
        /// Sequence instance id
        id: Id,
        /// Step name
        name: String,
        /// Protocol round index
        repeat_index: u32,
        /// Event time
        timestamp: DateTime<Utc>,
    },
    /// A sequence finished all of its subsequences
    SequenceCompleted {
        /// Sequence instance id
        id: Id,
        /// Step name
        name: String,
        /// Event time
        timestamp: DateTime<Utc>,
    },
    /// A sequence was discarded by an abort request
    SequenceAborted {
        /// Sequence instance id
        id: Id,
        /// Step name
        name: String,
        /// Event time
        timestamp: DateTime<Utc>,
    },
    /// A new calibrated telemetry snapshot was decoded
    Telemetry(TelemetrySnapshot),
    /// The engine halted on a fault
    Fault {
        /// Fault description
        message: String,
        /// Event time
        timestamp: DateTime<Utc>,
    },
    /// Operator-visible log line
    Log {
        /// Message text
        message: String,
        /// Event time
        timestamp: DateTime<Utc>,
    },
}

/// The sequence-execution engine
#[derive(Debug)]
pub struct Engine {
    state: EngineState,
    queue: VecDeque<Sequence>,
    current: Option<Sequence>,
    executor: Option<SubsequenceExecutor>,
    abort_requested: bool,
    completion_pending: bool,
    sync: ProtocolSynchronizer,
    decoder: TelemetryDecoder,
    telemetry: Option<TelemetrySnapshot>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl Engine {
    /// Create an engine owning the given link
    ///
    /// Sends the clear sentinel so host and MCU start from an agreed
    /// command slot.
    pub fn new(link: Box<dyn Link>, config: &InstrumentConfig) -> Result<Self> {
        let mut sync =
            ProtocolSynchronizer::new(link, config.timing.desync_fault_threshold());
        sync.reset()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            state: EngineState::Idle,
            queue: VecDeque::new(),
            current: None,
            executor: None,
            abort_requested: false,
            completion_pending: false,
            sync,
            decoder: TelemetryDecoder::new(&config.calibration),
            telemetry: None,
            event_tx,
        })
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Number of sequences waiting in the FIFO
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The most recent calibrated telemetry snapshot
    pub fn telemetry(&self) -> Option<&TelemetrySnapshot> {
        self.telemetry.as_ref()
    }

    /// Append a sequence to the FIFO
    ///
    /// Never starts execution implicitly; call [`Engine::start`].
    pub fn enqueue(&mut self, params: StepParams) -> Id {
        let sequence = Sequence::new(params);
        let id = sequence.id().clone();
        self.log(format!(
            "Queued sequence '{}' (round {}, {} subsequences)",
            sequence.name(),
            sequence.repeat_index(),
            sequence.remaining()
        ));
        self.queue.push_back(sequence);
        id
    }

    /// Begin draining the FIFO
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            EngineState::Faulted => Err(crate::error::Error::engine(
                "Engine is faulted; resynchronize before starting",
            )),
            EngineState::Running => Ok(()),
            EngineState::Idle => {
                self.abort_requested = false;
                self.state = EngineState::Running;
                info!("Sequence execution started");
                self.emit(EngineEvent::Started { timestamp: Utc::now() });
                self.log("Sequence execution started".to_string());
                Ok(())
            }
        }
    }

    /// Request a cooperative abort
    ///
    /// Consulted at every decision point of the progression tick. An
    /// in-flight device command still runs to completion, but no new
    /// command is issued afterward.
    pub fn request_abort(&mut self) {
        self.abort_requested = true;
        self.log("Abort requested".to_string());
    }

    /// Recover from a fault by re-issuing the clear sentinel
    ///
    /// The sequence that was executing when the fault hit is discarded;
    /// queued sequences stay in the FIFO for the operator to rerun or
    /// abort. Errors while execution is running.
    pub fn resynchronize(&mut self) -> Result<()> {
        if self.state == EngineState::Running {
            return Err(crate::error::Error::engine(
                "Abort sequence execution before resynchronizing",
            ));
        }

        self.executor = None;
        self.completion_pending = false;
        self.abort_requested = false;
        if let Some(sequence) = self.current.take() {
            self.discard_sequence(sequence);
        }
        self.sync.reset()?;
        self.state = EngineState::Idle;

        info!("Resynchronized with the device");
        self.log("Resynchronized with the device".to_string());
        Ok(())
    }

    /// Fast tick: poll the device link for one telemetry frame
    ///
    /// Runs regardless of engine state so displays stay live and a desync
    /// is detected even between runs.
    pub fn poll_device(&mut self, now: Instant) {
        match self.sync.poll(now) {
            Ok(Some((frame, status))) => {
                let snapshot = self.decoder.decode(&frame);
                self.telemetry = Some(snapshot.clone());
                self.emit(EngineEvent::Telemetry(snapshot));
                if status == LinkStatus::CommandComplete {
                    self.completion_pending = true;
                }
            }
            Ok(None) => {}
            Err(err) => self.raise_fault(err),
        }
    }

    /// Progression tick: advance at most one decision point
    pub fn tick(&mut self, now: Instant) {
        if self.state != EngineState::Running {
            return;
        }

        // A subsequence is running: poll it.
        if let Some(mut executor) = self.executor.take() {
            let completed = std::mem::take(&mut self.completion_pending);
            match executor.tick(now, completed, self.abort_requested) {
                ExecStatus::Running => self.executor = Some(executor),
                ExecStatus::Done => {
                    self.log(format!("Finished {}", executor.description()));
                }
                ExecStatus::Aborted => {
                    self.log(format!("Aborted {}", executor.description()));
                }
            }
            return;
        }

        // A sequence is current: pick its next subsequence.
        if let Some(mut sequence) = self.current.take() {
            if self.abort_requested {
                self.discard_sequence(sequence);
                return;
            }
            match sequence.next_subsequence() {
                Some(subsequence) => {
                    self.current = Some(sequence);
                    self.log(format!("Starting {}", subsequence.describe()));
                    match SubsequenceExecutor::start(subsequence, now, &mut self.sync) {
                        Ok(executor) => self.executor = Some(executor),
                        Err(e) => self.raise_run_fault(e.to_string()),
                    }
                }
                None => {
                    info!(sequence = sequence.name(), "Sequence completed");
                    self.emit(EngineEvent::SequenceCompleted {
                        id: sequence.id().clone(),
                        name: sequence.name().to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
            return;
        }

        // No current sequence: select the next one or wind down.
        if self.abort_requested {
            while let Some(sequence) = self.queue.pop_front() {
                self.discard_sequence(sequence);
            }
            self.abort_requested = false;
            self.stop();
            return;
        }

        match self.queue.pop_front() {
            Some(sequence) => {
                info!(
                    sequence = sequence.name(),
                    round = sequence.repeat_index(),
                    "Sequence started"
                );
                self.emit(EngineEvent::SequenceStarted {
                    id: sequence.id().clone(),
                    name: sequence.name().to_string(),
                    repeat_index: sequence.repeat_index(),
                    timestamp: Utc::now(),
                });
                self.current = Some(sequence);
            }
            None => self.stop(),
        }
    }

    fn stop(&mut self) {
        self.state = EngineState::Idle;
        info!("Sequence execution stopped");
        self.emit(EngineEvent::Stopped { timestamp: Utc::now() });
        self.log("Sequence execution stopped".to_string());
    }

    fn discard_sequence(&mut self, sequence: Sequence) {
        warn!(sequence = sequence.name(), "Sequence discarded by abort");
        self.log(format!("Discarding sequence '{}' (abort)", sequence.name()));
        self.emit(EngineEvent::SequenceAborted {
            id: sequence.id().clone(),
            name: sequence.name().to_string(),
            timestamp: Utc::now(),
        });
    }

    fn raise_fault(&mut self, err: DeviceError) {
        if err.is_protocol_fault() || self.state == EngineState::Running {
            self.raise_run_fault(err.to_string());
        } else {
            warn!("Device link error while idle: {}", err);
        }
    }

    /// Halt the engine on a fatal fault. The FIFO is deliberately left
    /// undrained so the operator can inspect what had been queued.
    ///
    /// A persistent fault keeps erroring on every poll until the operator
    /// resynchronizes; only the first occurrence is surfaced.
    fn raise_run_fault(&mut self, message: String) {
        if self.state == EngineState::Faulted {
            return;
        }
        error!("Engine fault: {}", message);
        self.state = EngineState::Faulted;
        self.executor = None;
        self.emit(EngineEvent::Fault {
            message: message.clone(),
            timestamp: Utc::now(),
        });
        self.log(format!("FAULT: {}", message));
    }

    fn log(&self, message: String) {
        self.emit(EngineEvent::Log {
            message,
            timestamp: Utc::now(),
        });
    }

    fn emit(&self, event: EngineEvent) {
        // Nothing subscribed is fine; events are best-effort.
        let _ = self.event_tx.send(event);
    }
}
