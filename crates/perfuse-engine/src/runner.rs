/*!
 * Async engine runner.
 *
 * The engine itself is synchronous and tick-driven; this module supplies
 * the ticks. [`EngineRunner`] spawns two interval tasks on the tokio
 * runtime: a fast device poll and a sequence progression tick, at the
 * intervals from [`TimingConfig`]. All operator-facing entry points go
 * through [`SharedEngine`], which serializes access behind an async
 * mutex so a tick never observes a half-applied operator action.
 */
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::info;

use perfuse_core::config::TimingConfig;
use perfuse_core::types::Id;
use perfuse_device::telemetry::TelemetrySnapshot;

use crate::engine::{Engine, EngineEvent, EngineState};
use crate::error::Result;
use crate::sequence::StepParams;

/// A thread-safe handle to the engine
#[derive(Debug, Clone)]
pub struct SharedEngine(Arc<Mutex<Engine>>);

impl SharedEngine {
    /// Wrap an engine for shared async access
    pub fn new(engine: Engine) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }

    /// Append a sequence to the execution FIFO
    pub async fn add_sequence(&self, params: StepParams) -> Id {
        self.0.lock().await.enqueue(params)
    }

    /// Begin draining the FIFO
    pub async fn start_sequence_execution(&self) -> Result<()> {
        self.0.lock().await.start()
    }

    /// Request a cooperative abort of the current and queued sequences
    pub async fn request_abort_sequences(&self) {
        self.0.lock().await.request_abort();
    }

    /// Re-issue the clear sentinel and return a faulted engine to idle
    pub async fn resynchronize(&self) -> Result<()> {
        self.0.lock().await.resynchronize()
    }

    /// Subscribe to engine events
    pub async fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.0.lock().await.subscribe()
    }

    /// Current engine lifecycle state
    pub async fn state(&self) -> EngineState {
        self.0.lock().await.state()
    }

    /// Number of sequences waiting in the FIFO
    pub async fn queued(&self) -> usize {
        self.0.lock().await.queued()
    }

    /// The most recent calibrated telemetry snapshot
    pub async fn telemetry(&self) -> Option<TelemetrySnapshot> {
        self.0.lock().await.telemetry().cloned()
    }
}

/// Drives the engine's tick methods on the tokio runtime
#[derive(Debug)]
pub struct EngineRunner {
    engine: SharedEngine,
    timing: TimingConfig,
    /// Background task handles
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Running flag
    running: RwLock<bool>,
}

impl EngineRunner {
    /// Create a runner for the given engine
    pub fn new(engine: SharedEngine, timing: TimingConfig) -> Self {
        Self {
            engine,
            timing,
            tasks: Mutex::new(Vec::new()),
            running: RwLock::new(false),
        }
    }

    /// The shared engine handle
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// Start the tick tasks
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Ok(());
        }
        *running = true;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_poll_task());
        tasks.push(self.spawn_tick_task());

        info!(
            poll_ms = self.timing.poll_interval_ms,
            tick_ms = self.timing.engine_interval_ms,
            "Engine runner started"
        );
        Ok(())
    }

    /// Stop the tick tasks
    ///
    /// Stops driving the engine; it does not abort queued sequences. The
    /// device keeps executing whatever command is already in flight.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        info!("Engine runner stopped");
        Ok(())
    }

    fn spawn_poll_task(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let interval = self.timing.poll_interval();

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.0.lock().await.poll_device(Instant::now());
            }
        })
    }

    fn spawn_tick_task(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let interval = self.timing.engine_interval();

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.0.lock().await.tick(Instant::now());
            }
        })
    }
}
