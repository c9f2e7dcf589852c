/*!
 * Sequence model.
 *
 * Expands one named processing step plus parameters into the ordered queue
 * of atomic subsequences the engine executes. Classification is by the
 * declared durations, never by the step name: the name only selects the
 * fluidic port and default durations at the preset layer.
 */
use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use perfuse_core::config::StepPreset;
use perfuse_core::types::{FluidicPort, Id};
use perfuse_device::command::{Command, ControlMode};

use crate::error::Result;

/// Parameters for one processing step instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParams {
    /// Step name shown in logs and events
    pub name: String,
    /// Selector valve port the reagent is drawn from
    pub port: FluidicPort,
    /// Flow duration; zero classifies the step as remove-medium
    pub flow: Duration,
    /// Incubation duration; `None` means no incubation and no removal
    pub incubation: Option<Duration>,
    /// Flow setpoint (0.01 ul/s units)
    pub setpoint: u16,
    /// Pump control mode
    #[serde(default)]
    pub mode: ControlMode,
    /// Which protocol round this instance belongs to (1-based)
    pub repeat_index: u32,
}

impl StepParams {
    /// Build step parameters from a configured preset
    pub fn from_preset(preset: &StepPreset, repeat_index: u32) -> Result<Self> {
        Ok(Self {
            name: preset.name.clone(),
            port: FluidicPort::new(preset.port)?,
            flow: preset.flow(),
            incubation: preset.incubation(),
            setpoint: preset.setpoint,
            mode: ControlMode::default(),
            repeat_index,
        })
    }
}

/// One atomic unit of execution
#[derive(Debug, Clone, PartialEq)]
pub enum Subsequence {
    /// Send a device command and wait for its completion echo
    DeviceCommand(Command),
    /// Wait a fixed duration on the host, without touching the device
    LocalWait(Duration),
}

impl Subsequence {
    /// Short description for log messages
    pub fn describe(&self) -> String {
        match self {
            Subsequence::DeviceCommand(cmd) => format!("device command '{}'", cmd.name()),
            Subsequence::LocalWait(d) => format!("local wait of {:?}", d),
        }
    }
}

/// One named processing step instance with its expanded subsequence queue
///
/// Created when the operator enqueues a step; consumed and discarded once
/// all subsequences complete or it is aborted.
#[derive(Debug, Clone)]
pub struct Sequence {
    id: Id,
    name: String,
    repeat_index: u32,
    subsequences: VecDeque<Subsequence>,
}

impl Sequence {
    /// Create a sequence, expanding the step into its subsequence queue
    pub fn new(params: StepParams) -> Self {
        let subsequences = expand(&params);
        Self {
            id: Id::new(),
            name: params.name,
            repeat_index: params.repeat_index,
            subsequences,
        }
    }

    /// Sequence instance id
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Step name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol round index
    pub fn repeat_index(&self) -> u32 {
        self.repeat_index
    }

    /// Dequeue the next subsequence
    pub fn next_subsequence(&mut self) -> Option<Subsequence> {
        self.subsequences.pop_front()
    }

    /// Remaining subsequence count
    pub fn remaining(&self) -> usize {
        self.subsequences.len()
    }
}

/// Expansion rules for a step
///
/// Three cases, chosen by the durations alone:
/// - zero flow: the step only removes whatever is in the flow cell
/// - positive incubation: add, incubate, then remove
/// - no incubation: add and leave in place (imaging buffer, stains)
fn expand(params: &StepParams) -> VecDeque<Subsequence> {
    let mut queue = VecDeque::new();

    if params.flow.is_zero() {
        queue.push_back(Subsequence::DeviceCommand(Command::RemoveMedium));
        return queue;
    }

    queue.push_back(Subsequence::DeviceCommand(Command::AddMedium {
        port: params.port,
        mode: params.mode,
        setpoint: params.setpoint,
        duration: params.flow,
    }));

    if let Some(incubation) = params.incubation.filter(|d| !d.is_zero()) {
        queue.push_back(Subsequence::LocalWait(incubation));
        queue.push_back(Subsequence::DeviceCommand(Command::RemoveMedium));
    }

    queue
}
