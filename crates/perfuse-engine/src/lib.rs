/*!
 * Perfuse Engine
 *
 * This crate provides the sequence-execution engine for the Perfuse
 * instrument: the step-to-subsequence expansion model, the subsequence
 * executor, the tick-driven engine with its FIFO and fault policy, and
 * the async runner that drives the ticks on the tokio runtime.
 */

#![warn(missing_docs)]

// Re-export core types
pub use perfuse_core::prelude;

pub mod engine;
pub mod error;
pub mod executor;
pub mod runner;
pub mod sequence;

// Re-export the main types for convenience
pub use engine::{Engine, EngineEvent, EngineState};
pub use error::{Error, Result};
pub use executor::{ExecStatus, SubsequenceExecutor};
pub use runner::{EngineRunner, SharedEngine};
pub use sequence::{Sequence, StepParams, Subsequence};

/// Perfuse engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("Perfuse Engine {} initialized", VERSION);
    Ok(())
}
