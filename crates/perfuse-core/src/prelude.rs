/*!
 * Prelude module for Perfuse Core.
 *
 * This module re-exports commonly used types and functions from the Perfuse
 * Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{FluidicPort, Id};

// Re-export config types
pub use crate::config::{
    ChannelScale, ConfigBuilder, InstrumentConfig, SharedConfig, StepPreset, TimingConfig,
};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
