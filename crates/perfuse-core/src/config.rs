/*!
 * Configuration management for Perfuse.
 *
 * This module provides functionality to load, validate, and access
 * configuration for the instrument link, protocol timing, sensor
 * calibration, and the named step preset library.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Instrument configuration for Perfuse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Serial link configuration
    #[serde(default)]
    pub link: LinkConfig,

    /// Protocol and engine timing configuration
    #[serde(default)]
    pub timing: TimingConfig,

    /// Sensor calibration configuration
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Named step presets
    #[serde(default = "default_steps")]
    pub steps: Vec<StepPreset>,
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Serial port name (e.g., "/dev/ttyUSB0"); None selects the simulator
    #[serde(default)]
    pub port_name: Option<String>,

    /// Baud rate for the device link
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Completion latency used by the simulated link
    #[serde(default = "default_simulated_latency_ms")]
    pub simulated_latency_ms: u64,
}

/// Timing configuration for the tick loops and fault detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Device-state poll interval in milliseconds (fast tick)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Sequence progression interval in milliseconds (engine tick)
    #[serde(default = "default_engine_interval_ms")]
    pub engine_interval_ms: u64,

    /// How long a host/MCU command mismatch may persist before it is a fault
    #[serde(default = "default_desync_fault_threshold_ms")]
    pub desync_fault_threshold_ms: u64,
}

impl TimingConfig {
    /// Poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Engine interval as a Duration
    pub fn engine_interval(&self) -> Duration {
        Duration::from_millis(self.engine_interval_ms)
    }

    /// Desync fault threshold as a Duration
    pub fn desync_fault_threshold(&self) -> Duration {
        Duration::from_millis(self.desync_fault_threshold_ms)
    }
}

/// Linear scaling for one sensor channel
///
/// Raw counts in `[output_min, output_max]` map linearly onto
/// `[physical_min, physical_max]`. The sign convention lives entirely in
/// the physical bounds, so a vacuum channel simply scales to negative
/// pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelScale {
    /// Lowest raw count the sensor produces in its transfer window
    pub output_min: u16,
    /// Highest raw count the sensor produces in its transfer window
    pub output_max: u16,
    /// Physical value at `output_min`
    pub physical_min: f64,
    /// Physical value at `output_max`
    pub physical_max: f64,
}

/// Sensor calibration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Positive-pressure channel (psi)
    #[serde(default = "default_pressure_scale")]
    pub pressure: ChannelScale,

    /// Vacuum channel (psi, negative)
    #[serde(default = "default_vacuum_scale")]
    pub vacuum: ChannelScale,

    /// Flow channels (microliters per minute)
    #[serde(default = "default_flow_scale")]
    pub flow: ChannelScale,
}

/// A named step preset: the parameters the operator table feeds into
/// `add_sequence`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPreset {
    /// Step name shown to the operator
    pub name: String,

    /// Selector valve port the reagent is drawn from
    pub port: u8,

    /// Flow duration in seconds; 0 classifies the step as remove-medium
    pub flow_seconds: u64,

    /// Incubation duration in minutes; zero or negative means no
    /// incubation and no removal
    pub incubation_minutes: i64,

    /// Flow setpoint in units of 0.01 microliters per second
    pub setpoint: u16,

    /// How many rounds this step repeats across the protocol
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

impl StepPreset {
    /// Flow duration as a Duration
    pub fn flow(&self) -> Duration {
        Duration::from_secs(self.flow_seconds)
    }

    /// Incubation duration, mapping the non-positive sentinel to None
    pub fn incubation(&self) -> Option<Duration> {
        if self.incubation_minutes > 0 {
            Some(Duration::from_secs(self.incubation_minutes as u64 * 60))
        } else {
            None
        }
    }
}

impl CalibrationConfig {
    /// Check that every channel has a usable output span
    pub fn validate(&self) -> Result<()> {
        for (name, channel) in [
            ("pressure", &self.pressure),
            ("vacuum", &self.vacuum),
            ("flow", &self.flow),
        ] {
            if channel.output_max <= channel.output_min {
                return Err(Error::validation(format!(
                    "Calibration channel '{}': output_max {} must exceed output_min {}",
                    name, channel.output_max, channel.output_min
                )));
            }
        }
        Ok(())
    }
}

impl InstrumentConfig {
    /// Look up a step preset by name
    pub fn step(&self, name: &str) -> Option<&StepPreset> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate cross-field constraints the type system cannot express
    pub fn validate(&self) -> Result<()> {
        self.calibration.validate()
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            timing: TimingConfig::default(),
            calibration: CalibrationConfig::default(),
            steps: default_steps(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: default_baud_rate(),
            simulated_latency_ms: default_simulated_latency_ms(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            engine_interval_ms: default_engine_interval_ms(),
            desync_fault_threshold_ms: default_desync_fault_threshold_ms(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            pressure: default_pressure_scale(),
            vacuum: default_vacuum_scale(),
            flow: default_flow_scale(),
        }
    }
}

fn default_baud_rate() -> u32 {
    2_000_000
}

fn default_simulated_latency_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_engine_interval_ms() -> u64 {
    50
}

fn default_desync_fault_threshold_ms() -> u64 {
    3000
}

// 10%-90% of the 14-bit sensor transfer function.
fn default_pressure_scale() -> ChannelScale {
    ChannelScale {
        output_min: 1638,
        output_max: 14745,
        physical_min: 0.0,
        physical_max: 5.0,
    }
}

fn default_vacuum_scale() -> ChannelScale {
    ChannelScale {
        output_min: 1638,
        output_max: 14745,
        physical_min: 0.0,
        physical_max: -5.0,
    }
}

fn default_flow_scale() -> ChannelScale {
    ChannelScale {
        output_min: 1638,
        output_max: 14745,
        physical_min: 0.0,
        physical_max: 1500.0,
    }
}

fn default_repeat() -> u32 {
    1
}

/// The built-in protocol table for the multi-round processing run.
///
/// Ports and durations follow the reagent manifold the instrument ships
/// with: bleach on 1, counterstains on 2-3, per-round ligation mixes on
/// 5-10, wash buffer on 12, imaging buffer on 13, strip buffer on 14.
/// Setpoints are flow rates in 0.01 ul/s.
fn default_steps() -> Vec<StepPreset> {
    let mut steps = vec![
        StepPreset {
            name: "Bleach".to_string(),
            port: 1,
            flow_seconds: 300,
            incubation_minutes: -1,
            setpoint: 1667,
            repeat: 1,
        },
        StepPreset {
            name: "Stain (Nissl)".to_string(),
            port: 2,
            flow_seconds: 300,
            incubation_minutes: -1,
            setpoint: 167,
            repeat: 1,
        },
        StepPreset {
            name: "Stain (DAPI)".to_string(),
            port: 3,
            flow_seconds: 300,
            incubation_minutes: -1,
            setpoint: 167,
            repeat: 1,
        },
        StepPreset {
            name: "Wash (pre-imaging)".to_string(),
            port: 12,
            flow_seconds: 1200,
            incubation_minutes: -1,
            setpoint: 125,
            repeat: 6,
        },
        StepPreset {
            name: "Add imaging buffer".to_string(),
            port: 13,
            flow_seconds: 1200,
            incubation_minutes: -1,
            setpoint: 33,
            repeat: 6,
        },
        StepPreset {
            name: "Remove imaging buffer".to_string(),
            port: 13,
            flow_seconds: 0,
            incubation_minutes: -1,
            setpoint: 0,
            repeat: 6,
        },
        StepPreset {
            name: "Strip".to_string(),
            port: 14,
            flow_seconds: 600,
            incubation_minutes: -1,
            setpoint: 167,
            repeat: 6,
        },
        StepPreset {
            name: "Wash (post-imaging)".to_string(),
            port: 12,
            flow_seconds: 1800,
            incubation_minutes: -1,
            setpoint: 83,
            repeat: 6,
        },
    ];

    // One ligation mix per round, ports 5 through 10.
    for (round, port) in (5u8..=10).enumerate() {
        steps.push(StepPreset {
            name: format!("Ligate round {}", round + 1),
            port,
            flow_seconds: 300,
            incubation_minutes: 180,
            setpoint: 167,
            repeat: 1,
        });
    }

    steps
}

/// A builder for creating an instrument configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<InstrumentConfig>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: InstrumentConfig) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<InstrumentConfig> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = InstrumentConfig::default();
        config_builder = config_builder
            .add_source(config::Config::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?);

        // Add configuration from file if specified
        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        // Add configuration from environment variables if prefix is specified
        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true)
            );
        }

        // Build the config
        let config_lib = config_builder.build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        // Convert to our config type
        let mut config: InstrumentConfig = config_lib.try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        // Override with provided config if specified
        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        config.validate()?;

        info!("Instrument configuration loaded");
        Ok(config)
    }
}

/// A thread-safe reference to an instrument configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<InstrumentConfig>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: InstrumentConfig) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &InstrumentConfig {
        &self.0
    }
}

impl From<InstrumentConfig> for SharedConfig {
    fn from(config: InstrumentConfig) -> Self {
        Self::new(config)
    }
}

impl AsRef<InstrumentConfig> for SharedConfig {
    fn as_ref(&self) -> &InstrumentConfig {
        self.get()
    }
}
