// src/config/mod.rs
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::output::protocol::DeactivateCode;

/// Upper bound on addressable units per session.
pub const MAX_UNITS: usize = 4096;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub binner: BinnerConfig,
    pub decoders: Vec<DecoderConfig>,
    #[serde(default)]
    pub actuator: ActuatorConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Acquisition clock ticks per second.
    pub clock_rate_hz: f64,
    pub poll_timeout_ms: u64,
    pub rate_evaluation: RateEvaluation,
    pub monitor_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clock_rate_hz: 25_000.0,
            poll_timeout_ms: 10,
            rate_evaluation: RateEvaluation::EveryIteration,
            monitor_interval_ms: 50,
        }
    }
}

/// When firing-rate decoders are re-evaluated.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateEvaluation {
    EveryIteration,
    BinReady,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BinnerConfig {
    pub bin_size_s: f64,
    pub num_bins: usize,
    pub num_units: usize,
}

impl Default for BinnerConfig {
    fn default() -> Self {
        Self {
            bin_size_s: 0.1,
            num_bins: 20,
            num_units: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecoderConfig {
    FrThreshold {
        unit_id: u32,
        threshold: Threshold,
        #[serde(default)]
        hysteresis: bool,
        #[serde(default)]
        release_below: Option<u32>,
    },
    SpikeIdentity {
        target_unit_ids: Vec<u32>,
        #[serde(default)]
        pattern_output: bool,
    },
}

/// Spike-count threshold over the whole window, given either directly or as a rate.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum Threshold {
    Count { value: u32 },
    RateHz { value: f64 },
}

impl Threshold {
    /// Spike count across `num_bins` bins equivalent to this threshold.
    pub fn resolve(&self, bin_size_s: f64, num_bins: usize) -> Result<u32, ConfigError> {
        match *self {
            Threshold::Count { value } if value >= 1 => Ok(value),
            Threshold::Count { value } => Err(ConfigError::ThresholdOutOfRange(format!(
                "spike count must be at least 1, got {}",
                value
            ))),
            Threshold::RateHz { value } if value.is_finite() && value > 0.0 => {
                // tolerate float noise so 2.5 Hz x 2 s stays 5 spikes
                let count = (value * bin_size_s * num_bins as f64 - 1e-9).ceil();
                if count > u32::MAX as f64 {
                    return Err(ConfigError::ThresholdOutOfRange(format!(
                        "{} Hz exceeds the countable range",
                        value
                    )));
                }
                Ok((count as u32).max(1))
            }
            Threshold::RateHz { value } => Err(ConfigError::ThresholdOutOfRange(format!(
                "rate must be a positive number of Hz, got {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Serial device path. Without one the actuator runs dry.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub pulse_duration_ms: f64,
    /// Minimum hold after a trigger. Falls back to `pulse_duration_ms`.
    pub hold_ms: Option<f64>,
    pub deactivate_code: DeactivateCode,
    pub arm_on_start: bool,
    /// Bound on each serial write and read.
    pub io_timeout_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            pulse_duration_ms: 500.0,
            hold_ms: None,
            deactivate_code: DeactivateCode::UpperA,
            arm_on_start: true,
            io_timeout_ms: 10,
        }
    }
}

impl ActuatorConfig {
    pub fn hold_ms(&self) -> Result<u32, ConfigError> {
        validate_duration_ms(self.hold_ms.unwrap_or(self.pulse_duration_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Tcp {
        address: String,
    },
    Csv {
        path: PathBuf,
        #[serde(default)]
        realtime: bool,
    },
    Simulated {
        rate_hz: f64,
        #[serde(default)]
        burst_unit: Option<u32>,
        #[serde(default)]
        burst_probability: f64,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default = "default_true")]
        realtime: bool,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Simulated {
            rate_hz: 200.0,
            burst_unit: None,
            burst_probability: 0.0,
            seed: None,
            realtime: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub command_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            command_log_dir: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.session.clock_rate_hz;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidClockRate(rate));
        }
        self.bin_ticks()?;
        if self.binner.num_bins == 0 {
            return Err(ConfigError::ZeroBins);
        }
        let num_units = self.binner.num_units;
        if num_units == 0 || num_units > MAX_UNITS {
            return Err(ConfigError::InvalidUnitCount {
                got: num_units,
                max: MAX_UNITS,
            });
        }

        validate_duration_ms(self.actuator.pulse_duration_ms)?;
        self.actuator.hold_ms()?;

        if self.decoders.is_empty() {
            return Err(ConfigError::NoDecoders);
        }
        for decoder in &self.decoders {
            match decoder {
                DecoderConfig::FrThreshold {
                    unit_id,
                    threshold,
                    release_below,
                    ..
                } => {
                    if *unit_id as usize >= num_units {
                        return Err(ConfigError::UnknownUnit {
                            unit_id: *unit_id,
                            num_units,
                        });
                    }
                    let count = threshold.resolve(self.binner.bin_size_s, self.binner.num_bins)?;
                    if let Some(release) = release_below {
                        if *release == 0 || *release > count {
                            return Err(ConfigError::ThresholdOutOfRange(format!(
                                "release_below must be within 1..={}, got {}",
                                count, release
                            )));
                        }
                    }
                }
                DecoderConfig::SpikeIdentity {
                    target_unit_ids, ..
                } => {
                    if target_unit_ids.is_empty() {
                        return Err(ConfigError::EmptyTargets);
                    }
                }
            }
        }
        Ok(())
    }

    /// Bin width in acquisition clock ticks.
    pub fn bin_ticks(&self) -> Result<u64, ConfigError> {
        let bin_size = self.binner.bin_size_s;
        if !bin_size.is_finite() || bin_size <= 0.0 {
            return Err(ConfigError::InvalidBinSize(bin_size));
        }
        let ticks = (bin_size * self.session.clock_rate_hz).round();
        if ticks < 1.0 || ticks > u64::MAX as f64 {
            return Err(ConfigError::InvalidBinSize(bin_size));
        }
        Ok(ticks as u64)
    }

    /// Converts milliseconds to acquisition ticks, rounding up.
    pub fn ms_to_ticks(&self, ms: u64) -> u64 {
        (ms as f64 * self.session.clock_rate_hz / 1000.0).ceil() as u64
    }
}

/// Accepts durations that are non-negative whole milliseconds within `u32`.
pub fn validate_duration_ms(ms: f64) -> Result<u32, ConfigError> {
    if !ms.is_finite() || ms < 0.0 || ms.fract() != 0.0 || ms > u32::MAX as f64 {
        return Err(ConfigError::InvalidDuration(ms));
    }
    Ok(ms as u32)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: Config = serde_yaml::from_str(&config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(config)?;

    fs::write(path, yaml).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
