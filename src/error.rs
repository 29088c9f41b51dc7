// src/error.rs

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Rejected configuration. A session never starts with one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("clock rate must be a positive number of ticks per second, got {0}")]
    InvalidClockRate(f64),

    #[error("bin size must span at least one clock tick, got {0} s")]
    InvalidBinSize(f64),

    #[error("number of bins must be at least 1")]
    ZeroBins,

    #[error("number of units must be between 1 and {max}, got {got}")]
    InvalidUnitCount { got: usize, max: usize },

    #[error("invalid duration {0} ms: must be a non-negative integer")]
    InvalidDuration(f64),

    #[error("threshold out of range: {0}")]
    ThresholdOutOfRange(String),

    #[error("unit {unit_id} is outside the {num_units} configured units")]
    UnknownUnit { unit_id: u32, num_units: usize },

    #[error("spike identity decoder needs at least one target unit")]
    EmptyTargets,

    #[error("no decoders configured")]
    NoDecoders,

    #[error("invalid spike simulation: {0}")]
    InvalidSimulation(String),
}

/// Failure talking to the actuator. Logged by callers, never fatal to a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("write to actuator failed: {0}")]
    Write(#[source] io::Error),

    #[error("read from actuator failed: {0}")]
    Read(#[source] io::Error),
}

/// Unexpected bytes coming back from the device. Logged only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("acknowledgment is not ASCII: {0:?}")]
    NonAscii(Vec<u8>),

    #[error("acknowledgment exceeded {0} bytes without a newline")]
    Oversized(usize),
}

/// Failure of the event source feeding the loop.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("event source i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("event file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Errors surfaced by a control session.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),
}
