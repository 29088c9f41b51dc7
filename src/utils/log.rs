use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::output::protocol::ActuatorCommand;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_tracing(level: &str) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

#[derive(Debug, Serialize)]
struct CommandRow<'a> {
    wall_time: String,
    tick: u64,
    command: &'a str,
    bytes: String,
    delivered: bool,
}

/// Audit trail of every command sent to the actuator, one CSV row each.
pub struct CommandLog {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl CommandLog {
    /// Creates `commands_<timestamp>.csv` inside `dir`, creating `dir` if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let filename = format!("commands_{}.csv", Local::now().format("%Y%m%d_%H%M%S%.3f"));
        let path = dir.join(filename);
        let writer = csv::Writer::from_path(&path).map_err(io::Error::from)?;
        Ok(Self { writer, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &mut self,
        tick: u64,
        command: &ActuatorCommand,
        delivered: bool,
    ) -> Result<(), csv::Error> {
        let bytes = command
            .encode()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        self.writer.serialize(CommandRow {
            wall_time: Local::now().to_rfc3339(),
            tick,
            command: command.name(),
            bytes,
            delivered,
        })?;
        // rows must survive a crash mid-session
        self.writer.flush()?;
        Ok(())
    }
}
