//! nctrl command line
//!
//! ```bash
//! # closed-loop session from a config file
//! nctrl run --config nctrl.yaml
//!
//! # replay recorded spikes without hardware
//! nctrl replay --config nctrl.yaml --events spikes.csv --dry
//!
//! # fake acquisition bridge for bench tests
//! nctrl serve-sim --address 127.0.0.1:7878 --burst-unit 2
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{info, warn};

use nctrl::config::{load_config, Config, DecoderConfig, SourceConfig};
use nctrl::local::client::TcpEventSource;
use nctrl::local::process_file::{load_events, sweep_thresholds, write_sweep, CsvEventSource};
use nctrl::local::server::{self, SimulatedSource, SpikeGeneratorConfig};
use nctrl::local::EventSource;
use nctrl::monitor::SessionMonitor;
use nctrl::output::transport::{open_configured, SerialTransport};
use nctrl::processing::clock::{Clock, StreamClock, SystemClock};
use nctrl::processing::control_loop::{Session, StopHandle, StopReason};
use nctrl::utils::log::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "nctrl")]
#[command(author, version, about = "Closed-loop spike-triggered stimulation controller", long_about = None)]
struct Cli {
    /// Logging verbosity; overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a closed-loop session
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Serial port of the actuator; overrides the config file
        #[arg(long)]
        port: Option<String>,

        /// Never open the serial port
        #[arg(long)]
        dry: bool,
    },

    /// Feed recorded spikes through the controller
    Replay {
        #[arg(short, long)]
        config: PathBuf,

        /// CSV file with `timestamp,unit_id` rows
        #[arg(short, long)]
        events: PathBuf,

        #[arg(long)]
        port: Option<String>,

        #[arg(long)]
        dry: bool,

        /// Pace events at the recording's clock rate
        #[arg(long)]
        realtime: bool,
    },

    /// Serve simulated spikes over TCP
    ServeSim {
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        address: String,

        #[arg(long, default_value = "100")]
        units: u32,

        /// Summed background rate in Hz
        #[arg(long, default_value = "200")]
        rate: f64,

        #[arg(long, default_value = "25000")]
        clock_rate: f64,

        #[arg(long)]
        burst_unit: Option<u32>,

        #[arg(long, default_value = "0.01")]
        burst_probability: f64,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Count activations a recording would cause for each threshold
    Sweep {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(short, long)]
        events: PathBuf,

        /// Spike counts to try, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        thresholds: Vec<u32>,

        /// Write results as CSV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List serial ports
    Ports,

    /// Validate a config file
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, port, dry } => {
            let config = load(&config, cli.log_level.as_deref())?;
            run_session(config, port, dry)
        }
        Commands::Replay {
            config,
            events,
            port,
            dry,
            realtime,
        } => {
            let mut config = load(&config, cli.log_level.as_deref())?;
            config.source = SourceConfig::Csv {
                path: events,
                realtime,
            };
            run_session(config, port, dry)
        }
        Commands::ServeSim {
            address,
            units,
            rate,
            clock_rate,
            burst_unit,
            burst_probability,
            seed,
        } => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
            let generator = SpikeGeneratorConfig {
                num_units: units,
                rate_hz: rate,
                clock_rate_hz: clock_rate,
                burst_unit,
                burst_probability,
                seed,
            };
            generator.validate()?;
            server::run(&address, generator).context("simulated bridge failed")
        }
        Commands::Sweep {
            config,
            events,
            thresholds,
            output,
        } => {
            let config = load(&config, cli.log_level.as_deref())?;
            sweep(&config, &events, &thresholds, output.as_deref())
        }
        Commands::Ports => {
            let ports = SerialTransport::list_ports();
            if ports.is_empty() {
                println!("{}", "no serial ports found".yellow());
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Commands::CheckConfig { config } => match load_config(&config) {
            Ok(config) => {
                println!("{}", "config ok".green().bold());
                print_config(&config);
                Ok(())
            }
            Err(e) => {
                println!("{} {}", "invalid config:".red().bold(), e);
                Err(e.into())
            }
        },
    }
}

fn load(path: &Path, log_level: Option<&str>) -> anyhow::Result<Config> {
    let config = load_config(path)?;
    init_tracing(log_level.unwrap_or(config.logging.level.as_str()))?;
    info!("nctrl v{} using {}", env!("CARGO_PKG_VERSION"), path.display());
    Ok(config)
}

fn print_config(config: &Config) {
    println!(
        "  bins: {} x {} s, {} units at {} Hz",
        config.binner.num_bins,
        config.binner.bin_size_s,
        config.binner.num_units,
        config.session.clock_rate_hz
    );
    for decoder in &config.decoders {
        match decoder {
            DecoderConfig::FrThreshold {
                unit_id,
                threshold,
                hysteresis,
                ..
            } => println!(
                "  fr_threshold: unit {} {:?} (hysteresis {})",
                unit_id, threshold, hysteresis
            ),
            DecoderConfig::SpikeIdentity {
                target_unit_ids,
                pattern_output,
            } => println!(
                "  spike_identity: {:?} (pattern {})",
                target_unit_ids, pattern_output
            ),
        }
    }
    println!(
        "  actuator: {} at {} baud, pulse {} ms",
        config.actuator.port.as_deref().unwrap_or("dry"),
        config.actuator.baud_rate,
        config.actuator.pulse_duration_ms
    );
}

fn open_source(config: &Config) -> anyhow::Result<(Box<dyn EventSource>, Box<dyn Clock>)> {
    let rate = config.session.clock_rate_hz;
    let wall_clock: Box<dyn Clock> =
        Box::new(SystemClock::new(rate).with_max_lag(config.bin_ticks()?));
    let source: (Box<dyn EventSource>, Box<dyn Clock>) = match &config.source {
        SourceConfig::Tcp { address } => {
            let source = TcpEventSource::connect(address.as_str())
                .with_context(|| format!("cannot reach acquisition bridge at {}", address))?;
            (Box::new(source), wall_clock)
        }
        SourceConfig::Csv { path, realtime } => {
            let source = CsvEventSource::open(path)?;
            if *realtime {
                (Box::new(source.paced(rate)), wall_clock)
            } else {
                (Box::new(source), Box::new(StreamClock::new()))
            }
        }
        SourceConfig::Simulated {
            rate_hz,
            burst_unit,
            burst_probability,
            seed,
            realtime,
        } => {
            let generator = SpikeGeneratorConfig {
                num_units: config.binner.num_units as u32,
                rate_hz: *rate_hz,
                clock_rate_hz: rate,
                burst_unit: *burst_unit,
                burst_probability: *burst_probability,
                seed: *seed,
            };
            generator.validate()?;
            let source = SimulatedSource::new(generator, *realtime);
            if *realtime {
                (Box::new(source), wall_clock)
            } else {
                (Box::new(source), Box::new(StreamClock::new()))
            }
        }
    };
    Ok(source)
}

fn run_session(mut config: Config, port: Option<String>, dry: bool) -> anyhow::Result<()> {
    if port.is_some() {
        config.actuator.port = port;
    }
    if dry {
        config.actuator.port = None;
    }

    let (source, clock) = open_source(&config)?;
    let transport = open_configured(&config.actuator);
    let stop = StopHandle::new();
    let monitor = SessionMonitor::new();

    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, stopping");
        handler_stop.stop();
    })?;

    let session = Session::new(&config, source, clock, transport)?
        .with_stop_handle(stop)
        .with_monitor(monitor.clone());

    let running = Arc::new(AtomicBool::new(true));
    let status = {
        let running = running.clone();
        let units: Vec<u32> = config
            .decoders
            .iter()
            .filter_map(|d| match d {
                DecoderConfig::FrThreshold { unit_id, .. } => Some(*unit_id),
                _ => None,
            })
            .collect();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_secs(1));
                if let Some(snapshot) = monitor.latest() {
                    let state = if snapshot.actuator.active {
                        "ON ".green().bold()
                    } else {
                        "off".dimmed()
                    };
                    let sums: Vec<String> = units
                        .iter()
                        .map(|u| format!("u{}={}", u, snapshot.bins.column_sum(*u)))
                        .collect();
                    println!(
                        "[{}] tick {} | events {} | triggers {} | {}",
                        state,
                        snapshot.tick,
                        snapshot.stats.events,
                        snapshot.stats.activations,
                        sums.join(" ")
                    );
                }
            }
        })
    };

    let result = session.run();
    running.store(false, Ordering::SeqCst);
    if status.join().is_err() {
        warn!("status thread panicked");
    }

    let summary = result?;
    let reason = match summary.reason {
        StopReason::Stopped => "stopped".yellow(),
        StopReason::StreamEnded => "stream ended".cyan(),
    };
    println!(
        "{} {}: {} events, {} activations, {} stale, {} unknown unit",
        "session".bold(),
        reason,
        summary.stats.events,
        summary.stats.activations,
        summary.diagnostics.stale,
        summary.diagnostics.unknown_unit
    );
    if summary.stats.failed_writes > 0 {
        println!(
            "{} {} actuator writes failed",
            "warning:".red().bold(),
            summary.stats.failed_writes
        );
    }
    Ok(())
}

fn sweep(
    config: &Config,
    events: &Path,
    thresholds: &[u32],
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let events = load_events(events)?;
    info!("loaded {} events", events.len());
    let results = sweep_thresholds(config, &events, thresholds)?;

    println!("{}", "threshold  activations  rate (Hz)".bold());
    for result in &results {
        println!(
            "{:>9}  {:>11}  {:>9.3}",
            result.threshold, result.activations, result.activation_rate_hz
        );
    }
    if let Some(path) = output {
        write_sweep(&results, path)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
