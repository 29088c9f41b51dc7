use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{EventSource, SourcePoll, SpikeEvent};
use crate::error::{ConfigError, SourceError};

// -----------------------------------------------------------------------------
// SPIKE GENERATOR
// -----------------------------------------------------------------------------

const BURST_LEN: usize = 8;
const BURST_ISI_S: f64 = 0.002;

#[derive(Debug, Clone)]
pub struct SpikeGeneratorConfig {
    pub num_units: u32,
    /// Summed background rate across all units.
    pub rate_hz: f64,
    pub clock_rate_hz: f64,
    pub burst_unit: Option<u32>,
    /// Chance that a background spike is followed by a burst on `burst_unit`.
    pub burst_probability: f64,
    pub seed: Option<u64>,
}

impl SpikeGeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate = self.clock_rate_hz;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidClockRate(rate));
        }
        if !self.rate_hz.is_finite() || self.rate_hz < 0.0 {
            return Err(ConfigError::InvalidSimulation(format!(
                "background rate must be a non-negative number of Hz, got {}",
                self.rate_hz
            )));
        }
        if !(0.0..=1.0).contains(&self.burst_probability) {
            return Err(ConfigError::InvalidSimulation(format!(
                "burst probability must be within 0..=1, got {}",
                self.burst_probability
            )));
        }
        if let Some(unit_id) = self.burst_unit {
            if unit_id >= self.num_units {
                return Err(ConfigError::UnknownUnit {
                    unit_id,
                    num_units: self.num_units as usize,
                });
            }
        }
        Ok(())
    }
}

/// Poisson background spiking with occasional bursts on one unit.
pub struct SpikeGenerator {
    config: SpikeGeneratorConfig,
    rng: StdRng,
    time_s: f64,
    pending: VecDeque<SpikeEvent>,
}

impl SpikeGenerator {
    pub fn new(config: SpikeGeneratorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            time_s: 0.0,
            pending: VecDeque::with_capacity(BURST_LEN),
        }
    }

    fn ticks(&self, time_s: f64) -> u64 {
        (time_s * self.config.clock_rate_hz).round() as u64
    }

    pub fn clock_rate_hz(&self) -> f64 {
        self.config.clock_rate_hz
    }
}

impl Iterator for SpikeGenerator {
    type Item = SpikeEvent;

    fn next(&mut self) -> Option<SpikeEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.config.num_units == 0 || self.config.rate_hz <= 0.0 {
            return None;
        }

        let u: f64 = self.rng.gen();
        self.time_s += -(1.0 - u).ln() / self.config.rate_hz;
        let unit_id = self.rng.gen_range(0..self.config.num_units);
        let event = SpikeEvent::new(self.ticks(self.time_s), unit_id);

        if let Some(burst_unit) = self.config.burst_unit {
            // NaN never bursts
            let p = self.config.burst_probability;
            if p > 0.0 && self.rng.gen_bool(p.min(1.0)) {
                for k in 1..=BURST_LEN {
                    let t = self.time_s + k as f64 * BURST_ISI_S;
                    let burst = SpikeEvent::new(self.ticks(t), burst_unit);
                    self.pending.push_back(burst);
                }
                self.time_s += BURST_LEN as f64 * BURST_ISI_S;
            }
        }

        Some(event)
    }
}

// -----------------------------------------------------------------------------
// IN-PROCESS SIMULATED SOURCE
// -----------------------------------------------------------------------------

pub struct SimulatedSource {
    generator: SpikeGenerator,
    realtime: bool,
    start: Option<Instant>,
    next: Option<SpikeEvent>,
    remaining: Option<usize>,
}

impl SimulatedSource {
    pub fn new(config: SpikeGeneratorConfig, realtime: bool) -> Self {
        Self {
            generator: SpikeGenerator::new(config),
            realtime,
            start: None,
            next: None,
            remaining: None,
        }
    }

    /// Ends the stream after `count` events.
    pub fn with_limit(mut self, count: usize) -> Self {
        self.remaining = Some(count);
        self
    }

    fn due(&self, start: Instant, event: &SpikeEvent) -> Instant {
        start + Duration::from_secs_f64(event.timestamp as f64 / self.generator.clock_rate_hz())
    }
}

impl EventSource for SimulatedSource {
    fn next_event(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        if self.remaining == Some(0) {
            return Ok(SourcePoll::Ended);
        }
        let event = match self.next.take().or_else(|| self.generator.next()) {
            Some(event) => event,
            None => return Ok(SourcePoll::Ended),
        };

        if self.realtime {
            let start = *self.start.get_or_insert_with(Instant::now);
            let due = self.due(start, &event);
            let now = Instant::now();
            if due > now + timeout {
                thread::sleep(timeout);
                self.next = Some(event);
                return Ok(SourcePoll::Timeout);
            }
            if due > now {
                thread::sleep(due - now);
            }
        }

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Ok(SourcePoll::Event(event))
    }

    fn describe(&self) -> String {
        format!(
            "simulated({} units, {} Hz)",
            self.generator.config.num_units, self.generator.config.rate_hz
        )
    }
}

// -----------------------------------------------------------------------------
// SIMULATED ACQUISITION BRIDGE
// -----------------------------------------------------------------------------

/// Serves generated spike frames to every client that connects, paced in real time.
pub fn run(address: &str, config: SpikeGeneratorConfig) -> io::Result<()> {
    config
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(address)?;
    info!("simulated acquisition bridge listening on {}", listener.local_addr()?);

    for stream in listener.incoming() {
        let stream = stream?;
        let mut client_config = config.clone();
        // distinct streams per client unless a seed was pinned
        if client_config.seed.is_none() {
            client_config.seed = Some(rand::thread_rng().gen());
        }
        thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            info!("client {} connected", peer);
            if let Err(e) = stream_spikes(stream, client_config) {
                warn!("client {} dropped: {}", peer, e);
            }
        });
    }

    Ok(())
}

fn stream_spikes(mut stream: TcpStream, config: SpikeGeneratorConfig) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let clock_rate_hz = config.clock_rate_hz;
    let start = Instant::now();

    for event in SpikeGenerator::new(config) {
        let due = start + Duration::from_secs_f64(event.timestamp as f64 / clock_rate_hz);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        stream.write_all(&event.to_frame())?;
    }
    Ok(())
}
