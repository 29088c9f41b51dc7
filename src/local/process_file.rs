use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use super::{EventSource, SourcePoll, SpikeEvent};
use crate::config::{Config, DecoderConfig, Threshold};
use crate::error::{ConfigError, SourceError};
use crate::processing::clock::{Clock, StreamClock};
use crate::processing::control_loop::Pipeline;

// -----------------------------------------------------------------------------
// RECORDED EVENTS
// -----------------------------------------------------------------------------

/// Replays a `timestamp,unit_id` CSV file, optionally paced at the recording's
/// own clock rate.
pub struct CsvEventSource {
    records: csv::DeserializeRecordsIntoIter<File, SpikeEvent>,
    name: String,
    pacing: Option<f64>,
    start: Option<(Instant, u64)>,
    next: Option<SpikeEvent>,
}

impl CsvEventSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)?;
        Ok(Self {
            records: reader.into_deserialize(),
            name: path.display().to_string(),
            pacing: None,
            start: None,
            next: None,
        })
    }

    /// Delivers events no faster than they were recorded at `clock_rate_hz`.
    pub fn paced(mut self, clock_rate_hz: f64) -> Self {
        self.pacing = Some(clock_rate_hz);
        self
    }
}

impl EventSource for CsvEventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        let event = match self.next.take() {
            Some(event) => event,
            None => match self.records.next() {
                Some(record) => record?,
                None => return Ok(SourcePoll::Ended),
            },
        };

        if let Some(rate) = self.pacing {
            let (start, first) = *self.start.get_or_insert((Instant::now(), event.timestamp));
            let offset = event.timestamp.saturating_sub(first) as f64 / rate;
            let due = start + Duration::from_secs_f64(offset);
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
        Ok(SourcePoll::Event(event))
    }

    fn describe(&self) -> String {
        format!("csv {}", self.name)
    }
}

pub fn load_events<P: AsRef<Path>>(path: P) -> Result<Vec<SpikeEvent>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let events = reader
        .deserialize()
        .collect::<Result<Vec<SpikeEvent>, csv::Error>>()?;
    Ok(events)
}

// -----------------------------------------------------------------------------
// THRESHOLD SWEEP
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SweepResult {
    pub threshold: u32,
    pub activations: u64,
    /// Activations per second of recording.
    pub activation_rate_hz: f64,
}

/// Replays `events` through a dry pipeline once per candidate threshold.
///
/// Every firing-rate decoder in `config` gets the candidate as a spike count;
/// an explicit `release_below` is clamped to it.
pub fn sweep_thresholds(
    config: &Config,
    events: &[SpikeEvent],
    thresholds: &[u32],
) -> Result<Vec<SweepResult>, ConfigError> {
    let first = events.iter().map(|e| e.timestamp).min().unwrap_or(0);
    let last = events.iter().map(|e| e.timestamp).max().unwrap_or(0);
    let duration_s = (last - first) as f64 / config.session.clock_rate_hz;
    // idle polls between events, as a live session would run them
    let poll_ticks = config.ms_to_ticks(config.session.poll_timeout_ms).max(1);

    let start = Instant::now();
    let results = thresholds
        .par_iter()
        .map(|&threshold| {
            let candidate = with_threshold(config, threshold);
            let mut pipeline = Pipeline::new(&candidate, None)?;
            let mut clock = StreamClock::new();
            clock.observe(first);
            for event in events {
                let mut now = clock.now();
                while now + poll_ticks < event.timestamp {
                    now += poll_ticks;
                    pipeline.step(None, now);
                }
                clock.observe(event.timestamp);
                pipeline.step(Some(*event), clock.now());
            }
            pipeline.shutdown();

            let activations = pipeline.stats().activations;
            Ok(SweepResult {
                threshold,
                activations,
                activation_rate_hz: if duration_s > 0.0 {
                    activations as f64 / duration_s
                } else {
                    0.0
                },
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    info!(
        "swept {} thresholds over {} events in {:?}",
        thresholds.len(),
        events.len(),
        start.elapsed()
    );
    Ok(results)
}

fn with_threshold(config: &Config, threshold: u32) -> Config {
    let mut candidate = config.clone();
    candidate.logging.command_log_dir = None;
    for decoder in candidate.decoders.iter_mut() {
        if let DecoderConfig::FrThreshold {
            threshold: current,
            release_below,
            ..
        } = decoder
        {
            *current = Threshold::Count { value: threshold };
            if let Some(release) = release_below.as_mut() {
                *release = (*release).min(threshold);
            }
        }
    }
    candidate
}

pub fn write_sweep<P: AsRef<Path>>(results: &[SweepResult], path: P) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for result in results {
        writer.serialize(result)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_events(rows: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "timestamp,unit_id\n{}", rows).unwrap();
        file
    }

    #[test]
    fn test_csv_source_replays_in_file_order() {
        let file = write_events("10, 1\n5,0\n30,2\n");
        let mut source = CsvEventSource::open(file.path()).unwrap();
        let mut seen = Vec::new();
        while let SourcePoll::Event(event) = source.next_event(Duration::from_millis(1)).unwrap() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                SpikeEvent::new(10, 1),
                SpikeEvent::new(5, 0),
                SpikeEvent::new(30, 2)
            ]
        );
        assert_eq!(source.next_event(Duration::ZERO).unwrap(), SourcePoll::Ended);
    }

    #[test]
    fn test_malformed_rows_are_errors() {
        let file = write_events("10,1\nnot-a-number,2\n");
        assert!(load_events(file.path()).is_err());
    }

    #[test]
    fn test_sweep_counts_fewer_activations_for_higher_thresholds() {
        let yaml = r#"
session:
  clock_rate_hz: 1000
binner:
  bin_size_s: 0.1
  num_bins: 5
  num_units: 2
actuator:
  pulse_duration_ms: 0
decoders:
  - kind: fr_threshold
    unit_id: 0
    threshold: { unit: count, value: 1 }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        // bursts of 2, 4 and 6 spikes, each two seconds apart
        let mut events = Vec::new();
        for (burst, size) in [2u64, 4, 6].iter().enumerate() {
            for i in 0..*size {
                events.push(SpikeEvent::new(burst as u64 * 2_000 + i, 0));
            }
        }
        events.push(SpikeEvent::new(6_000, 1));

        let results = sweep_thresholds(&config, &events, &[1, 3, 5, 7]).unwrap();
        let activations: Vec<u64> = results.iter().map(|r| r.activations).collect();
        assert_eq!(activations, vec![3, 2, 1, 0]);
        assert!((results[0].activation_rate_hz - 0.5).abs() < 1e-9);
    }
}
