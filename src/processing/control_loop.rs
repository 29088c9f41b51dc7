use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::binner::{BinReady, Binner, BinnerDiagnostics, EventFate};
use super::clock::Clock;
use super::decoders::{Decision, Decoder};
use super::triggers::{Latch, LatchCommand};
use crate::config::{Config, RateEvaluation};
use crate::error::{ConfigError, ControlError, SourceError};
use crate::local::{EventSource, SourcePoll, SpikeEvent};
use crate::monitor::{MonitorSnapshot, SessionMonitor};
use crate::output::laser::ActuatorLink;
use crate::output::transport::Transport;
use crate::utils::log::CommandLog;

// -----------------------------------------------------------------------------
// PIPELINE
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub iterations: u64,
    pub events: u64,
    pub activations: u64,
    pub patterns: u64,
    pub deactivations: u64,
    pub failed_writes: u64,
}

/// What one iteration decided and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub decision: Decision,
    pub command: Option<LatchCommand>,
    pub bin_ready: Option<BinReady>,
    pub fate: Option<EventFate>,
}

/// Binner, decoders, latch and actuator wired together. Owned by exactly one
/// thread; nothing in here blocks except actuator writes.
pub struct Pipeline {
    binner: Binner,
    decoders: Vec<Decoder>,
    votes: Vec<Decision>,
    latch: Latch,
    link: ActuatorLink,
    rate_evaluation: RateEvaluation,
    pulse_duration_ms: f64,
    arm_on_start: bool,
    pending_off: bool,
    off_retries: u32,
    last_decision: Decision,
    last_tick: u64,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(config: &Config, transport: Option<Box<dyn Transport>>) -> Result<Self, ConfigError> {
        config.validate()?;

        let binner = Binner::new(
            config.bin_ticks()?,
            config.binner.num_bins,
            config.binner.num_units,
        )?;
        let decoders = config
            .decoders
            .iter()
            .map(|d| Decoder::from_config(d, &config.binner))
            .collect::<Result<Vec<_>, _>>()?;
        let hold_ticks = config.ms_to_ticks(config.actuator.hold_ms()? as u64);

        let mut link = ActuatorLink::new(transport, config.actuator.deactivate_code);
        if let Some(dir) = &config.logging.command_log_dir {
            match CommandLog::create(dir) {
                Ok(log) => {
                    info!("logging actuator commands to {}", log.path().display());
                    link = link.with_command_log(log);
                }
                Err(e) => warn!("could not create command log in {}: {}", dir.display(), e),
            }
        }

        for decoder in &decoders {
            info!("decoder {}", decoder.describe());
        }

        Ok(Self {
            binner,
            votes: vec![Decision::NoChange; decoders.len()],
            decoders,
            latch: Latch::new(hold_ticks),
            link,
            rate_evaluation: config.session.rate_evaluation,
            pulse_duration_ms: config.actuator.pulse_duration_ms,
            arm_on_start: config.actuator.arm_on_start,
            pending_off: false,
            off_retries: 0,
            last_decision: Decision::NoChange,
            last_tick: 0,
            stats: PipelineStats::default(),
        })
    }

    /// Sends the pulse duration and arms the device.
    pub fn start(&mut self) -> Result<(), ConfigError> {
        self.link.configure_duration(self.pulse_duration_ms)?;
        if self.arm_on_start {
            if let Err(e) = self.link.enable() {
                self.stats.failed_writes += 1;
                warn!("failed to enable actuator: {}", e);
            }
        }
        Ok(())
    }

    /// Runs one iteration at session time `now`, with the event received in
    /// this iteration if there was one.
    pub fn step(&mut self, event: Option<SpikeEvent>, now: u64) -> StepOutcome {
        self.stats.iterations += 1;
        self.last_tick = now;
        self.link.set_tick(now);

        self.binner.advance_to(now);
        let fate = event.map(|e| {
            self.stats.events += 1;
            let fate = self.binner.on_event(e);
            match fate {
                EventFate::Counted => {}
                EventFate::Stale => debug!("dropped stale spike {:?}", e),
                EventFate::UnknownUnit => debug!("dropped spike from unknown unit {}", e.unit_id),
            }
            fate
        });
        // unknown units never reach the decoders
        let event = event.filter(|_| fate != Some(EventFate::UnknownUnit));
        let bin_ready = self.binner.take_ready();

        let evaluate_rates = match self.rate_evaluation {
            RateEvaluation::EveryIteration => true,
            RateEvaluation::BinReady => bin_ready.is_some(),
        };
        for (decoder, vote) in self.decoders.iter_mut().zip(self.votes.iter_mut()) {
            if decoder.uses_bins() {
                // between evaluations the previous vote stands
                if evaluate_rates {
                    *vote = decoder.evaluate(Some(&self.binner), None);
                }
            } else {
                *vote = decoder.evaluate(None, event.as_ref());
            }
        }
        let decision = Decision::combine(self.votes.iter().copied());
        self.last_decision = decision;

        let command = self.latch.step(decision, now);
        match command {
            Some(LatchCommand::Activate) => {
                self.pending_off = false;
                self.fire(event.as_ref(), now);
            }
            Some(LatchCommand::Deactivate) => {
                info!("releasing actuator at tick {}", now);
                self.pending_off = true;
            }
            None => {}
        }
        if self.pending_off {
            self.try_deactivate();
        }

        StepOutcome {
            decision,
            command,
            bin_ready,
            fate,
        }
    }

    /// Fail-safe shutdown: switches the actuator off regardless of the hold,
    /// then disarms the device if the session armed it.
    pub fn shutdown(&mut self) {
        // a failed activate may still have reached the device
        let was_holding = self.latch.force_release().is_some();
        if was_holding || self.link.is_active() || self.pending_off {
            self.pending_off = true;
            self.try_deactivate();
        }
        if self.arm_on_start && self.link.state().enabled {
            if let Err(e) = self.link.disable() {
                self.stats.failed_writes += 1;
                warn!("failed to disable actuator: {}", e);
            }
        }
    }

    pub fn binner(&self) -> &Binner {
        &self.binner
    }

    pub fn decoders(&self) -> &[Decoder] {
        &self.decoders
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub fn link(&self) -> &ActuatorLink {
        &self.link
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// A deactivate is owed to the device and will be retried next iteration.
    pub fn pending_off(&self) -> bool {
        self.pending_off
    }

    pub fn last_decision(&self) -> Decision {
        self.last_decision
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            tick: self.last_tick,
            bins: self.binner.snapshot(),
            actuator: self.link.state().clone(),
            latch: self.latch.state(),
            decision: self.last_decision,
            stats: self.stats,
            diagnostics: self.binner.diagnostics(),
        }
    }

    fn fire(&mut self, event: Option<&SpikeEvent>, now: u64) {
        let pattern = self
            .decoders
            .iter()
            .filter_map(|d| d.pattern(event))
            .find(|flags| flags.iter().any(|on| *on));

        let result = match pattern {
            Some(flags) => {
                self.stats.patterns += 1;
                self.link.send_pattern(&flags, now)
            }
            None => self.link.activate(now),
        };
        self.stats.activations += 1;
        info!("trigger at tick {}", now);
        if let Err(e) = result {
            self.stats.failed_writes += 1;
            warn!("activate failed: {}", e);
        }
    }

    fn try_deactivate(&mut self) {
        match self.link.deactivate() {
            Ok(()) => {
                if self.off_retries > 0 {
                    info!("deactivate delivered after {} retries", self.off_retries);
                }
                self.pending_off = false;
                self.off_retries = 0;
                self.stats.deactivations += 1;
            }
            Err(e) => {
                self.stats.failed_writes += 1;
                if self.off_retries == 0 {
                    warn!("deactivate failed, retrying every iteration: {}", e);
                } else {
                    debug!("deactivate retry {} failed: {}", self.off_retries, e);
                }
                self.off_retries += 1;
            }
        }
    }
}

// -----------------------------------------------------------------------------
// SESSION
// -----------------------------------------------------------------------------

/// Cloneable stop flag checked once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stopped,
    StreamEnded,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub reason: StopReason,
    pub stats: PipelineStats,
    pub diagnostics: BinnerDiagnostics,
    pub final_tick: u64,
}

/// One closed-loop session: pulls events, steps the pipeline and always ends
/// with the actuator switched off.
pub struct Session<S: EventSource, C: Clock> {
    pipeline: Pipeline,
    source: S,
    clock: C,
    stop: StopHandle,
    monitor: Option<SessionMonitor>,
    poll_timeout: Duration,
    monitor_interval: Duration,
}

impl<S: EventSource, C: Clock> Session<S, C> {
    pub fn new(
        config: &Config,
        source: S,
        clock: C,
        transport: Option<Box<dyn Transport>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline: Pipeline::new(config, transport)?,
            source,
            clock,
            stop: StopHandle::new(),
            monitor: None,
            poll_timeout: Duration::from_millis(config.session.poll_timeout_ms),
            monitor_interval: Duration::from_millis(config.session.monitor_interval_ms),
        })
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_monitor(mut self, monitor: SessionMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn run(mut self) -> Result<SessionSummary, ControlError> {
        info!("session started on {}", self.source.describe());
        self.pipeline.start()?;

        let mut last_publish: Option<Instant> = None;
        let outcome: Result<StopReason, SourceError> = loop {
            if self.stop.is_stopped() {
                break Ok(StopReason::Stopped);
            }

            let event = match self.source.next_event(self.poll_timeout) {
                Ok(SourcePoll::Event(event)) => {
                    self.clock.observe(event.timestamp);
                    Some(event)
                }
                Ok(SourcePoll::Timeout) => None,
                Ok(SourcePoll::Ended) => break Ok(StopReason::StreamEnded),
                Err(e) => break Err(e),
            };
            let now = self.clock.now();
            self.pipeline.step(event, now);

            if let Some(monitor) = &self.monitor {
                let due = last_publish.map_or(true, |t| t.elapsed() >= self.monitor_interval);
                if due && monitor.publish(self.pipeline.snapshot()) {
                    last_publish = Some(Instant::now());
                }
            }
        };

        self.pipeline.shutdown();
        if let Some(monitor) = &self.monitor {
            monitor.publish(self.pipeline.snapshot());
        }

        let reason = outcome.map_err(|e| {
            error!("event source failed, actuator switched off: {}", e);
            ControlError::Source(e)
        })?;
        let stats = self.pipeline.stats();
        info!(
            "session ended ({:?}): {} events, {} activations",
            reason, stats.events, stats.activations
        );
        Ok(SessionSummary {
            reason,
            stats,
            diagnostics: self.pipeline.binner().diagnostics(),
            final_tick: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, Threshold};
    use crate::output::transport::MemoryTransport;
    use crate::processing::triggers::LatchState;

    // 1 kHz clock so ticks are milliseconds
    fn config(decoders: Vec<DecoderConfig>, hold_ms: f64) -> Config {
        let mut config: Config = serde_yaml::from_str("decoders: []").unwrap();
        config.session.clock_rate_hz = 1_000.0;
        config.binner.bin_size_s = 0.1;
        config.binner.num_bins = 10;
        config.binner.num_units = 4;
        config.actuator.pulse_duration_ms = hold_ms;
        config.decoders = decoders;
        config
    }

    fn rate_decoder() -> DecoderConfig {
        DecoderConfig::FrThreshold {
            unit_id: 2,
            threshold: Threshold::Count { value: 5 },
            hysteresis: true,
            release_below: None,
        }
    }

    fn pipeline(config: &Config) -> (Pipeline, MemoryTransport) {
        let device = MemoryTransport::new();
        let pipeline = Pipeline::new(config, Some(Box::new(device.clone()))).unwrap();
        (pipeline, device)
    }

    #[test]
    fn test_start_and_shutdown_arm_and_disarm() {
        let (mut pipeline, device) = pipeline(&config(vec![rate_decoder()], 250.0));
        pipeline.start().unwrap();
        pipeline.shutdown();
        assert_eq!(device.written(), vec![b"d250".to_vec(), b"e".to_vec(), b"E".to_vec()]);
    }

    #[test]
    fn test_rate_trigger_holds_then_releases() {
        let (mut pipeline, device) = pipeline(&config(vec![rate_decoder()], 300.0));
        for t in 0..5 {
            pipeline.step(Some(SpikeEvent::new(10 + t, 2)), 10 + t);
        }
        assert_eq!(pipeline.stats().activations, 1);
        assert_eq!(device.written(), vec![b"a".to_vec()]);

        // the window empties at tick 1000 but the hold ends at tick 314
        let outcome = pipeline.step(None, 1_000);
        assert_eq!(outcome.decision, Decision::Release);
        assert_eq!(outcome.command, Some(LatchCommand::Deactivate));
        assert_eq!(device.written(), vec![b"a".to_vec(), b"A".to_vec()]);
    }

    #[test]
    fn test_bin_ready_mode_waits_for_rotation() {
        let mut config = config(vec![rate_decoder()], 0.0);
        config.session.rate_evaluation = RateEvaluation::BinReady;
        let (mut pipeline, _device) = pipeline(&config);
        pipeline.step(None, 0);
        for t in 1..6 {
            let outcome = pipeline.step(Some(SpikeEvent::new(t, 2)), t);
            assert_eq!(outcome.command, None);
        }
        let outcome = pipeline.step(None, 100);
        assert!(outcome.bin_ready.is_some());
        assert_eq!(outcome.command, Some(LatchCommand::Activate));
    }

    #[test]
    fn test_pattern_output_replaces_activate() {
        let identity = DecoderConfig::SpikeIdentity {
            target_unit_ids: vec![1, 3],
            pattern_output: true,
        };
        let (mut pipeline, device) = pipeline(&config(vec![identity], 50.0));
        pipeline.step(Some(SpikeEvent::new(5, 3)), 5);
        assert_eq!(device.written(), vec![vec![b'p', 0x40, 0x00]]);
        assert_eq!(pipeline.stats().patterns, 1);

        // identity decoders abstain, so the hold timeout ends the episode
        pipeline.step(None, 54);
        assert!(pipeline.link().is_active());
        pipeline.step(None, 55);
        assert!(!pipeline.link().is_active());
    }

    #[test]
    fn test_unknown_units_do_not_trigger() {
        let identity = DecoderConfig::SpikeIdentity {
            target_unit_ids: vec![9],
            pattern_output: false,
        };
        let (mut pipeline, device) = pipeline(&config(vec![identity], 50.0));
        let outcome = pipeline.step(Some(SpikeEvent::new(5, 9)), 5);
        assert_eq!(outcome.fate, Some(EventFate::UnknownUnit));
        assert_eq!(outcome.decision, Decision::NoChange);
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_failed_deactivate_is_retried() {
        let identity = DecoderConfig::SpikeIdentity {
            target_unit_ids: vec![0],
            pattern_output: false,
        };
        let (mut pipeline, device) = pipeline(&config(vec![identity], 10.0));
        pipeline.step(Some(SpikeEvent::new(0, 0)), 0);
        device.set_fail_writes(true);
        pipeline.step(None, 20);
        assert!(pipeline.pending_off());
        pipeline.step(None, 21);
        assert!(pipeline.pending_off());
        device.set_fail_writes(false);
        pipeline.step(None, 22);
        assert!(!pipeline.pending_off());
        assert_eq!(device.written(), vec![b"a".to_vec(), b"A".to_vec()]);
        assert_eq!(pipeline.stats().failed_writes, 2);
    }

    #[test]
    fn test_shutdown_ignores_hold() {
        let (mut pipeline, device) = pipeline(&config(vec![rate_decoder()], 10_000.0));
        for t in 0..5 {
            pipeline.step(Some(SpikeEvent::new(t, 2)), t);
        }
        assert!(pipeline.link().is_active());
        pipeline.shutdown();
        assert!(!pipeline.link().is_active());
        assert_eq!(pipeline.latch().state(), LatchState::Idle);
        assert_eq!(device.written(), vec![b"a".to_vec(), b"A".to_vec()]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config(vec![rate_decoder()], 10.0);
        config.actuator.pulse_duration_ms = -5.0;
        assert!(Pipeline::new(&config, None).is_err());
    }
}
