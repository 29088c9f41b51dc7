use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Session time in acquisition clock ticks.
pub trait Clock: Send {
    /// Called with each event timestamp before the event is processed.
    fn observe(&mut self, timestamp: u64);

    fn now(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn observe(&mut self, timestamp: u64) {
        (**self).observe(timestamp)
    }

    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// Follows the newest event timestamp. Time stands still between events.
#[derive(Debug, Default)]
pub struct StreamClock {
    latest: u64,
}

impl StreamClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for StreamClock {
    fn observe(&mut self, timestamp: u64) {
        self.latest = self.latest.max(timestamp);
    }

    fn now(&self) -> u64 {
        self.latest
    }
}

/// Wall-clock time expressed in acquisition ticks.
///
/// Anchored on the first observed event so that bins line up with the
/// acquisition clock. Re-anchored whenever an event runs ahead of the
/// estimate, or lags it by more than `max_lag` ticks, so drift between the
/// acquisition clock and the host never accumulates.
#[derive(Debug)]
pub struct SystemClock {
    rate_hz: f64,
    max_lag: u64,
    anchor: Option<(u64, Instant)>,
}

impl SystemClock {
    /// Tolerates 100 ms of lag before re-anchoring.
    pub fn new(rate_hz: f64) -> Self {
        Self {
            rate_hz,
            max_lag: (rate_hz / 10.0).ceil() as u64,
            anchor: None,
        }
    }

    /// Largest lag, in ticks, between the estimate and an observed event.
    pub fn with_max_lag(mut self, ticks: u64) -> Self {
        self.max_lag = ticks;
        self
    }

    fn observe_at(&mut self, timestamp: u64, at: Instant) {
        let estimate = self.now_at(at);
        let reanchor = match self.anchor {
            None => true,
            Some(_) => timestamp > estimate || estimate - timestamp > self.max_lag,
        };
        if reanchor {
            self.anchor = Some((timestamp, at));
        }
    }

    fn now_at(&self, at: Instant) -> u64 {
        match self.anchor {
            Some((ticks, anchored)) => {
                let elapsed = at.saturating_duration_since(anchored).as_secs_f64();
                ticks.saturating_add((elapsed * self.rate_hz) as u64)
            }
            None => 0,
        }
    }
}

impl Clock for SystemClock {
    fn observe(&mut self, timestamp: u64) {
        self.observe_at(timestamp, Instant::now());
    }

    fn now(&self) -> u64 {
        self.now_at(Instant::now())
    }
}

/// Externally driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ticks: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.fetch_max(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn observe(&mut self, timestamp: u64) {
        self.set(timestamp);
    }

    fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}
