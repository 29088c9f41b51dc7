use crate::config::MAX_UNITS;
use crate::error::ConfigError;
use crate::local::SpikeEvent;

// -----------------------------------------------------------------------------
// BIN MATRIX
// -----------------------------------------------------------------------------

/// Immutable B x N view of spike counts, rows ordered oldest to newest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinMatrix {
    num_bins: usize,
    num_units: usize,
    counts: Vec<u32>,
}

impl BinMatrix {
    pub fn zeros(num_bins: usize, num_units: usize) -> Self {
        Self {
            num_bins,
            num_units,
            counts: vec![0; num_bins * num_units],
        }
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn row(&self, bin: usize) -> &[u32] {
        &self.counts[bin * self.num_units..(bin + 1) * self.num_units]
    }

    pub fn get(&self, bin: usize, unit_id: usize) -> u32 {
        self.counts[bin * self.num_units + unit_id]
    }

    /// Spikes of one unit across every retained bin; 0 for unknown units.
    pub fn column_sum(&self, unit_id: u32) -> u32 {
        let unit = unit_id as usize;
        if unit >= self.num_units {
            return 0;
        }
        (0..self.num_bins).map(|bin| self.get(bin, unit)).sum()
    }

    pub fn sum_by_unit(&self) -> Vec<u32> {
        (0..self.num_units as u32)
            .map(|unit| self.column_sum(unit))
            .collect()
    }
}

// -----------------------------------------------------------------------------
// BINNER
// -----------------------------------------------------------------------------

/// What happened to an event handed to the binner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFate {
    Counted,
    /// Older than the oldest retained bin.
    Stale,
    UnknownUnit,
}

/// Emitted when the ring rotated: `closed` bins were completed and the
/// window now ends at absolute bin `newest_bin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinReady {
    pub newest_bin: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinnerDiagnostics {
    pub counted: u64,
    pub stale: u64,
    pub unknown_unit: u64,
}

/// Sliding window of per-unit spike counts over `num_bins` fixed-width bins.
///
/// Row `k % num_bins` of the ring holds absolute bin `k`. The window covers
/// absolute bins `newest - num_bins + 1 ..= newest`.
pub struct Binner {
    bin_ticks: u64,
    num_bins: usize,
    num_units: usize,
    ring: Vec<u32>,
    totals: Vec<u32>,
    newest: Option<u64>,
    ready: Option<BinReady>,
    diagnostics: BinnerDiagnostics,
}

impl Binner {
    pub fn new(bin_ticks: u64, num_bins: usize, num_units: usize) -> Result<Self, ConfigError> {
        let mut binner = Self {
            bin_ticks: 1,
            num_bins: 1,
            num_units: 1,
            ring: Vec::new(),
            totals: Vec::new(),
            newest: None,
            ready: None,
            diagnostics: BinnerDiagnostics::default(),
        };
        binner.configure(bin_ticks, num_bins, num_units)?;
        Ok(binner)
    }

    /// Resets all counts and reshapes the window.
    pub fn configure(
        &mut self,
        bin_ticks: u64,
        num_bins: usize,
        num_units: usize,
    ) -> Result<(), ConfigError> {
        if bin_ticks == 0 {
            return Err(ConfigError::InvalidBinSize(0.0));
        }
        if num_bins == 0 {
            return Err(ConfigError::ZeroBins);
        }
        if num_units == 0 || num_units > MAX_UNITS {
            return Err(ConfigError::InvalidUnitCount {
                got: num_units,
                max: MAX_UNITS,
            });
        }
        self.bin_ticks = bin_ticks;
        self.num_bins = num_bins;
        self.num_units = num_units;
        self.ring = vec![0; num_bins * num_units];
        self.totals = vec![0; num_units];
        self.newest = None;
        self.ready = None;
        self.diagnostics = BinnerDiagnostics::default();
        Ok(())
    }

    pub fn bin_ticks(&self) -> u64 {
        self.bin_ticks
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn diagnostics(&self) -> BinnerDiagnostics {
        self.diagnostics
    }

    /// Absolute index of the newest retained bin, once time has started.
    pub fn newest_bin(&self) -> Option<u64> {
        self.newest
    }

    pub fn on_event(&mut self, event: SpikeEvent) -> EventFate {
        let unit = event.unit_id as usize;
        if unit >= self.num_units {
            self.diagnostics.unknown_unit += 1;
            return EventFate::UnknownUnit;
        }

        let bin = event.timestamp / self.bin_ticks;
        self.rotate_to(bin);
        // rotate_to leaves newest >= bin
        let newest = self.newest.unwrap_or(bin);
        if newest - bin >= self.num_bins as u64 {
            self.diagnostics.stale += 1;
            return EventFate::Stale;
        }

        let row = (bin % self.num_bins as u64) as usize;
        self.ring[row * self.num_units + unit] += 1;
        self.totals[unit] += 1;
        self.diagnostics.counted += 1;
        EventFate::Counted
    }

    /// Moves the window forward so that it ends at the bin containing `now`.
    pub fn advance_to(&mut self, now: u64) {
        self.rotate_to(now / self.bin_ticks);
    }

    /// Drains the pending rotation notice, if any.
    pub fn take_ready(&mut self) -> Option<BinReady> {
        self.ready.take()
    }

    pub fn unit_sum(&self, unit_id: u32) -> u32 {
        self.totals.get(unit_id as usize).copied().unwrap_or(0)
    }

    pub fn sum_by_unit(&self) -> Vec<u32> {
        self.totals.clone()
    }

    pub fn snapshot(&self) -> BinMatrix {
        let mut counts = Vec::with_capacity(self.ring.len());
        match self.newest {
            Some(newest) => {
                let b = self.num_bins as u64;
                let oldest_row = (newest % b + 1) % b;
                // rows older than the first bin are still zero
                for offset in 0..b {
                    let absolute = (oldest_row + offset) % b;
                    let row = absolute as usize;
                    counts.extend_from_slice(
                        &self.ring[row * self.num_units..(row + 1) * self.num_units],
                    );
                }
            }
            None => counts.resize(self.ring.len(), 0),
        }
        BinMatrix {
            num_bins: self.num_bins,
            num_units: self.num_units,
            counts,
        }
    }

    fn rotate_to(&mut self, bin: u64) {
        let newest = match self.newest {
            Some(newest) if bin > newest => newest,
            Some(_) => return,
            None => {
                self.newest = Some(bin);
                return;
            }
        };

        let steps = bin - newest;
        if steps >= self.num_bins as u64 {
            self.ring.iter_mut().for_each(|c| *c = 0);
            self.totals.iter_mut().for_each(|t| *t = 0);
        } else {
            for k in newest + 1..=bin {
                self.clear_row((k % self.num_bins as u64) as usize);
            }
        }
        self.newest = Some(bin);

        let closed = self.ready.map_or(0, |r| r.closed).saturating_add(steps);
        self.ready = Some(BinReady {
            newest_bin: bin,
            closed,
        });
    }

    fn clear_row(&mut self, row: usize) {
        let start = row * self.num_units;
        for (unit, count) in self.ring[start..start + self.num_units].iter_mut().enumerate() {
            self.totals[unit] -= *count;
            *count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binner() -> Binner {
        // 100 ticks per bin, 10 bins, 4 units
        Binner::new(100, 10, 4).unwrap()
    }

    #[test]
    fn test_sums_match_event_counts_within_window() {
        let mut binner = binner();
        let units = [0, 1, 3, 1, 1, 0, 2, 3, 1];
        for (i, unit) in units.iter().enumerate() {
            let fate = binner.on_event(SpikeEvent::new(i as u64 * 37, *unit));
            assert_eq!(fate, EventFate::Counted);
        }
        assert_eq!(binner.sum_by_unit(), vec![2, 4, 1, 2]);
        assert_eq!(binner.snapshot().sum_by_unit(), vec![2, 4, 1, 2]);
    }

    #[test]
    fn test_ring_rotation_evicts_oldest_bin() {
        let mut binner = binner();
        for _ in 0..3 {
            binner.on_event(SpikeEvent::new(50, 2));
        }
        binner.on_event(SpikeEvent::new(150, 2));
        assert_eq!(binner.unit_sum(2), 4);

        // bin 9 is still inside the window starting at bin 0
        binner.advance_to(999);
        assert_eq!(binner.unit_sum(2), 4);

        // bin 10 evicts bin 0; bin 1 is now the oldest
        binner.advance_to(1000);
        assert_eq!(binner.unit_sum(2), 1);
        let matrix = binner.snapshot();
        assert_eq!(matrix.row(0), &[0, 0, 1, 0]);
        assert_eq!(matrix.row(9), &[0, 0, 0, 0]);

        binner.advance_to(1100);
        assert_eq!(binner.unit_sum(2), 0);
    }

    #[test]
    fn test_large_jump_clears_everything() {
        let mut binner = binner();
        binner.on_event(SpikeEvent::new(10, 1));
        binner.on_event(SpikeEvent::new(5_000_000, 0));
        assert_eq!(binner.sum_by_unit(), vec![1, 0, 0, 0]);
        assert_eq!(binner.newest_bin(), Some(50_000));
    }

    #[test]
    fn test_stale_and_unknown_events_are_dropped() {
        let mut binner = binner();
        binner.on_event(SpikeEvent::new(2_000, 1));
        assert_eq!(binner.on_event(SpikeEvent::new(1_000, 1)), EventFate::Stale);
        assert_eq!(binner.on_event(SpikeEvent::new(1_100, 1)), EventFate::Counted);
        assert_eq!(binner.on_event(SpikeEvent::new(2_000, 4)), EventFate::UnknownUnit);

        let diagnostics = binner.diagnostics();
        assert_eq!(diagnostics.stale, 1);
        assert_eq!(diagnostics.unknown_unit, 1);
        assert_eq!(diagnostics.counted, 2);
        assert_eq!(binner.unit_sum(1), 2);
    }

    #[test]
    fn test_snapshot_orders_rows_oldest_first() {
        let mut binner = Binner::new(10, 3, 2).unwrap();
        binner.on_event(SpikeEvent::new(0, 0));
        binner.on_event(SpikeEvent::new(10, 1));
        binner.on_event(SpikeEvent::new(25, 1));
        binner.on_event(SpikeEvent::new(26, 1));
        binner.on_event(SpikeEvent::new(31, 0));

        let matrix = binner.snapshot();
        assert_eq!(matrix.num_bins(), 3);
        assert_eq!(matrix.row(0), &[0, 1]);
        assert_eq!(matrix.row(1), &[0, 2]);
        assert_eq!(matrix.row(2), &[1, 0]);
    }

    #[test]
    fn test_bin_ready_accumulates_until_taken() {
        let mut binner = binner();
        binner.advance_to(0);
        assert_eq!(binner.take_ready(), None);
        binner.advance_to(250);
        binner.on_event(SpikeEvent::new(320, 0));
        assert_eq!(
            binner.take_ready(),
            Some(BinReady {
                newest_bin: 3,
                closed: 3
            })
        );
        assert_eq!(binner.take_ready(), None);
    }

    #[test]
    fn test_timestamps_near_u64_max_do_not_overflow() {
        let mut binner = Binner::new(1, 10, 4).unwrap();
        binner.on_event(SpikeEvent::new(5, 1));
        assert_eq!(binner.on_event(SpikeEvent::new(u64::MAX, 1)), EventFate::Counted);
        assert_eq!(binner.newest_bin(), Some(u64::MAX));
        assert_eq!(binner.unit_sum(1), 1);
        assert_eq!(binner.on_event(SpikeEvent::new(u64::MAX - 9, 2)), EventFate::Counted);
        assert_eq!(binner.on_event(SpikeEvent::new(u64::MAX - 10, 2)), EventFate::Stale);
        binner.advance_to(u64::MAX);

        let matrix = binner.snapshot();
        assert_eq!(matrix.row(0), &[0, 0, 1, 0]);
        assert_eq!(matrix.row(9), &[0, 1, 0, 0]);
        assert_eq!(matrix.sum_by_unit(), binner.sum_by_unit());
    }

    #[test]
    fn test_configure_rejects_bad_shapes() {
        assert!(Binner::new(0, 10, 4).is_err());
        assert!(Binner::new(100, 0, 4).is_err());
        assert!(Binner::new(100, 10, 0).is_err());
        assert!(Binner::new(100, 10, MAX_UNITS + 1).is_err());
    }
}
