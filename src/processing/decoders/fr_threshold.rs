use super::Decision;
use crate::error::ConfigError;
use crate::processing::binner::Binner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    Inactive,
    Active,
}

/// Fires when one unit's spike count over the whole window reaches a threshold.
///
/// With hysteresis the decoder latches `Active` on `sum >= threshold` and only
/// returns to `Inactive` once the sum drops strictly below `release_below`
/// (which defaults to the threshold itself).
#[derive(Debug, Clone)]
pub struct FrThreshold {
    unit_id: u32,
    threshold: u32,
    release_below: u32,
    hysteresis: bool,
    state: ThresholdState,
}

impl FrThreshold {
    pub fn new(
        unit_id: u32,
        threshold: u32,
        hysteresis: bool,
        release_below: Option<u32>,
    ) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::ThresholdOutOfRange(
                "spike count must be at least 1".to_string(),
            ));
        }
        let release_below = release_below.unwrap_or(threshold);
        if release_below == 0 || release_below > threshold {
            return Err(ConfigError::ThresholdOutOfRange(format!(
                "release_below must be within 1..={}, got {}",
                threshold, release_below
            )));
        }
        Ok(Self {
            unit_id,
            threshold,
            release_below,
            hysteresis,
            state: ThresholdState::Inactive,
        })
    }

    pub fn unit_id(&self) -> u32 {
        self.unit_id
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn hysteresis(&self) -> bool {
        self.hysteresis
    }

    pub fn state(&self) -> ThresholdState {
        self.state
    }

    /// Reads the binner's running total for the unit; no matrix is built.
    pub fn evaluate(&mut self, binner: &Binner) -> Decision {
        self.evaluate_sum(binner.unit_sum(self.unit_id))
    }

    pub fn evaluate_sum(&mut self, sum: u32) -> Decision {
        if !self.hysteresis {
            return if sum >= self.threshold {
                Decision::Trigger
            } else {
                Decision::Release
            };
        }

        match self.state {
            ThresholdState::Inactive if sum >= self.threshold => {
                self.state = ThresholdState::Active;
                Decision::Trigger
            }
            ThresholdState::Inactive => Decision::Release,
            ThresholdState::Active if sum < self.release_below => {
                self.state = ThresholdState::Inactive;
                Decision::Release
            }
            ThresholdState::Active => Decision::Trigger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_threshold() {
        let mut decoder = FrThreshold::new(0, 3, false, None).unwrap();
        assert_eq!(decoder.evaluate_sum(2), Decision::Release);
        assert_eq!(decoder.evaluate_sum(3), Decision::Trigger);
        assert_eq!(decoder.evaluate_sum(9), Decision::Trigger);
        assert_eq!(decoder.evaluate_sum(0), Decision::Release);
    }

    #[test]
    fn test_hysteresis_holds_active_at_threshold() {
        let mut decoder = FrThreshold::new(0, 5, true, None).unwrap();
        assert_eq!(decoder.evaluate_sum(4), Decision::Release);
        assert_eq!(decoder.evaluate_sum(5), Decision::Trigger);
        assert_eq!(decoder.state(), ThresholdState::Active);
        for sum in [5, 7, 5, 6] {
            assert_eq!(decoder.evaluate_sum(sum), Decision::Trigger);
        }
        assert_eq!(decoder.evaluate_sum(4), Decision::Release);
        assert_eq!(decoder.state(), ThresholdState::Inactive);
        assert_eq!(decoder.evaluate_sum(4), Decision::Release);
        assert_eq!(decoder.evaluate_sum(5), Decision::Trigger);
    }

    #[test]
    fn test_release_band_prevents_chatter() {
        let mut decoder = FrThreshold::new(0, 5, true, Some(2)).unwrap();
        assert_eq!(decoder.evaluate_sum(5), Decision::Trigger);
        // dips inside the band keep the decoder active
        for sum in [4, 3, 2, 4] {
            assert_eq!(decoder.evaluate_sum(sum), Decision::Trigger);
        }
        assert_eq!(decoder.evaluate_sum(1), Decision::Release);
        // re-arming needs the full threshold again
        for sum in [2, 3, 4] {
            assert_eq!(decoder.evaluate_sum(sum), Decision::Release);
        }
        assert_eq!(decoder.evaluate_sum(5), Decision::Trigger);
    }

    #[test]
    fn test_hysteresis_never_releases_above_threshold() {
        let sums = [0, 6, 5, 5, 8, 4, 3, 5, 5, 2, 9, 9, 0, 5];
        let mut decoder = FrThreshold::new(0, 5, true, None).unwrap();
        let mut previous = ThresholdState::Inactive;
        for &sum in &sums {
            let decision = decoder.evaluate_sum(sum);
            if sum >= 5 {
                assert_eq!(decision, Decision::Trigger);
            }
            if previous == ThresholdState::Inactive && sum < 5 {
                assert_eq!(decision, Decision::Release);
            }
            previous = decoder.state();
        }
    }

    #[test]
    fn test_evaluate_reads_window_total() {
        use crate::local::SpikeEvent;

        let mut binner = Binner::new(100, 10, 4).unwrap();
        let mut decoder = FrThreshold::new(3, 3, false, None).unwrap();
        for t in [0, 150, 420] {
            binner.on_event(SpikeEvent::new(t, 3));
        }
        binner.on_event(SpikeEvent::new(430, 1));
        assert_eq!(decoder.evaluate(&binner), Decision::Trigger);

        // the spike in bin 0 leaves the window
        binner.advance_to(1_000);
        assert_eq!(decoder.evaluate(&binner), Decision::Release);
    }

    #[test]
    fn test_rejects_invalid_thresholds() {
        assert!(FrThreshold::new(0, 0, false, None).is_err());
        assert!(FrThreshold::new(0, 3, true, Some(4)).is_err());
        assert!(FrThreshold::new(0, 3, true, Some(0)).is_err());
    }
}
