use tracing::warn;

use super::Decision;
use crate::error::ConfigError;
use crate::local::SpikeEvent;
use crate::output::protocol::PATTERN_CHANNELS;

/// Fires on any spike from one of up to 16 target units.
///
/// Never releases on its own; the latch's hold timeout ends the episode.
#[derive(Debug, Clone)]
pub struct SpikeIdentity {
    targets: Vec<u32>,
    pattern_output: bool,
}

impl SpikeIdentity {
    pub fn new(target_unit_ids: &[u32], pattern_output: bool) -> Result<Self, ConfigError> {
        if target_unit_ids.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }
        if target_unit_ids.len() > PATTERN_CHANNELS {
            warn!(
                "spike identity decoder given {} targets, keeping the first {}",
                target_unit_ids.len(),
                PATTERN_CHANNELS
            );
        }
        let targets = target_unit_ids
            .iter()
            .copied()
            .take(PATTERN_CHANNELS)
            .collect();
        Ok(Self {
            targets,
            pattern_output,
        })
    }

    pub fn targets(&self) -> &[u32] {
        &self.targets
    }

    pub fn pattern_output(&self) -> bool {
        self.pattern_output
    }

    pub fn evaluate(&self, last_event: Option<&SpikeEvent>) -> Decision {
        match last_event {
            Some(event) if self.targets.contains(&event.unit_id) => Decision::Trigger,
            _ => Decision::NoChange,
        }
    }

    /// One flag per target channel, set where the target matches `unit_id`.
    pub fn channel_flags(&self, unit_id: u32) -> [bool; PATTERN_CHANNELS] {
        let mut flags = [false; PATTERN_CHANNELS];
        for (flag, target) in flags.iter_mut().zip(&self.targets) {
            *flag = *target == unit_id;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triggers_only_on_targets() {
        let decoder = SpikeIdentity::new(&[3, 9], false).unwrap();
        assert_eq!(decoder.evaluate(Some(&SpikeEvent::new(0, 9))), Decision::Trigger);
        assert_eq!(decoder.evaluate(Some(&SpikeEvent::new(0, 4))), Decision::NoChange);
        assert_eq!(decoder.evaluate(None), Decision::NoChange);
    }

    #[test]
    fn test_truncates_to_sixteen_targets() {
        let targets: Vec<u32> = (0..17).collect();
        let decoder = SpikeIdentity::new(&targets, true).unwrap();
        assert_eq!(decoder.targets().len(), 16);
        assert_eq!(decoder.evaluate(Some(&SpikeEvent::new(0, 16))), Decision::NoChange);
        assert_eq!(decoder.evaluate(Some(&SpikeEvent::new(0, 15))), Decision::Trigger);
    }

    #[test]
    fn test_channel_flags_follow_target_order() {
        let decoder = SpikeIdentity::new(&[7, 2, 7], true).unwrap();
        let flags = decoder.channel_flags(7);
        assert!(flags[0] && !flags[1] && flags[2]);
        assert!(flags[3..].iter().all(|f| !f));
    }

    #[test]
    fn test_rejects_empty_targets() {
        assert!(SpikeIdentity::new(&[], false).is_err());
    }
}
