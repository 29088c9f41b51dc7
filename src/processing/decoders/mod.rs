pub mod fr_threshold;
pub mod spike_identity;

use super::binner::Binner;
use crate::config::{BinnerConfig, DecoderConfig};
use crate::error::ConfigError;
use crate::local::SpikeEvent;

pub use fr_threshold::FrThreshold;
pub use spike_identity::SpikeIdentity;

/// Instantaneous vote of a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Trigger,
    Release,
    NoChange,
}

impl Decision {
    /// Logical OR across decoders: any trigger wins, then any release.
    pub fn combine<I: IntoIterator<Item = Decision>>(votes: I) -> Decision {
        let mut combined = Decision::NoChange;
        for vote in votes {
            match vote {
                Decision::Trigger => return Decision::Trigger,
                Decision::Release => combined = Decision::Release,
                Decision::NoChange => {}
            }
        }
        combined
    }
}

// DECODER COMPONENT ----------------------------------------------------------

pub enum Decoder {
    FrThreshold(FrThreshold),
    SpikeIdentity(SpikeIdentity),
}

impl Decoder {
    pub fn from_config(config: &DecoderConfig, binner: &BinnerConfig) -> Result<Self, ConfigError> {
        match config {
            DecoderConfig::FrThreshold {
                unit_id,
                threshold,
                hysteresis,
                release_below,
            } => {
                if *unit_id as usize >= binner.num_units {
                    return Err(ConfigError::UnknownUnit {
                        unit_id: *unit_id,
                        num_units: binner.num_units,
                    });
                }
                let count = threshold.resolve(binner.bin_size_s, binner.num_bins)?;
                let decoder = FrThreshold::new(*unit_id, count, *hysteresis, *release_below)?;
                Ok(Decoder::FrThreshold(decoder))
            }
            DecoderConfig::SpikeIdentity {
                target_unit_ids,
                pattern_output,
            } => {
                let decoder = SpikeIdentity::new(target_unit_ids, *pattern_output)?;
                Ok(Decoder::SpikeIdentity(decoder))
            }
        }
    }

    /// Whether the decoder reads the binned window rather than raw events.
    pub fn uses_bins(&self) -> bool {
        matches!(self, Decoder::FrThreshold(_))
    }

    pub fn evaluate(&mut self, binner: Option<&Binner>, last_event: Option<&SpikeEvent>) -> Decision {
        match self {
            Decoder::FrThreshold(decoder) => match binner {
                Some(binner) => decoder.evaluate(binner),
                None => Decision::NoChange,
            },
            Decoder::SpikeIdentity(decoder) => decoder.evaluate(last_event),
        }
    }

    /// Channel mask to send instead of a plain activate, if this decoder drives patterns.
    pub fn pattern(&self, last_event: Option<&SpikeEvent>) -> Option<[bool; 16]> {
        match self {
            Decoder::SpikeIdentity(decoder) if decoder.pattern_output() => {
                last_event.map(|event| decoder.channel_flags(event.unit_id))
            }
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Decoder::FrThreshold(d) => format!(
                "fr_threshold(unit {}, >= {} spikes, hysteresis {})",
                d.unit_id(),
                d.threshold(),
                d.hysteresis()
            ),
            Decoder::SpikeIdentity(d) => format!("spike_identity({:?})", d.targets()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Threshold;

    #[test]
    fn test_combine_is_logical_or() {
        use super::Decision::*;
        assert_eq!(Decision::combine([Release, Trigger]), Trigger);
        assert_eq!(Decision::combine([NoChange, Trigger]), Trigger);
        assert_eq!(Decision::combine([NoChange, Release]), Release);
        assert_eq!(Decision::combine([NoChange, NoChange]), NoChange);
        assert_eq!(Decision::combine(Vec::<Decision>::new()), NoChange);
    }

    #[test]
    fn test_from_config_builds_each_variant() {
        let binner = BinnerConfig {
            bin_size_s: 0.1,
            num_bins: 10,
            num_units: 8,
        };
        let rate = DecoderConfig::FrThreshold {
            unit_id: 2,
            threshold: Threshold::RateHz { value: 5.0 },
            hysteresis: true,
            release_below: None,
        };
        match Decoder::from_config(&rate, &binner).unwrap() {
            Decoder::FrThreshold(d) => assert_eq!(d.threshold(), 5),
            _ => panic!("expected a firing-rate decoder"),
        }

        let identity = DecoderConfig::SpikeIdentity {
            target_unit_ids: vec![4, 5],
            pattern_output: true,
        };
        let decoder = Decoder::from_config(&identity, &binner).unwrap();
        assert!(!decoder.uses_bins());
        let flags = decoder.pattern(Some(&SpikeEvent::new(0, 5))).unwrap();
        assert!(!flags[0] && flags[1]);

        let unknown = DecoderConfig::FrThreshold {
            unit_id: 8,
            threshold: Threshold::Count { value: 1 },
            hysteresis: false,
            release_below: None,
        };
        assert!(Decoder::from_config(&unknown, &binner).is_err());
    }

    #[test]
    fn test_rate_decoder_without_bins_abstains() {
        let mut decoder = Decoder::FrThreshold(FrThreshold::new(0, 1, false, None).unwrap());
        assert_eq!(decoder.evaluate(None, None), Decision::NoChange);
    }
}
