use crate::processing::decoders::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
    Idle,
    /// Holding since the tick of the trigger that started the episode.
    Holding { since: u64 },
}

/// Actuator command requested by the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchCommand {
    Activate,
    Deactivate,
}

/// Turns per-iteration decisions into at most one activate per episode and
/// keeps the actuator on for at least `hold_ticks` after it fired.
#[derive(Debug, Clone)]
pub struct Latch {
    hold_ticks: u64,
    state: LatchState,
}

impl Latch {
    pub fn new(hold_ticks: u64) -> Self {
        Self {
            hold_ticks,
            state: LatchState::Idle,
        }
    }

    pub fn hold_ticks(&self) -> u64 {
        self.hold_ticks
    }

    pub fn state(&self) -> LatchState {
        self.state
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.state, LatchState::Holding { .. })
    }

    /// Ticks left before the current hold may end.
    pub fn remaining(&self, now: u64) -> u64 {
        match self.state {
            LatchState::Idle => 0,
            LatchState::Holding { since } => {
                self.hold_ticks.saturating_sub(now.saturating_sub(since))
            }
        }
    }

    /// Once the hold has elapsed, anything but a fresh `Trigger` ends the
    /// episode. An identity decoder that only ever abstains therefore releases
    /// on timeout.
    pub fn step(&mut self, decision: Decision, now: u64) -> Option<LatchCommand> {
        match self.state {
            LatchState::Idle => match decision {
                Decision::Trigger => {
                    self.state = LatchState::Holding { since: now };
                    Some(LatchCommand::Activate)
                }
                _ => None,
            },
            LatchState::Holding { since } => {
                let elapsed = now.saturating_sub(since);
                if elapsed >= self.hold_ticks && decision != Decision::Trigger {
                    self.state = LatchState::Idle;
                    Some(LatchCommand::Deactivate)
                } else {
                    None
                }
            }
        }
    }

    /// Ends any episode immediately, ignoring the hold.
    pub fn force_release(&mut self) -> Option<LatchCommand> {
        match self.state {
            LatchState::Idle => None,
            LatchState::Holding { .. } => {
                self.state = LatchState::Idle;
                Some(LatchCommand::Deactivate)
            }
        }
    }
}
