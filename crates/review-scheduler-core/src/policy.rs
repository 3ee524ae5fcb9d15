use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Ladder, Level, SchedulerError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Correct,
    Incorrect,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "correct" => Some(Self::Correct),
            "incorrect" => Some(Self::Incorrect),
            _ => None,
        }
    }
}

impl FromStr for Outcome {
    type Err = SchedulerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| {
            SchedulerError::InvalidOutcome(format!(
                "{value:?} is not one of \"correct\", \"incorrect\""
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Correct answer reached the threshold and moved up one level.
    Advanced,
    /// Correct answer below the threshold; streak grew, level kept.
    Held,
    /// Correct answer at the terminal level; level kept, streak reset.
    Capped,
    /// Incorrect answer moved the record down the ladder.
    Demoted,
    /// Incorrect answer at a level that demotes to itself.
    Floored,
}

impl TransitionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advanced => "advanced",
            Self::Held => "held",
            Self::Capped => "capped",
            Self::Demoted => "demoted",
            Self::Floored => "floored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "advanced" => Some(Self::Advanced),
            "held" => Some(Self::Held),
            "capped" => Some(Self::Capped),
            "demoted" => Some(Self::Demoted),
            "floored" => Some(Self::Floored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Transition {
    pub previous_level: Level,
    pub level: Level,
    pub consecutive_correct: u32,
    pub kind: TransitionKind,
}

/// Computes the next `(level, streak)` for one outcome.
///
/// Incorrect answers always count as a transition and zero the streak, even
/// when the demotion target is the current level. A correct answer that
/// meets the level threshold advances and zeroes the streak, including the
/// no-op advance at the terminal level.
#[must_use]
pub fn apply_transition(
    ladder: &Ladder,
    level: Level,
    consecutive_correct: u32,
    outcome: Outcome,
) -> Transition {
    match outcome {
        Outcome::Incorrect => {
            let next = ladder.demote(level);
            Transition {
                previous_level: level,
                level: next,
                consecutive_correct: 0,
                kind: if next == level {
                    TransitionKind::Floored
                } else {
                    TransitionKind::Demoted
                },
            }
        }
        Outcome::Correct => {
            let candidate = consecutive_correct.saturating_add(1);
            if candidate < ladder.threshold_for(level) {
                return Transition {
                    previous_level: level,
                    level,
                    consecutive_correct: candidate,
                    kind: TransitionKind::Held,
                };
            }

            let next = ladder.advance(level);
            Transition {
                previous_level: level,
                level: next,
                consecutive_correct: 0,
                kind: if next == level {
                    TransitionKind::Capped
                } else {
                    TransitionKind::Advanced
                },
            }
        }
    }
}
