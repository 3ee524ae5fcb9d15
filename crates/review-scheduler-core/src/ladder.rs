//! The proficiency ladder.
//!
//! Levels are a closed enum whose declaration order is the ordinal. The
//! ladder stores one [`LevelRule`] per ordinal, so advance, demote, interval
//! and threshold are all array lookups and no level can be left unmapped.
//!
//! The standard table demotes to the first level of the next tier down:
//!
//! | tier          | levels                               | demote to         |
//! |---------------|--------------------------------------|-------------------|
//! | introduction  | `new`                                | `new`             |
//! | learning      | `learning_1`..`learning_3`           | `new`             |
//! | consolidating | `consolidating_1`, `consolidating_2` | `learning_1`      |
//! | long-term     | `mature`, `mastered`                 | `consolidating_1` |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::SchedulerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    #[serde(rename = "new")]
    New = 0,
    #[serde(rename = "learning_1")]
    Learning1 = 1,
    #[serde(rename = "learning_2")]
    Learning2 = 2,
    #[serde(rename = "learning_3")]
    Learning3 = 3,
    #[serde(rename = "consolidating_1")]
    Consolidating1 = 4,
    #[serde(rename = "consolidating_2")]
    Consolidating2 = 5,
    #[serde(rename = "mature")]
    Mature = 6,
    #[serde(rename = "mastered")]
    Mastered = 7,
}

impl Level {
    pub const COUNT: usize = 8;
    pub const ALL: [Self; Self::COUNT] = [
        Self::New,
        Self::Learning1,
        Self::Learning2,
        Self::Learning3,
        Self::Consolidating1,
        Self::Consolidating2,
        Self::Mature,
        Self::Mastered,
    ];
    pub const FLOOR: Self = Self::New;
    pub const TERMINAL: Self = Self::Mastered;

    #[must_use]
    pub fn ordinal(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_ordinal(ordinal: usize) -> Option<Self> {
        Self::ALL.get(ordinal).copied()
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::TERMINAL
    }

    #[must_use]
    pub fn is_floor(self) -> bool {
        self == Self::FLOOR
    }

    #[must_use]
    pub fn tier(self) -> Tier {
        match self {
            Self::New => Tier::Introduction,
            Self::Learning1 | Self::Learning2 | Self::Learning3 => Tier::Learning,
            Self::Consolidating1 | Self::Consolidating2 => Tier::Consolidating,
            Self::Mature | Self::Mastered => Tier::LongTerm,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Learning1 => "learning_1",
            Self::Learning2 => "learning_2",
            Self::Learning3 => "learning_3",
            Self::Consolidating1 => "consolidating_1",
            Self::Consolidating2 => "consolidating_2",
            Self::Mature => "mature",
            Self::Mastered => "mastered",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Introduction,
    Learning,
    Consolidating,
    LongTerm,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Introduction => "introduction",
            Self::Learning => "learning",
            Self::Consolidating => "consolidating",
            Self::LongTerm => "long_term",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LevelRule {
    pub level: Level,
    pub interval_seconds: i64,
    /// Consecutive correct answers at this level needed to advance.
    pub advance_threshold: u32,
    pub demote_to: Level,
}

/// Serializable ladder configuration, validated into a [`Ladder`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LadderConfig {
    pub ladder_version: u32,
    pub levels: Vec<LevelRule>,
}

const HOUR: i64 = 3_600;
const DAY: i64 = 24 * HOUR;

/// Longest interval a ladder may configure (100 years).
pub const MAX_INTERVAL_SECONDS: i64 = 100 * 365 * DAY;

fn standard_rules() -> [LevelRule; Level::COUNT] {
    let rule = |level, interval_seconds, demote_to| LevelRule {
        level,
        interval_seconds,
        advance_threshold: 1,
        demote_to,
    };

    [
        rule(Level::New, 4 * HOUR, Level::New),
        rule(Level::Learning1, 8 * HOUR, Level::New),
        rule(Level::Learning2, DAY, Level::New),
        rule(Level::Learning3, 2 * DAY, Level::New),
        rule(Level::Consolidating1, 7 * DAY, Level::Learning1),
        rule(Level::Consolidating2, 14 * DAY, Level::Learning1),
        rule(Level::Mature, 30 * DAY, Level::Consolidating1),
        rule(Level::Mastered, 120 * DAY, Level::Consolidating1),
    ]
}

impl LadderConfig {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            ladder_version: 1,
            levels: standard_rules().to_vec(),
        }
    }

    /// Validates coverage, ordering and bounds of every level rule.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Configuration`] when a rule is missing,
    /// out of ordinal order, or carries an out-of-range value. Only the floor
    /// may demote to itself, so `Floored` always means the floor.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.ladder_version == 0 {
            return Err(SchedulerError::Configuration(
                "ladder_version MUST be >= 1".to_string(),
            ));
        }

        if self.levels.len() != Level::COUNT {
            return Err(SchedulerError::Configuration(format!(
                "ladder MUST define exactly {} levels, found {}",
                Level::COUNT,
                self.levels.len()
            )));
        }

        let mut previous_interval = 0_i64;
        for (ordinal, rule) in self.levels.iter().enumerate() {
            if rule.level.ordinal() != ordinal {
                return Err(SchedulerError::Configuration(format!(
                    "level at position {ordinal} MUST be {}, found {}",
                    Level::ALL[ordinal].as_str(),
                    rule.level.as_str()
                )));
            }

            if rule.interval_seconds <= 0 {
                return Err(SchedulerError::Configuration(format!(
                    "{}: interval_seconds MUST be > 0",
                    rule.level.as_str()
                )));
            }

            if rule.interval_seconds > MAX_INTERVAL_SECONDS {
                return Err(SchedulerError::Configuration(format!(
                    "{}: interval_seconds MUST be <= {MAX_INTERVAL_SECONDS}",
                    rule.level.as_str()
                )));
            }

            if rule.interval_seconds < previous_interval {
                return Err(SchedulerError::Configuration(format!(
                    "{}: interval_seconds MUST NOT be shorter than the level below",
                    rule.level.as_str()
                )));
            }
            previous_interval = rule.interval_seconds;

            if rule.advance_threshold == 0 {
                return Err(SchedulerError::Configuration(format!(
                    "{}: advance_threshold MUST be >= 1",
                    rule.level.as_str()
                )));
            }

            if rule.demote_to > rule.level {
                return Err(SchedulerError::Configuration(format!(
                    "{}: demote_to {} is above the level itself",
                    rule.level.as_str(),
                    rule.demote_to.as_str()
                )));
            }

            if rule.demote_to == rule.level && !rule.level.is_floor() {
                return Err(SchedulerError::Configuration(format!(
                    "{}: only the floor may demote to itself",
                    rule.level.as_str()
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a ladder from JSON.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Configuration`] when decoding fails or the
    /// decoded table violates ladder constraints.
    pub fn from_json(value: &Value) -> Result<Self, SchedulerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SchedulerError::Configuration(format!("invalid ladder JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Validated, immutable level table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ladder {
    version: u32,
    rules: [LevelRule; Level::COUNT],
}

impl Default for Ladder {
    fn default() -> Self {
        Self::standard()
    }
}

impl Ladder {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            version: 1,
            rules: standard_rules(),
        }
    }

    /// Builds a ladder from a configuration table.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Configuration`] when the table is invalid.
    pub fn from_config(config: &LadderConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let mut rules = standard_rules();
        for (slot, rule) in rules.iter_mut().zip(&config.levels) {
            *slot = *rule;
        }

        Ok(Self {
            version: config.ladder_version,
            rules,
        })
    }

    #[must_use]
    pub fn to_config(&self) -> LadderConfig {
        LadderConfig {
            ladder_version: self.version,
            levels: self.rules.to_vec(),
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn rule(&self, level: Level) -> &LevelRule {
        &self.rules[level.ordinal()]
    }

    #[must_use]
    pub fn rules(&self) -> &[LevelRule] {
        &self.rules
    }

    /// Next level up; the terminal level advances to itself.
    #[must_use]
    pub fn advance(&self, level: Level) -> Level {
        Level::from_ordinal(level.ordinal() + 1).unwrap_or(level)
    }

    #[must_use]
    pub fn demote(&self, level: Level) -> Level {
        self.rule(level).demote_to
    }

    #[must_use]
    pub fn interval_for(&self, level: Level) -> Duration {
        Duration::seconds(self.rule(level).interval_seconds)
    }

    #[must_use]
    pub fn threshold_for(&self, level: Level) -> u32 {
        self.rule(level).advance_threshold
    }

    /// When a record sitting at `level` next comes due after a review at `now`.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Validation`] when the due time falls outside
    /// the representable date range.
    pub fn due_after(
        &self,
        level: Level,
        now: OffsetDateTime,
    ) -> Result<OffsetDateTime, SchedulerError> {
        now.checked_add(self.interval_for(level)).ok_or_else(|| {
            SchedulerError::Validation(format!(
                "next review for {} after {now} is out of range",
                level.as_str()
            ))
        })
    }
}
