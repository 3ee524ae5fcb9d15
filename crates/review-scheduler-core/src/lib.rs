//! Spaced-repetition review scheduling on a fixed level ladder.
//!
//! The crate is split along the flow of a single review:
//! - [`ladder`] holds the immutable level table (interval, threshold, demotion).
//! - [`policy`] maps `(level, streak, outcome)` to the next level and streak.
//! - [`record`] defines the per-pair [`ProgressRecord`] and the [`ReviewEvent`] fact.
//! - [`store`] declares the persistence seams ([`ProgressStore`], [`EventSink`]).
//! - [`processor`] orchestrates read, transition, write and audit append.
//!
//! Nothing here performs I/O beyond the store traits; hosts plug in a
//! concrete store such as the SQLite one.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod error;
pub mod ladder;
pub mod locks;
pub mod policy;
pub mod processor;
pub mod record;
pub mod store;

pub use error::{SchedulerError, SinkError, StoreError};
pub use ladder::{Ladder, LadderConfig, Level, LevelRule, Tier};
pub use locks::{KeyGuard, KeyLocks};
pub use policy::{apply_transition, Outcome, Transition, TransitionKind};
pub use processor::{
    AuditPolicy, LearnerSummary, LevelCount, OutcomePreview, PreviewBranch, ProcessorOptions,
    ProcessorStats, ProcessorStatsSnapshot, ReviewProcessor, ReviewSubmission,
};
pub use record::{ProgressRecord, ReviewEvent};
pub use store::{EventSink, MemoryEventSink, MemoryProgressStore, ProgressStore};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct LearnerId(pub Ulid);

impl LearnerId {
    /// Parses a learner id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, SchedulerError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| SchedulerError::Validation(format!("invalid learner_id {raw}: {err}")))
    }
}

impl Display for LearnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ItemId(pub Ulid);

impl ItemId {
    /// Parses an item id from its ULID text form.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Validation`] when `raw` is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, SchedulerError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| SchedulerError::Validation(format!("invalid item_id {raw}: {err}")))
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one progress record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PairKey {
    pub learner_id: LearnerId,
    pub item_id: ItemId,
}

impl PairKey {
    #[must_use]
    pub fn new(learner_id: LearnerId, item_id: ItemId) -> Self {
        Self {
            learner_id,
            item_id,
        }
    }
}

impl Display for PairKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.learner_id, self.item_id)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SchedulerError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SchedulerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SchedulerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SchedulerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SchedulerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SchedulerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SchedulerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn rejects_non_utc_timestamps() {
        let err = parse_rfc3339_utc("2026-02-07T12:00:00+02:00");
        assert!(matches!(err, Err(SchedulerError::Validation(_))));
    }

    #[test]
    fn formats_round_trip_through_utc() {
        let value = must_utc("2026-02-07T12:00:00Z");
        assert_eq!(must(format_rfc3339(value)), "2026-02-07T12:00:00Z");
    }

    #[test]
    fn pair_key_orders_by_learner_then_item() {
        let a = PairKey::new(learner(), item(1));
        let b = PairKey::new(learner(), item(2));
        assert!(a < b);
        assert_eq!(a.to_string(), format!("{}:{}", learner(), item(1)));
    }

    #[test]
    fn ids_reject_garbage() {
        assert!(LearnerId::parse("not-a-ulid").is_err());
        assert!(ItemId::parse("").is_err());
    }
}
