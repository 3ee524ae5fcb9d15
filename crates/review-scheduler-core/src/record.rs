use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    apply_transition, ItemId, Ladder, LearnerId, Level, Outcome, PairKey, SchedulerError,
    Transition, TransitionKind,
};

/// One learner's standing on one item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressRecord {
    pub learner_id: LearnerId,
    pub item_id: ItemId,
    pub level: Level,
    /// Correct answers at the current level since it last changed.
    pub consecutive_correct: u32,
    pub correct_total: u32,
    pub incorrect_total: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_review_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reviewed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Bumped on every committed write; stores compare it before writing.
    pub revision: u64,
}

impl ProgressRecord {
    /// A freshly tracked pair at the floor, due one floor interval from `now`.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Validation`] when the due time is out of range.
    pub fn track(
        learner_id: LearnerId,
        item_id: ItemId,
        now: OffsetDateTime,
        ladder: &Ladder,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            learner_id,
            item_id,
            level: Level::FLOOR,
            consecutive_correct: 0,
            correct_total: 0,
            incorrect_total: 0,
            next_review_at: ladder.due_after(Level::FLOOR, now)?,
            last_reviewed_at: None,
            created_at: now,
            revision: 0,
        })
    }

    #[must_use]
    pub fn key(&self) -> PairKey {
        PairKey::new(self.learner_id, self.item_id)
    }

    #[must_use]
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.next_review_at <= now
    }

    /// Computes the record that results from `outcome` at `now`.
    ///
    /// The returned record carries the next revision; `self` is untouched.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Validation`] when the due time is out of range.
    pub fn apply_outcome(
        &self,
        ladder: &Ladder,
        outcome: Outcome,
        now: OffsetDateTime,
    ) -> Result<(Self, Transition), SchedulerError> {
        let transition = apply_transition(ladder, self.level, self.consecutive_correct, outcome);

        let mut next = self.clone();
        next.level = transition.level;
        next.consecutive_correct = transition.consecutive_correct;
        next.next_review_at = ladder.due_after(transition.level, now)?;
        next.last_reviewed_at = Some(now);
        match outcome {
            Outcome::Correct => next.correct_total = next.correct_total.saturating_add(1),
            Outcome::Incorrect => next.incorrect_total = next.incorrect_total.saturating_add(1),
        }
        next.revision = self.revision.saturating_add(1);

        Ok((next, transition))
    }
}

/// Append-only audit fact for one processed outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewEvent {
    pub event_id: Ulid,
    pub learner_id: LearnerId,
    pub item_id: ItemId,
    pub outcome: Outcome,
    pub previous_level: Level,
    pub new_level: Level,
    pub transition: TransitionKind,
    pub response_latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub reviewed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub next_review_at: OffsetDateTime,
}

impl ReviewEvent {
    #[must_use]
    pub fn from_transition(
        record: &ProgressRecord,
        outcome: Outcome,
        transition: &Transition,
        response_latency_ms: u64,
        reviewed_at: OffsetDateTime,
    ) -> Self {
        Self {
            event_id: Ulid::new(),
            learner_id: record.learner_id,
            item_id: record.item_id,
            outcome,
            previous_level: transition.previous_level,
            new_level: transition.level,
            transition: transition.kind,
            response_latency_ms,
            reviewed_at,
            next_review_at: record.next_review_at,
        }
    }
}
