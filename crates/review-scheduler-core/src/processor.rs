//! Review orchestration: lock, read, transition, write, audit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

use crate::{
    EventSink, ItemId, KeyLocks, Ladder, LearnerId, Level, Outcome, PairKey, ProgressRecord,
    ProgressStore, ReviewEvent, SchedulerError, TransitionKind,
};

/// What happens when the audit append fails after the record was committed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuditPolicy {
    /// Log a warning, count it, and return the committed record.
    #[default]
    BestEffort,
    /// Return [`SchedulerError::AuditFailed`] carrying the committed record.
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Upper bound on waiting for another in-flight review of the same pair.
    pub lock_timeout: Duration,
    pub audit_policy: AuditPolicy,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5_000),
            audit_policy: AuditPolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewSubmission {
    pub learner_id: LearnerId,
    pub item_id: ItemId,
    pub outcome: Outcome,
    pub response_latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
}

impl ReviewSubmission {
    #[must_use]
    pub fn key(&self) -> PairKey {
        PairKey::new(self.learner_id, self.item_id)
    }

    /// # Errors
    /// Returns [`SchedulerError::Validation`] when `now` is not UTC.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.now.offset() != UtcOffset::UTC {
            return Err(SchedulerError::Validation(
                "now MUST be UTC (offset Z)".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub struct ProcessorStats {
    submits_total: AtomicU64,
    submits_failed_total: AtomicU64,
    advanced_total: AtomicU64,
    demoted_total: AtomicU64,
    sink_failures_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[allow(clippy::struct_field_names)]
pub struct ProcessorStatsSnapshot {
    pub submits_total: u64,
    pub submits_failed_total: u64,
    pub advanced_total: u64,
    pub demoted_total: u64,
    pub sink_failures_total: u64,
}

impl ProcessorStats {
    #[must_use]
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            submits_total: self.submits_total.load(Ordering::Relaxed),
            submits_failed_total: self.submits_failed_total.load(Ordering::Relaxed),
            advanced_total: self.advanced_total.load(Ordering::Relaxed),
            demoted_total: self.demoted_total.load(Ordering::Relaxed),
            sink_failures_total: self.sink_failures_total.load(Ordering::Relaxed),
        }
    }

    fn record_transition(&self, kind: TransitionKind) {
        match kind {
            TransitionKind::Advanced => {
                self.advanced_total.fetch_add(1, Ordering::Relaxed);
            }
            TransitionKind::Demoted => {
                self.demoted_total.fetch_add(1, Ordering::Relaxed);
            }
            TransitionKind::Held | TransitionKind::Capped | TransitionKind::Floored => {}
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewBranch {
    pub level: Level,
    pub transition: TransitionKind,
    pub consecutive_correct: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_review_at: OffsetDateTime,
}

/// What each outcome would do to a record if submitted at `as_of`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomePreview {
    pub learner_id: LearnerId,
    pub item_id: ItemId,
    pub current_level: Level,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub on_correct: PreviewBranch,
    pub on_incorrect: PreviewBranch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelCount {
    pub level: Level,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearnerSummary {
    pub learner_id: LearnerId,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub tracked: usize,
    pub due_now: usize,
    pub levels: Vec<LevelCount>,
    /// Earliest review still in the future, if any.
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_upcoming_at: Option<OffsetDateTime>,
}

pub struct ReviewProcessor<S, E> {
    ladder: Ladder,
    store: S,
    sink: E,
    locks: KeyLocks,
    options: ProcessorOptions,
    stats: ProcessorStats,
}

impl<S, E> ReviewProcessor<S, E>
where
    S: ProgressStore,
    E: EventSink,
{
    pub fn new(ladder: Ladder, store: S, sink: E) -> Self {
        Self::with_options(ladder, store, sink, ProcessorOptions::default())
    }

    pub fn with_options(ladder: Ladder, store: S, sink: E, options: ProcessorOptions) -> Self {
        Self {
            ladder,
            store,
            sink,
            locks: KeyLocks::new(),
            options,
            stats: ProcessorStats::default(),
        }
    }

    pub fn ladder(&self) -> &Ladder {
        &self.ladder
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn options(&self) -> ProcessorOptions {
        self.options
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Starts tracking a pair at the floor level.
    ///
    /// # Errors
    /// Returns [`SchedulerError::AlreadyTracked`] if a record exists,
    /// [`SchedulerError::Validation`] if the first due time is out of range,
    /// or a store error if the insert fails.
    pub fn track(
        &self,
        learner_id: LearnerId,
        item_id: ItemId,
        now: OffsetDateTime,
    ) -> Result<ProgressRecord, SchedulerError> {
        let key = PairKey::new(learner_id, item_id);
        let _guard = self.locks.acquire(key, self.options.lock_timeout)?;

        let record = ProgressRecord::track(learner_id, item_id, now, &self.ladder)?;
        if !self.store.insert(&record)? {
            return Err(SchedulerError::AlreadyTracked { key });
        }

        debug!(%key, next_review_at = %record.next_review_at, "tracked item");
        Ok(record)
    }

    /// Stops tracking a pair. Returns `false` when it was not tracked.
    ///
    /// # Errors
    /// Returns a store error if the removal fails.
    pub fn untrack(&self, learner_id: LearnerId, item_id: ItemId) -> Result<bool, SchedulerError> {
        let key = PairKey::new(learner_id, item_id);
        let _guard = self.locks.acquire(key, self.options.lock_timeout)?;
        Ok(self.store.remove(key)?)
    }

    /// Reads the current record for a pair.
    ///
    /// # Errors
    /// Returns [`SchedulerError::NotFound`] when the pair is not tracked.
    pub fn progress(
        &self,
        learner_id: LearnerId,
        item_id: ItemId,
    ) -> Result<ProgressRecord, SchedulerError> {
        let key = PairKey::new(learner_id, item_id);
        self.store
            .get(key)?
            .ok_or(SchedulerError::NotFound { key })
    }

    /// Applies one review outcome and persists the result.
    ///
    /// Submissions for the same pair are serialized; other pairs proceed in
    /// parallel. The record write is the commit point: a failure before it
    /// leaves the stored record untouched, and an audit failure after it
    /// is handled per [`AuditPolicy`].
    ///
    /// # Errors
    /// Returns [`SchedulerError::NotFound`] for untracked pairs,
    /// [`SchedulerError::Validation`] when the next due time is out of range,
    /// [`SchedulerError::Store`] when the lock wait, read or write fails, and
    /// [`SchedulerError::AuditFailed`] only under [`AuditPolicy::Required`].
    pub fn submit(&self, submission: &ReviewSubmission) -> Result<ProgressRecord, SchedulerError> {
        self.stats.submits_total.fetch_add(1, Ordering::Relaxed);
        let result = self.submit_locked(submission);
        if result.is_err() {
            self.stats
                .submits_failed_total
                .fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn submit_locked(&self, submission: &ReviewSubmission) -> Result<ProgressRecord, SchedulerError> {
        submission.validate()?;
        let key = submission.key();

        let _guard = self
            .locks
            .acquire(key, self.options.lock_timeout)
            .inspect_err(|err| warn!(%key, error = %err, "review lock wait failed"))?;

        let current = self
            .store
            .get(key)?
            .ok_or(SchedulerError::NotFound { key })?;

        let (next, transition) =
            current.apply_outcome(&self.ladder, submission.outcome, submission.now)?;
        self.store.put(&next, current.revision)?;

        self.stats.record_transition(transition.kind);
        debug!(
            %key,
            outcome = submission.outcome.as_str(),
            from = transition.previous_level.as_str(),
            to = transition.level.as_str(),
            transition = transition.kind.as_str(),
            next_review_at = %next.next_review_at,
            "review processed"
        );

        let event = ReviewEvent::from_transition(
            &next,
            submission.outcome,
            &transition,
            submission.response_latency_ms,
            submission.now,
        );
        if let Err(err) = self.sink.append(&event) {
            self.stats
                .sink_failures_total
                .fetch_add(1, Ordering::Relaxed);
            match self.options.audit_policy {
                AuditPolicy::BestEffort => {
                    warn!(%key, event_id = %event.event_id, error = %err, "review event dropped");
                }
                AuditPolicy::Required => {
                    return Err(SchedulerError::AuditFailed {
                        record: Box::new(next),
                        source: err,
                    });
                }
            }
        }

        Ok(next)
    }

    /// Shows where each outcome would take the record, without writing.
    ///
    /// # Errors
    /// Returns [`SchedulerError::NotFound`] for untracked pairs and
    /// [`SchedulerError::Validation`] when a due time is out of range.
    pub fn preview(
        &self,
        learner_id: LearnerId,
        item_id: ItemId,
        as_of: OffsetDateTime,
    ) -> Result<OutcomePreview, SchedulerError> {
        let current = self.progress(learner_id, item_id)?;
        let branch = |outcome| {
            let (next, transition) = current.apply_outcome(&self.ladder, outcome, as_of)?;
            Ok::<_, SchedulerError>(PreviewBranch {
                level: next.level,
                transition: transition.kind,
                consecutive_correct: next.consecutive_correct,
                next_review_at: next.next_review_at,
            })
        };

        Ok(OutcomePreview {
            learner_id,
            item_id,
            current_level: current.level,
            as_of,
            on_correct: branch(Outcome::Correct)?,
            on_incorrect: branch(Outcome::Incorrect)?,
        })
    }

    /// Records due at `now`, most overdue first, at most `limit` of them.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Validation`] when `limit` is zero and a
    /// store error when the read fails.
    pub fn due_items(
        &self,
        learner_id: LearnerId,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, SchedulerError> {
        if limit == 0 {
            return Err(SchedulerError::Validation(
                "limit MUST be >= 1".to_string(),
            ));
        }

        let mut due = self.store.due(learner_id, now, limit)?;
        due.retain(|record| record.learner_id == learner_id && record.is_due(now));
        due.sort_by_key(|record| (record.next_review_at, record.item_id));
        due.truncate(limit);
        Ok(due)
    }

    /// Counts per level plus due and upcoming totals for one learner.
    ///
    /// # Errors
    /// Returns a store error when the read fails.
    pub fn summary(
        &self,
        learner_id: LearnerId,
        as_of: OffsetDateTime,
    ) -> Result<LearnerSummary, SchedulerError> {
        let records = self.store.list_for_learner(learner_id)?;

        let mut counts = [0_usize; Level::COUNT];
        for record in &records {
            counts[record.level.ordinal()] += 1;
        }

        Ok(LearnerSummary {
            learner_id,
            as_of,
            tracked: records.len(),
            due_now: records.iter().filter(|record| record.is_due(as_of)).count(),
            levels: Level::ALL
                .into_iter()
                .zip(counts)
                .map(|(level, count)| LevelCount { level, count })
                .collect(),
            next_upcoming_at: records
                .iter()
                .filter(|record| !record.is_due(as_of))
                .map(|record| record.next_review_at)
                .min(),
        })
    }
}
