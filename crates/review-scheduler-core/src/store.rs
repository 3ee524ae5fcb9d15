//! Persistence seams consumed by the processor.
//!
//! [`ProgressStore`] owns one mutable record per pair and must reject a
//! `put` whose `expected_revision` no longer matches. [`EventSink`] is an
//! append-only audit log the scheduler never reads back.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use time::OffsetDateTime;

use crate::{LearnerId, PairKey, ProgressRecord, ReviewEvent, SinkError, StoreError};

pub trait ProgressStore: Send + Sync {
    /// Reads the record for `key`, or `None` when the pair is not tracked.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be read.
    fn get(&self, key: PairKey) -> Result<Option<ProgressRecord>, StoreError>;

    /// Inserts a new record. Returns `false` when the pair already exists.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be written.
    fn insert(&self, record: &ProgressRecord) -> Result<bool, StoreError>;

    /// Replaces the stored record if its revision still equals `expected_revision`.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] on a revision mismatch or a missing
    /// row, and other [`StoreError`] variants on I/O failure.
    fn put(&self, record: &ProgressRecord, expected_revision: u64) -> Result<(), StoreError>;

    /// Removes the pair. Returns `false` when nothing was stored.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be written.
    fn remove(&self, key: PairKey) -> Result<bool, StoreError>;

    /// Records with `next_review_at <= now`, oldest first, ties by `item_id`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be read.
    fn due(
        &self,
        learner_id: LearnerId,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, StoreError>;

    /// Every record for the learner, ordered by `item_id`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing store cannot be read.
    fn list_for_learner(&self, learner_id: LearnerId) -> Result<Vec<ProgressRecord>, StoreError>;
}

pub trait EventSink: Send + Sync {
    /// Appends one review event.
    ///
    /// # Errors
    /// Returns [`SinkError`] when the event could not be recorded.
    fn append(&self, event: &ReviewEvent) -> Result<(), SinkError>;
}

impl<T: ProgressStore + ?Sized> ProgressStore for Arc<T> {
    fn get(&self, key: PairKey) -> Result<Option<ProgressRecord>, StoreError> {
        (**self).get(key)
    }

    fn insert(&self, record: &ProgressRecord) -> Result<bool, StoreError> {
        (**self).insert(record)
    }

    fn put(&self, record: &ProgressRecord, expected_revision: u64) -> Result<(), StoreError> {
        (**self).put(record, expected_revision)
    }

    fn remove(&self, key: PairKey) -> Result<bool, StoreError> {
        (**self).remove(key)
    }

    fn due(
        &self,
        learner_id: LearnerId,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        (**self).due(learner_id, now, limit)
    }

    fn list_for_learner(&self, learner_id: LearnerId) -> Result<Vec<ProgressRecord>, StoreError> {
        (**self).list_for_learner(learner_id)
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn append(&self, event: &ReviewEvent) -> Result<(), SinkError> {
        (**self).append(event)
    }
}

/// In-process store keyed by [`PairKey`].
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: Mutex<BTreeMap<PairKey, ProgressRecord>>,
}

impl MemoryProgressStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, BTreeMap<PairKey, ProgressRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl ProgressStore for MemoryProgressStore {
    fn get(&self, key: PairKey) -> Result<Option<ProgressRecord>, StoreError> {
        Ok(self.records()?.get(&key).cloned())
    }

    fn insert(&self, record: &ProgressRecord) -> Result<bool, StoreError> {
        let mut records = self.records()?;
        if records.contains_key(&record.key()) {
            return Ok(false);
        }
        records.insert(record.key(), record.clone());
        Ok(true)
    }

    fn put(&self, record: &ProgressRecord, expected_revision: u64) -> Result<(), StoreError> {
        let key = record.key();
        let mut records = self.records()?;
        let found = records.get(&key).map(|stored| stored.revision);
        if found != Some(expected_revision) {
            return Err(StoreError::Conflict {
                key,
                expected: expected_revision,
                found,
            });
        }
        records.insert(key, record.clone());
        Ok(())
    }

    fn remove(&self, key: PairKey) -> Result<bool, StoreError> {
        Ok(self.records()?.remove(&key).is_some())
    }

    fn due(
        &self,
        learner_id: LearnerId,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        let records = self.records()?;
        let mut due = records
            .values()
            .filter(|record| record.learner_id == learner_id && record.is_due(now))
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by_key(|record| (record.next_review_at, record.item_id));
        due.truncate(limit);
        Ok(due)
    }

    fn list_for_learner(&self, learner_id: LearnerId) -> Result<Vec<ProgressRecord>, StoreError> {
        Ok(self
            .records()?
            .values()
            .filter(|record| record.learner_id == learner_id)
            .cloned()
            .collect())
    }
}

/// In-process audit log, mainly for tests and embedding hosts without a database.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ReviewEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<ReviewEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemoryEventSink {
    fn append(&self, event: &ReviewEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .map_err(|_| SinkError("memory sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{item, learner, must, must_utc};
    use crate::{ItemId, Ladder};
    use time::Duration;

    fn tracked(item_id: ItemId, next_review_at: &str) -> ProgressRecord {
        let mut record = must(ProgressRecord::track(
            learner(),
            item_id,
            must_utc("2026-02-01T00:00:00Z"),
            &Ladder::standard(),
        ));
        record.next_review_at = must_utc(next_review_at);
        record
    }

    #[test]
    fn insert_refuses_duplicates() {
        let store = MemoryProgressStore::new();
        let record = tracked(item(1), "2026-02-02T00:00:00Z");
        assert!(must(store.insert(&record)));
        assert!(!must(store.insert(&record)));
    }

    #[test]
    fn put_requires_matching_revision() {
        let store = MemoryProgressStore::new();
        let record = tracked(item(1), "2026-02-02T00:00:00Z");
        must(store.insert(&record));

        let mut next = record.clone();
        next.revision = 1;
        must(store.put(&next, 0));

        let stale = store.put(&next, 0);
        assert!(matches!(
            stale,
            Err(StoreError::Conflict {
                expected: 0,
                found: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn put_on_missing_row_is_a_conflict() {
        let store = MemoryProgressStore::new();
        let record = tracked(item(1), "2026-02-02T00:00:00Z");
        assert!(matches!(
            store.put(&record, 0),
            Err(StoreError::Conflict { found: None, .. })
        ));
    }

    #[test]
    fn due_orders_by_time_then_item_and_honours_limit() {
        let store = MemoryProgressStore::new();
        must(store.insert(&tracked(item(3), "2026-02-02T00:00:00Z")));
        must(store.insert(&tracked(item(1), "2026-02-02T00:00:00Z")));
        must(store.insert(&tracked(item(2), "2026-02-01T06:00:00Z")));
        must(store.insert(&tracked(item(4), "2026-02-09T00:00:00Z")));

        let now = must_utc("2026-02-02T00:00:00Z");
        let due = must(store.due(learner(), now, 10));
        let items = due.iter().map(|record| record.item_id).collect::<Vec<_>>();
        assert_eq!(items, vec![item(2), item(1), item(3)]);

        let limited = must(store.due(learner(), now, 2));
        assert_eq!(limited.len(), 2);

        let none = must(store.due(learner(), now - Duration::days(2), 10));
        assert!(none.is_empty());
    }

    #[test]
    fn arc_wrapped_store_delegates() {
        let store = Arc::new(MemoryProgressStore::new());
        let record = tracked(item(1), "2026-02-02T00:00:00Z");
        assert!(must(ProgressStore::insert(&store, &record)));
        assert!(must(ProgressStore::remove(&store, record.key())));
        assert!(must(ProgressStore::get(&store, record.key())).is_none());
    }
}
