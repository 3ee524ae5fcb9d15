#![allow(clippy::missing_errors_doc)]

//! SQLite persistence for progress records and the review event log.
//!
//! One [`SqliteReviewStore`] implements both [`ProgressStore`] and
//! [`EventSink`]. Records are compare-and-swapped on `revision` inside an
//! immediate transaction; `review_events` rejects updates and deletes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use review_scheduler_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, EventSink, ItemId, LearnerId, Level, Outcome,
    PairKey, ProgressRecord, ProgressStore, ReviewEvent, SinkError, StoreError, TransitionKind,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const STORE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_REVIEW_V1: &str = r"
CREATE TABLE IF NOT EXISTS progress_records (
  learner_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  level TEXT NOT NULL CHECK (
    level IN (
      'new',
      'learning_1',
      'learning_2',
      'learning_3',
      'consolidating_1',
      'consolidating_2',
      'mature',
      'mastered'
    )
  ),
  consecutive_correct INTEGER NOT NULL CHECK (consecutive_correct >= 0),
  correct_total INTEGER NOT NULL CHECK (correct_total >= 0),
  incorrect_total INTEGER NOT NULL CHECK (incorrect_total >= 0),
  next_review_at TEXT NOT NULL,
  next_review_at_ns INTEGER NOT NULL,
  last_reviewed_at TEXT,
  created_at TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 0),
  PRIMARY KEY (learner_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_progress_records_due
  ON progress_records(learner_id, next_review_at_ns, item_id);

CREATE TABLE IF NOT EXISTS review_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  learner_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('correct', 'incorrect')),
  previous_level TEXT NOT NULL,
  new_level TEXT NOT NULL,
  transition TEXT NOT NULL CHECK (
    transition IN ('advanced', 'held', 'capped', 'demoted', 'floored')
  ),
  response_latency_ms INTEGER NOT NULL CHECK (response_latency_ms >= 0),
  reviewed_at TEXT NOT NULL,
  next_review_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_review_events_no_update
BEFORE UPDATE ON review_events
BEGIN
  SELECT RAISE(FAIL, 'review_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_review_events_no_delete
BEFORE DELETE ON review_events
BEGIN
  SELECT RAISE(FAIL, 'review_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_review_events_pair_seq
  ON review_events(learner_id, item_id, event_seq);
";

const RECORD_COLUMNS: &str = "learner_id, item_id, level, consecutive_correct, correct_total,
     incorrect_total, next_review_at, last_reviewed_at, created_at, revision";

const EVENT_COLUMNS: &str = "event_id, learner_id, item_id, outcome, previous_level, new_level,
     transition, response_latency_ms, reviewed_at, next_review_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteStoreOptions {
    /// How long a writer waits on another connection's lock before failing.
    pub busy_timeout: Duration,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

pub struct SqliteReviewStore {
    conn: Mutex<Connection>,
}

impl SqliteReviewStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, SqliteStoreOptions::default())
    }

    pub fn open_with_options(path: &Path, options: SqliteStoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            options.busy_timeout.as_millis()
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates or verifies the schema. Safe to run on every start.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        if table_exists(&conn, "progress_records")? {
            ensure_table_has_columns(
                &conn,
                "progress_records",
                &["learner_id", "item_id", "level", "next_review_at_ns", "revision"],
            )?;
        }
        conn.execute_batch(SCHEMA_REVIEW_V1)
            .context("failed to apply review schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let registered = conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_MIGRATION_VERSION, now],
            )
            .context("failed to register review schema migration")?;

        info!(
            version = STORE_MIGRATION_VERSION,
            applied = registered > 0,
            "review store schema ready"
        );
        Ok(())
    }

    /// Events for one pair in append order, oldest first.
    pub fn list_events(&self, key: PairKey, limit: Option<usize>) -> Result<Vec<ReviewEvent>> {
        let mut query = format!(
            "SELECT {EVENT_COLUMNS}
             FROM review_events
             WHERE learner_id = ?1 AND item_id = ?2
             ORDER BY event_seq ASC"
        );
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![key.learner_id.to_string(), key.item_id.to_string()],
            parse_event_row,
        )?;
        collect_rows(rows)
    }

    /// Events for every item of one learner in append order.
    pub fn list_learner_events(
        &self,
        learner_id: LearnerId,
        limit: Option<usize>,
    ) -> Result<Vec<ReviewEvent>> {
        let mut query = format!(
            "SELECT {EVENT_COLUMNS}
             FROM review_events
             WHERE learner_id = ?1
             ORDER BY event_seq ASC"
        );
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![learner_id.to_string()], parse_event_row)?;
        collect_rows(rows)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.lock() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        }
    }
}

impl ProgressStore for SqliteReviewStore {
    fn get(&self, key: PairKey) -> Result<Option<ProgressRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS}
                 FROM progress_records
                 WHERE learner_id = ?1 AND item_id = ?2"
            ),
            params![key.learner_id.to_string(), key.item_id.to_string()],
            parse_record_row,
        )
        .optional()
        .map_err(store_error)
    }

    fn insert(&self, record: &ProgressRecord) -> Result<bool, StoreError> {
        let columns = RecordColumns::from_record(record)?;
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT INTO progress_records(
                    learner_id, item_id, level, consecutive_correct, correct_total,
                    incorrect_total, next_review_at, next_review_at_ns, last_reviewed_at,
                    created_at, revision
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(learner_id, item_id) DO NOTHING",
                params![
                    columns.learner_id,
                    columns.item_id,
                    columns.level,
                    columns.consecutive_correct,
                    columns.correct_total,
                    columns.incorrect_total,
                    columns.next_review_at,
                    columns.next_review_at_ns,
                    columns.last_reviewed_at,
                    columns.created_at,
                    columns.revision,
                ],
            )
            .map_err(store_error)?;
        Ok(inserted == 1)
    }

    fn put(&self, record: &ProgressRecord, expected_revision: u64) -> Result<(), StoreError> {
        let key = record.key();
        let columns = RecordColumns::from_record(record)?;
        let expected = sql_i64(expected_revision, "expected revision")?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;

        let updated = tx
            .execute(
                "UPDATE progress_records
                 SET level = ?3,
                     consecutive_correct = ?4,
                     correct_total = ?5,
                     incorrect_total = ?6,
                     next_review_at = ?7,
                     next_review_at_ns = ?8,
                     last_reviewed_at = ?9,
                     revision = ?10
                 WHERE learner_id = ?1 AND item_id = ?2 AND revision = ?11",
                params![
                    columns.learner_id,
                    columns.item_id,
                    columns.level,
                    columns.consecutive_correct,
                    columns.correct_total,
                    columns.incorrect_total,
                    columns.next_review_at,
                    columns.next_review_at_ns,
                    columns.last_reviewed_at,
                    columns.revision,
                    expected,
                ],
            )
            .map_err(store_error)?;

        if updated == 0 {
            let found = tx
                .query_row(
                    "SELECT revision FROM progress_records WHERE learner_id = ?1 AND item_id = ?2",
                    params![columns.learner_id, columns.item_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(store_error)?;
            return Err(StoreError::Conflict {
                key,
                expected: expected_revision,
                found: found.and_then(|raw| u64::try_from(raw).ok()),
            });
        }

        tx.commit()
            .map_err(|err| StoreError::Ambiguous(format!("commit failed for {key}: {err}")))?;
        debug!(%key, revision = record.revision, "progress record written");
        Ok(())
    }

    fn remove(&self, key: PairKey) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM progress_records WHERE learner_id = ?1 AND item_id = ?2",
                params![key.learner_id.to_string(), key.item_id.to_string()],
            )
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    fn due(
        &self,
        learner_id: LearnerId,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<ProgressRecord>, StoreError> {
        let now_ns = timestamp_ns(now)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS}
                 FROM progress_records
                 WHERE learner_id = ?1 AND next_review_at_ns <= ?2
                 ORDER BY next_review_at_ns ASC, item_id ASC
                 LIMIT ?3"
            ))
            .map_err(store_error)?;
        let rows = stmt
            .query_map(
                params![learner_id.to_string(), now_ns, limit],
                parse_record_row,
            )
            .map_err(store_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_error)
    }

    fn list_for_learner(&self, learner_id: LearnerId) -> Result<Vec<ProgressRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS}
                 FROM progress_records
                 WHERE learner_id = ?1
                 ORDER BY item_id ASC"
            ))
            .map_err(store_error)?;
        let rows = stmt
            .query_map(params![learner_id.to_string()], parse_record_row)
            .map_err(store_error)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_error)
    }
}

impl EventSink for SqliteReviewStore {
    fn append(&self, event: &ReviewEvent) -> Result<(), SinkError> {
        let sink_error = |err: StoreError| SinkError(err.to_string());
        let reviewed_at = rfc3339(event.reviewed_at).map_err(sink_error)?;
        let next_review_at = rfc3339(event.next_review_at).map_err(sink_error)?;
        let latency = sql_i64(event.response_latency_ms, "response_latency_ms").map_err(sink_error)?;

        let conn = self.lock().map_err(sink_error)?;
        conn.execute(
            "INSERT INTO review_events(
                event_id, learner_id, item_id, outcome, previous_level, new_level,
                transition, response_latency_ms, reviewed_at, next_review_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.event_id.to_string(),
                event.learner_id.to_string(),
                event.item_id.to_string(),
                event.outcome.as_str(),
                event.previous_level.as_str(),
                event.new_level.as_str(),
                event.transition.as_str(),
                latency,
                reviewed_at,
                next_review_at,
            ],
        )
        .map_err(|err| SinkError(format!("failed to append review event: {err}")))?;
        Ok(())
    }
}

struct RecordColumns {
    learner_id: String,
    item_id: String,
    level: &'static str,
    consecutive_correct: i64,
    correct_total: i64,
    incorrect_total: i64,
    next_review_at: String,
    next_review_at_ns: i64,
    last_reviewed_at: Option<String>,
    created_at: String,
    revision: i64,
}

impl RecordColumns {
    fn from_record(record: &ProgressRecord) -> Result<Self, StoreError> {
        Ok(Self {
            learner_id: record.learner_id.to_string(),
            item_id: record.item_id.to_string(),
            level: record.level.as_str(),
            consecutive_correct: i64::from(record.consecutive_correct),
            correct_total: i64::from(record.correct_total),
            incorrect_total: i64::from(record.incorrect_total),
            next_review_at: rfc3339(record.next_review_at)?,
            next_review_at_ns: timestamp_ns(record.next_review_at)?,
            last_reviewed_at: record.last_reviewed_at.map(rfc3339).transpose()?,
            created_at: rfc3339(record.created_at)?,
            revision: sql_i64(record.revision, "revision")?,
        })
    }
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressRecord> {
    let level_raw: String = row.get(2)?;
    let level = Level::parse(&level_raw)
        .ok_or_else(|| invalid_column(2, Type::Text, format!("invalid level: {level_raw}")))?;
    let last_reviewed_at = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(parse_time(7, &raw)?),
        None => None,
    };

    Ok(ProgressRecord {
        learner_id: LearnerId(parse_ulid_column(row, 0)?),
        item_id: ItemId(parse_ulid_column(row, 1)?),
        level,
        consecutive_correct: u32_column(row, 3)?,
        correct_total: u32_column(row, 4)?,
        incorrect_total: u32_column(row, 5)?,
        next_review_at: parse_time(6, &row.get::<_, String>(6)?)?,
        last_reviewed_at,
        created_at: parse_time(8, &row.get::<_, String>(8)?)?,
        revision: u64_column(row, 9)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewEvent> {
    let outcome_raw: String = row.get(3)?;
    let previous_raw: String = row.get(4)?;
    let new_raw: String = row.get(5)?;
    let transition_raw: String = row.get(6)?;

    Ok(ReviewEvent {
        event_id: parse_ulid_column(row, 0)?,
        learner_id: LearnerId(parse_ulid_column(row, 1)?),
        item_id: ItemId(parse_ulid_column(row, 2)?),
        outcome: Outcome::parse(&outcome_raw).ok_or_else(|| {
            invalid_column(3, Type::Text, format!("invalid outcome: {outcome_raw}"))
        })?,
        previous_level: Level::parse(&previous_raw).ok_or_else(|| {
            invalid_column(4, Type::Text, format!("invalid level: {previous_raw}"))
        })?,
        new_level: Level::parse(&new_raw)
            .ok_or_else(|| invalid_column(5, Type::Text, format!("invalid level: {new_raw}")))?,
        transition: TransitionKind::parse(&transition_raw).ok_or_else(|| {
            invalid_column(6, Type::Text, format!("invalid transition: {transition_raw}"))
        })?,
        response_latency_ms: u64_column(row, 7)?,
        reviewed_at: parse_time(8, &row.get::<_, String>(8)?)?,
        next_review_at: parse_time(9, &row.get::<_, String>(9)?)?,
    })
}

fn parse_ulid_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(index)?;
    Ulid::from_string(&raw)
        .map_err(|err| invalid_column(index, Type::Text, format!("invalid ulid {raw}: {err}")))
}

fn parse_time(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn u32_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(index)?;
    u32::try_from(raw)
        .map_err(|_| invalid_column(index, Type::Integer, format!("value out of range: {raw}")))
}

fn u64_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw)
        .map_err(|_| invalid_column(index, Type::Integer, format!("value out of range: {raw}")))
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn store_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            return StoreError::Timeout(err.to_string());
        }
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => {
            return StoreError::Corrupt(err.to_string());
        }
        _ => {}
    }

    match err {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String, StoreError> {
    format_rfc3339(value).map_err(|err| StoreError::Unrepresentable(err.to_string()))
}

fn timestamp_ns(value: OffsetDateTime) -> Result<i64, StoreError> {
    i64::try_from(value.unix_timestamp_nanos()).map_err(|_| {
        StoreError::Unrepresentable(format!("timestamp {value} is outside the storable range"))
    })
}

fn sql_i64(value: u64, field: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| {
            StoreError::Unrepresentable(format!("{field} {value} exceeds sqlite integer range"))
        })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "review store schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
