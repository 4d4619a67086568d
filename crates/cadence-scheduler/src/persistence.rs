//! SQLite-backed durable store for routines, occurrences, invitation states,
//! task states and reminder receipts. Survives restarts.
//!
//! Routines are stored as a JSON body next to their version column so the
//! optimistic check is a single row comparison. Occurrence instants are
//! stored as unix seconds for range scans.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DurableStore, ReceiptWrite, UpsertOutcome};
use cadence_core::types::{
    DeliveryResult, InvitationStatus, Occurrence, OccurrenceStatus, ParticipantOccurrenceState,
    PartyRef, ReceiptKey, ReminderReceipt, Routine, RoutineStatus, TaskState, TaskStatus,
    TimeWindow,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

/// SQLite store. One connection guarded by a mutex; WAL for concurrent readers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Undecodable rows are a bug, not an outage; everything else is retryable.
fn db_err(ctx: &str) -> impl Fn(rusqlite::Error) -> CadenceError + '_ {
    move |e| match e {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => {
            CadenceError::InvariantViolation(format!("{ctx}: corrupt row: {e}"))
        }
        _ => CadenceError::Transient(format!("{ctx}: {e}")),
    }
}

fn corrupt(col: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        format!("invalid {what} '{value}'").into(),
    )
}

fn ts(secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, secs))
}

fn parse_rfc3339(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| corrupt(col, "timestamp", s))
}

fn parse_party(col: usize, s: &str) -> rusqlite::Result<PartyRef> {
    PartyRef::parse_key(s).ok_or_else(|| corrupt(col, "party", s))
}

fn task_status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Completed => "completed",
        TaskStatus::Skipped => "skipped",
    }
}

fn parse_task_status(col: usize, s: &str) -> rusqlite::Result<TaskStatus> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "completed" => Ok(TaskStatus::Completed),
        "skipped" => Ok(TaskStatus::Skipped),
        _ => Err(corrupt(col, "task status", s)),
    }
}

fn row_to_occurrence(row: &rusqlite::Row) -> rusqlite::Result<Occurrence> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Occurrence {
        id: row.get(0)?,
        routine_id: row.get(1)?,
        start: ts(row.get(2)?)?,
        end: ts(row.get(3)?)?,
        status: OccurrenceStatus::parse(&status)
            .ok_or_else(|| corrupt(4, "occurrence status", &status))?,
        created_at: parse_rfc3339(5, &created_at)?,
        updated_at: parse_rfc3339(6, &updated_at)?,
    })
}

fn row_to_receipt(row: &rusqlite::Row) -> rusqlite::Result<ReminderReceipt> {
    let party: String = row.get(2)?;
    let dispatched_at: String = row.get(3)?;
    let failure: Option<String> = row.get(4)?;
    Ok(ReminderReceipt {
        key: ReceiptKey {
            rule_id: row.get(0)?,
            occurrence_id: row.get(1)?,
            party: parse_party(2, &party)?,
        },
        dispatched_at: parse_rfc3339(3, &dispatched_at)?,
        result: match failure {
            Some(reason) => DeliveryResult::Failed(reason),
            None => DeliveryResult::Delivered,
        },
    })
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CadenceError::Transient(format!("Lock: {e}")))
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS routines (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,              -- JSON-encoded Routine
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS horizons (
                routine_id TEXT PRIMARY KEY,
                until_ts INTEGER NOT NULL
            );

            -- Never deleted; cancelled occurrences keep their audit trail
            CREATE TABLE IF NOT EXISTS occurrences (
                id TEXT PRIMARY KEY,             -- hash(routine_id, start)
                routine_id TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_occurrences_routine_start
                ON occurrences(routine_id, start_ts);

            CREATE TABLE IF NOT EXISTS participant_states (
                occurrence_id TEXT NOT NULL,
                party TEXT NOT NULL,             -- user:<id> | team:<id>
                status TEXT NOT NULL,
                overridden INTEGER NOT NULL DEFAULT 0,
                last_updated_at TEXT NOT NULL,
                PRIMARY KEY (occurrence_id, party)
            );

            -- Append-only; the primary key is the dedup key
            CREATE TABLE IF NOT EXISTS reminder_receipts (
                rule_id TEXT NOT NULL,
                occurrence_id TEXT NOT NULL,
                party TEXT NOT NULL,
                dispatched_at TEXT NOT NULL,
                failure_reason TEXT,             -- NULL = delivered
                PRIMARY KEY (rule_id, occurrence_id, party)
            );

            CREATE TABLE IF NOT EXISTS task_states (
                occurrence_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (occurrence_id, task_id)
            );
         ",
            )
            .map_err(db_err("Migration"))
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    // ─── Routines ───────────────────────────────────────────

    async fn load_routine(&self, routine_id: &str) -> Result<Routine> {
        let conn = self.conn()?;
        let row: Option<(String, u64)> = conn
            .query_row(
                "SELECT body, version FROM routines WHERE id = ?1",
                [routine_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err("Load routine"))?;
        let (body, version) =
            row.ok_or_else(|| CadenceError::NotFound(format!("routine {routine_id}")))?;
        let mut routine: Routine = serde_json::from_str(&body).map_err(|e| {
            CadenceError::InvariantViolation(format!("Corrupt routine record {routine_id}: {e}"))
        })?;
        routine.version = version;
        Ok(routine)
    }

    async fn save_routine(&self, routine: &Routine, expected_version: u64) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Begin"))?;
        let actual: u64 = tx
            .query_row(
                "SELECT version FROM routines WHERE id = ?1",
                [&routine.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Read version"))?
            .unwrap_or(0);
        if actual != expected_version {
            return Err(CadenceError::VersionConflict {
                routine_id: routine.id.clone(),
                expected: expected_version,
                actual,
            });
        }

        let next = expected_version + 1;
        let mut stored = routine.clone();
        stored.version = next;
        let body = serde_json::to_string(&stored)
            .map_err(|e| CadenceError::Validation(format!("Serialize routine: {e}")))?;
        tx.execute(
            "INSERT OR REPLACE INTO routines (id, status, version, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stored.id,
                stored.status.as_str(),
                next,
                body,
                stored.updated_at.to_rfc3339()
            ],
        )
        .map_err(db_err("Save routine"))?;
        tx.commit().map_err(db_err("Commit"))?;
        Ok(next)
    }

    async fn list_routine_ids(&self, status: RoutineStatus) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM routines WHERE status = ?1 ORDER BY id")
            .map_err(db_err("List routines"))?;
        let ids = stmt
            .query_map([status.as_str()], |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
            .map_err(db_err("List routines"))?;
        Ok(ids)
    }

    async fn load_horizon(&self, routine_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT until_ts FROM horizons WHERE routine_id = ?1",
            [routine_id],
            |row| ts(row.get(0)?),
        )
        .optional()
        .map_err(db_err("Load horizon"))
    }

    async fn save_horizon(&self, routine_id: &str, until: DateTime<Utc>) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO horizons (routine_id, until_ts) VALUES (?1, ?2)",
                params![routine_id, until.timestamp()],
            )
            .map_err(db_err("Save horizon"))?;
        Ok(())
    }

    // ─── Occurrences ────────────────────────────────────────

    async fn upsert_occurrence_if_absent(&self, occurrence: &Occurrence) -> Result<UpsertOutcome> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO occurrences
                 (id, routine_id, start_ts, end_ts, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    occurrence.id,
                    occurrence.routine_id,
                    occurrence.start.timestamp(),
                    occurrence.end.timestamp(),
                    occurrence.status.as_str(),
                    occurrence.created_at.to_rfc3339(),
                    occurrence.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Upsert occurrence"))?;
        if inserted == 1 {
            return Ok(UpsertOutcome::Created);
        }
        let existing = conn
            .query_row(
                "SELECT id, routine_id, start_ts, end_ts, status, created_at, updated_at
                 FROM occurrences WHERE id = ?1",
                [&occurrence.id],
                row_to_occurrence,
            )
            .map_err(db_err("Load existing occurrence"))?;
        Ok(UpsertOutcome::Existing(existing))
    }

    async fn save_occurrence(&self, occurrence: &Occurrence) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE occurrences SET end_ts = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    occurrence.end.timestamp(),
                    occurrence.status.as_str(),
                    occurrence.updated_at.to_rfc3339(),
                    occurrence.id,
                ],
            )
            .map_err(db_err("Save occurrence"))?;
        if changed == 0 {
            return Err(CadenceError::NotFound(format!("occurrence {}", occurrence.id)));
        }
        Ok(())
    }

    async fn load_occurrence(&self, occurrence_id: &str) -> Result<Option<Occurrence>> {
        self.conn()?
            .query_row(
                "SELECT id, routine_id, start_ts, end_ts, status, created_at, updated_at
                 FROM occurrences WHERE id = ?1",
                [occurrence_id],
                row_to_occurrence,
            )
            .optional()
            .map_err(db_err("Load occurrence"))
    }

    async fn load_occurrences_in_window(
        &self,
        routine_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Occurrence>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, routine_id, start_ts, end_ts, status, created_at, updated_at
                 FROM occurrences
                 WHERE routine_id = ?1 AND start_ts >= ?2 AND start_ts < ?3
                 ORDER BY start_ts",
            )
            .map_err(db_err("Load occurrences"))?;
        let found = stmt
            .query_map(
                params![routine_id, window.start.timestamp(), window.end.timestamp()],
                row_to_occurrence,
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(db_err("Load occurrences"))?;
        Ok(found)
    }

    // ─── Invitation states ──────────────────────────────────

    async fn load_participant_states(
        &self,
        occurrence_id: &str,
    ) -> Result<Vec<ParticipantOccurrenceState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT occurrence_id, party, status, overridden, last_updated_at
                 FROM participant_states WHERE occurrence_id = ?1 ORDER BY party",
            )
            .map_err(db_err("Load states"))?;
        let found = stmt
            .query_map([occurrence_id], |row| {
                let party: String = row.get(1)?;
                let status: String = row.get(2)?;
                let updated: String = row.get(4)?;
                Ok(ParticipantOccurrenceState {
                    occurrence_id: row.get(0)?,
                    party: parse_party(1, &party)?,
                    status: InvitationStatus::parse(&status)
                        .ok_or_else(|| corrupt(2, "invitation status", &status))?,
                    overridden: row.get::<_, i32>(3)? != 0,
                    last_updated_at: parse_rfc3339(4, &updated)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(db_err("Load states"))?;
        Ok(found)
    }

    async fn upsert_participant_state(&self, state: &ParticipantOccurrenceState) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO participant_states
                 (occurrence_id, party, status, overridden, last_updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.occurrence_id,
                    state.party.key(),
                    state.status.as_str(),
                    state.overridden as i32,
                    state.last_updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Upsert state"))?;
        Ok(())
    }

    async fn delete_participant_state(&self, occurrence_id: &str, party: &PartyRef) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM participant_states WHERE occurrence_id = ?1 AND party = ?2",
                params![occurrence_id, party.key()],
            )
            .map_err(db_err("Delete state"))?;
        Ok(())
    }

    // ─── Receipts ───────────────────────────────────────────

    async fn write_receipt_if_absent(&self, receipt: &ReminderReceipt) -> Result<ReceiptWrite> {
        let failure = match &receipt.result {
            DeliveryResult::Delivered => None,
            DeliveryResult::Failed(reason) => Some(reason.as_str()),
        };
        let inserted = self
            .conn()?
            .execute(
                "INSERT OR IGNORE INTO reminder_receipts
                 (rule_id, occurrence_id, party, dispatched_at, failure_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    receipt.key.rule_id,
                    receipt.key.occurrence_id,
                    receipt.key.party.key(),
                    receipt.dispatched_at.to_rfc3339(),
                    failure,
                ],
            )
            .map_err(db_err("Write receipt"))?;
        Ok(if inserted == 1 {
            ReceiptWrite::Written
        } else {
            ReceiptWrite::AlreadyExists
        })
    }

    async fn has_receipt(&self, key: &ReceiptKey) -> Result<bool> {
        let found: Option<i64> = self
            .conn()?
            .query_row(
                "SELECT 1 FROM reminder_receipts
                 WHERE rule_id = ?1 AND occurrence_id = ?2 AND party = ?3",
                params![key.rule_id, key.occurrence_id, key.party.key()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Check receipt"))?;
        Ok(found.is_some())
    }

    async fn receipts_for_occurrence(&self, occurrence_id: &str) -> Result<Vec<ReminderReceipt>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT rule_id, occurrence_id, party, dispatched_at, failure_reason
                 FROM reminder_receipts WHERE occurrence_id = ?1 ORDER BY dispatched_at",
            )
            .map_err(db_err("Load receipts"))?;
        let found = stmt
            .query_map([occurrence_id], row_to_receipt)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(db_err("Load receipts"))?;
        Ok(found)
    }

    // ─── Tasks ──────────────────────────────────────────────

    async fn load_task_states(&self, occurrence_id: &str) -> Result<Vec<TaskState>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT occurrence_id, task_id, status, updated_at
                 FROM task_states WHERE occurrence_id = ?1 ORDER BY task_id",
            )
            .map_err(db_err("Load task states"))?;
        let found = stmt
            .query_map([occurrence_id], |row| {
                let status: String = row.get(2)?;
                let updated: String = row.get(3)?;
                Ok(TaskState {
                    occurrence_id: row.get(0)?,
                    task_id: row.get(1)?,
                    status: parse_task_status(2, &status)?,
                    updated_at: parse_rfc3339(3, &updated)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(db_err("Load task states"))?;
        Ok(found)
    }

    async fn upsert_task_state(&self, state: &TaskState) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO task_states (occurrence_id, task_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    state.occurrence_id,
                    state.task_id,
                    task_status_str(state.status),
                    state.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Upsert task state"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::Schedule;
    use chrono::{Duration, NaiveDate, TimeZone};

    fn routine() -> Routine {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(9, 0, 0).unwrap();
        Routine::new("Review", PartyRef::team("core"), Schedule::one_time(start, 60, "UTC"))
    }

    fn occurrence(id: &str, hour: u32) -> Occurrence {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        Occurrence {
            id: id.into(),
            routine_id: "r1".into(),
            start,
            end: start + Duration::minutes(30),
            status: OccurrenceStatus::Scheduled,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_open_and_migrate_on_disk() {
        let dir = std::env::temp_dir().join("cadence-sqlite-test");
        std::fs::create_dir_all(&dir).ok();
        let store = SqliteStore::open(&dir.join("test.db"));
        assert!(store.is_ok());
        drop(store);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_routine_roundtrip_and_version_conflict() {
        let store = SqliteStore::open_in_memory().unwrap();
        let r = routine();
        assert_eq!(store.save_routine(&r, 0).await.unwrap(), 1);
        let loaded = store.load_routine(&r.id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.creator, PartyRef::team("core"));

        let err = store.save_routine(&r, 0).await.unwrap_err();
        assert!(matches!(err, CadenceError::VersionConflict { actual: 1, .. }));
        assert_eq!(
            store.list_routine_ids(RoutineStatus::Draft).await.unwrap(),
            vec![r.id.clone()]
        );
        assert!(matches!(
            store.load_routine("missing").await,
            Err(CadenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_occurrence_insert_if_absent_and_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = occurrence("occ-a", 9);
        let b = occurrence("occ-b", 11);
        assert_eq!(store.upsert_occurrence_if_absent(&a).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert_occurrence_if_absent(&b).await.unwrap(), UpsertOutcome::Created);

        let mut cancelled = a.clone();
        cancelled.status = OccurrenceStatus::Cancelled;
        store.save_occurrence(&cancelled).await.unwrap();

        // Re-deriving the same instant must not resurrect it.
        match store.upsert_occurrence_if_absent(&a).await.unwrap() {
            UpsertOutcome::Existing(o) => assert_eq!(o.status, OccurrenceStatus::Cancelled),
            other => panic!("expected existing, got {other:?}"),
        }

        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        );
        let found = store.load_occurrences_in_window("r1", window).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "occ-b");
    }

    #[tokio::test]
    async fn test_states_receipts_and_tasks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = ParticipantOccurrenceState {
            occurrence_id: "occ-a".into(),
            party: PartyRef::user("7"),
            status: InvitationStatus::Declined,
            overridden: true,
            last_updated_at: Utc::now(),
        };
        store.upsert_participant_state(&state).await.unwrap();
        let loaded = store.load_participant_states("occ-a").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, InvitationStatus::Declined);
        assert!(loaded[0].overridden);
        store.delete_participant_state("occ-a", &PartyRef::user("7")).await.unwrap();
        assert!(store.load_participant_states("occ-a").await.unwrap().is_empty());

        let receipt = ReminderReceipt {
            key: ReceiptKey {
                rule_id: "r15".into(),
                occurrence_id: "occ-a".into(),
                party: PartyRef::user("7"),
            },
            dispatched_at: Utc::now(),
            result: DeliveryResult::Failed("mailbox full".into()),
        };
        assert_eq!(store.write_receipt_if_absent(&receipt).await.unwrap(), ReceiptWrite::Written);
        assert_eq!(
            store.write_receipt_if_absent(&receipt).await.unwrap(),
            ReceiptWrite::AlreadyExists
        );
        let receipts = store.receipts_for_occurrence("occ-a").await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].result, DeliveryResult::Failed("mailbox full".into()));

        let task = TaskState {
            occurrence_id: "occ-a".into(),
            task_id: "notes".into(),
            status: TaskStatus::Completed,
            updated_at: Utc::now(),
        };
        store.upsert_task_state(&task).await.unwrap();
        let tasks = store.load_task_states("occ-a").await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_corrupt_occurrence_row_is_invariant_violation() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_occurrence_if_absent(&occurrence("occ-a", 9)).await.unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE occurrences SET status = 'archived' WHERE id = 'occ-a'", [])
            .unwrap();
        assert!(matches!(
            store.load_occurrence("occ-a").await,
            Err(CadenceError::InvariantViolation(_))
        ));

        store.upsert_occurrence_if_absent(&occurrence("occ-b", 11)).await.unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE occurrences SET updated_at = 'yesterday' WHERE id = 'occ-b'", [])
            .unwrap();
        assert!(matches!(
            store.load_occurrence("occ-b").await,
            Err(CadenceError::InvariantViolation(_))
        ));
    }
}
