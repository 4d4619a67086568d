//! In-process store and the timeout decorator applied to every store.
//!
//! `MemoryStore` keeps everything in a single mutex-guarded map set. It backs
//! tests and embedded use; `set_unavailable(true)` simulates an outage and
//! `fail_op` a single failing call, so retry paths can be exercised. `TimedStore` bounds each call of any
//! `DurableStore` and turns an elapsed timeout into a retryable error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DurableStore, ReceiptWrite, UpsertOutcome};
use cadence_core::types::{
    Occurrence, ParticipantOccurrenceState, PartyRef, ReceiptKey, ReminderReceipt, Routine,
    RoutineStatus, TaskState, TimeWindow,
};
use chrono::{DateTime, Utc};

#[derive(Default)]
struct Tables {
    routines: HashMap<String, Routine>,
    horizons: HashMap<String, DateTime<Utc>>,
    occurrences: HashMap<String, Occurrence>,
    states: HashMap<(String, PartyRef), ParticipantOccurrenceState>,
    receipts: HashMap<ReceiptKey, ReminderReceipt>,
    tasks: HashMap<(String, String), TaskState>,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    faults: Mutex<Vec<(&'static str, Option<String>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `Transient` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Fail every `op` call with `Transient` until `clear_faults`. With a
    /// routine id only calls concerning that routine fail.
    pub fn fail_op(&self, op: &'static str, routine_id: Option<&str>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((op, routine_id.map(str::to_string)));
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    fn fault(&self, op: &str, routine_id: &str) -> Result<()> {
        let hit = self
            .faults
            .lock()
            .map(|faults| {
                faults
                    .iter()
                    .any(|(o, r)| *o == op && r.as_deref().is_none_or(|r| r == routine_id))
            })
            .unwrap_or(false);
        if hit {
            return Err(CadenceError::Transient(format!("{op} failed for {routine_id}")));
        }
        Ok(())
    }

    /// Number of stored occurrences for a routine.
    pub fn occurrence_count(&self, routine_id: &str) -> usize {
        self.tables
            .lock()
            .map(|t| t.occurrences.values().filter(|o| o.routine_id == routine_id).count())
            .unwrap_or(0)
    }

    /// Number of stored receipts.
    pub fn receipt_count(&self) -> usize {
        self.tables.lock().map(|t| t.receipts.len()).unwrap_or(0)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CadenceError::Transient("Store unavailable".into()));
        }
        self.tables
            .lock()
            .map_err(|e| CadenceError::Transient(format!("Lock: {e}")))
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load_routine(&self, routine_id: &str) -> Result<Routine> {
        self.fault("load_routine", routine_id)?;
        self.tables()?
            .routines
            .get(routine_id)
            .cloned()
            .ok_or_else(|| CadenceError::NotFound(format!("routine {routine_id}")))
    }

    async fn save_routine(&self, routine: &Routine, expected_version: u64) -> Result<u64> {
        self.fault("save_routine", &routine.id)?;
        let mut t = self.tables()?;
        let actual = t.routines.get(&routine.id).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(CadenceError::VersionConflict {
                routine_id: routine.id.clone(),
                expected: expected_version,
                actual,
            });
        }
        let mut stored = routine.clone();
        stored.version = expected_version + 1;
        t.routines.insert(stored.id.clone(), stored);
        Ok(expected_version + 1)
    }

    async fn list_routine_ids(&self, status: RoutineStatus) -> Result<Vec<String>> {
        let t = self.tables()?;
        let mut ids: Vec<String> = t
            .routines
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn load_horizon(&self, routine_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.fault("load_horizon", routine_id)?;
        Ok(self.tables()?.horizons.get(routine_id).copied())
    }

    async fn save_horizon(&self, routine_id: &str, until: DateTime<Utc>) -> Result<()> {
        self.fault("save_horizon", routine_id)?;
        self.tables()?.horizons.insert(routine_id.to_string(), until);
        Ok(())
    }

    async fn upsert_occurrence_if_absent(&self, occurrence: &Occurrence) -> Result<UpsertOutcome> {
        self.fault("upsert_occurrence_if_absent", &occurrence.routine_id)?;
        let mut t = self.tables()?;
        if let Some(existing) = t.occurrences.get(&occurrence.id) {
            return Ok(UpsertOutcome::Existing(existing.clone()));
        }
        t.occurrences.insert(occurrence.id.clone(), occurrence.clone());
        Ok(UpsertOutcome::Created)
    }

    async fn save_occurrence(&self, occurrence: &Occurrence) -> Result<()> {
        self.fault("save_occurrence", &occurrence.routine_id)?;
        let mut t = self.tables()?;
        if !t.occurrences.contains_key(&occurrence.id) {
            return Err(CadenceError::NotFound(format!("occurrence {}", occurrence.id)));
        }
        t.occurrences.insert(occurrence.id.clone(), occurrence.clone());
        Ok(())
    }

    async fn load_occurrence(&self, occurrence_id: &str) -> Result<Option<Occurrence>> {
        Ok(self.tables()?.occurrences.get(occurrence_id).cloned())
    }

    async fn load_occurrences_in_window(
        &self,
        routine_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Occurrence>> {
        self.fault("load_occurrences_in_window", routine_id)?;
        let t = self.tables()?;
        let mut found: Vec<Occurrence> = t
            .occurrences
            .values()
            .filter(|o| o.routine_id == routine_id && window.contains(o.start))
            .cloned()
            .collect();
        found.sort_by_key(|o| o.start);
        Ok(found)
    }

    async fn load_participant_states(
        &self,
        occurrence_id: &str,
    ) -> Result<Vec<ParticipantOccurrenceState>> {
        let t = self.tables()?;
        let mut found: Vec<_> = t
            .states
            .values()
            .filter(|s| s.occurrence_id == occurrence_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.party.cmp(&b.party));
        Ok(found)
    }

    async fn upsert_participant_state(&self, state: &ParticipantOccurrenceState) -> Result<()> {
        self.tables()?
            .states
            .insert((state.occurrence_id.clone(), state.party.clone()), state.clone());
        Ok(())
    }

    async fn delete_participant_state(&self, occurrence_id: &str, party: &PartyRef) -> Result<()> {
        self.tables()?
            .states
            .remove(&(occurrence_id.to_string(), party.clone()));
        Ok(())
    }

    async fn write_receipt_if_absent(&self, receipt: &ReminderReceipt) -> Result<ReceiptWrite> {
        let mut t = self.tables()?;
        if t.receipts.contains_key(&receipt.key) {
            return Ok(ReceiptWrite::AlreadyExists);
        }
        t.receipts.insert(receipt.key.clone(), receipt.clone());
        Ok(ReceiptWrite::Written)
    }

    async fn has_receipt(&self, key: &ReceiptKey) -> Result<bool> {
        Ok(self.tables()?.receipts.contains_key(key))
    }

    async fn receipts_for_occurrence(&self, occurrence_id: &str) -> Result<Vec<ReminderReceipt>> {
        let t = self.tables()?;
        let mut found: Vec<_> = t
            .receipts
            .values()
            .filter(|r| r.key.occurrence_id == occurrence_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.dispatched_at);
        Ok(found)
    }

    async fn load_task_states(&self, occurrence_id: &str) -> Result<Vec<TaskState>> {
        let t = self.tables()?;
        Ok(t.tasks
            .values()
            .filter(|s| s.occurrence_id == occurrence_id)
            .cloned()
            .collect())
    }

    async fn upsert_task_state(&self, state: &TaskState) -> Result<()> {
        self.tables()?
            .tasks
            .insert((state.occurrence_id.clone(), state.task_id.clone()), state.clone());
        Ok(())
    }
}

// ─── Timeout decorator ─────────────────────────────────────

/// Wraps a store so no call can block longer than `timeout`.
pub struct TimedStore {
    inner: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("⏱️ Store call '{}' timed out after {:?}", op, self.timeout);
                Err(CadenceError::Transient(format!("{op} timed out")))
            }
        }
    }
}

#[async_trait]
impl DurableStore for TimedStore {
    async fn load_routine(&self, routine_id: &str) -> Result<Routine> {
        self.bounded("load_routine", self.inner.load_routine(routine_id)).await
    }

    async fn save_routine(&self, routine: &Routine, expected_version: u64) -> Result<u64> {
        self.bounded("save_routine", self.inner.save_routine(routine, expected_version))
            .await
    }

    async fn list_routine_ids(&self, status: RoutineStatus) -> Result<Vec<String>> {
        self.bounded("list_routine_ids", self.inner.list_routine_ids(status)).await
    }

    async fn load_horizon(&self, routine_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.bounded("load_horizon", self.inner.load_horizon(routine_id)).await
    }

    async fn save_horizon(&self, routine_id: &str, until: DateTime<Utc>) -> Result<()> {
        self.bounded("save_horizon", self.inner.save_horizon(routine_id, until)).await
    }

    async fn upsert_occurrence_if_absent(&self, occurrence: &Occurrence) -> Result<UpsertOutcome> {
        self.bounded(
            "upsert_occurrence_if_absent",
            self.inner.upsert_occurrence_if_absent(occurrence),
        )
        .await
    }

    async fn save_occurrence(&self, occurrence: &Occurrence) -> Result<()> {
        self.bounded("save_occurrence", self.inner.save_occurrence(occurrence)).await
    }

    async fn load_occurrence(&self, occurrence_id: &str) -> Result<Option<Occurrence>> {
        self.bounded("load_occurrence", self.inner.load_occurrence(occurrence_id)).await
    }

    async fn load_occurrences_in_window(
        &self,
        routine_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Occurrence>> {
        self.bounded(
            "load_occurrences_in_window",
            self.inner.load_occurrences_in_window(routine_id, window),
        )
        .await
    }

    async fn load_participant_states(
        &self,
        occurrence_id: &str,
    ) -> Result<Vec<ParticipantOccurrenceState>> {
        self.bounded(
            "load_participant_states",
            self.inner.load_participant_states(occurrence_id),
        )
        .await
    }

    async fn upsert_participant_state(&self, state: &ParticipantOccurrenceState) -> Result<()> {
        self.bounded("upsert_participant_state", self.inner.upsert_participant_state(state))
            .await
    }

    async fn delete_participant_state(&self, occurrence_id: &str, party: &PartyRef) -> Result<()> {
        self.bounded(
            "delete_participant_state",
            self.inner.delete_participant_state(occurrence_id, party),
        )
        .await
    }

    async fn write_receipt_if_absent(&self, receipt: &ReminderReceipt) -> Result<ReceiptWrite> {
        self.bounded("write_receipt_if_absent", self.inner.write_receipt_if_absent(receipt))
            .await
    }

    async fn has_receipt(&self, key: &ReceiptKey) -> Result<bool> {
        self.bounded("has_receipt", self.inner.has_receipt(key)).await
    }

    async fn receipts_for_occurrence(&self, occurrence_id: &str) -> Result<Vec<ReminderReceipt>> {
        self.bounded(
            "receipts_for_occurrence",
            self.inner.receipts_for_occurrence(occurrence_id),
        )
        .await
    }

    async fn load_task_states(&self, occurrence_id: &str) -> Result<Vec<TaskState>> {
        self.bounded("load_task_states", self.inner.load_task_states(occurrence_id)).await
    }

    async fn upsert_task_state(&self, state: &TaskState) -> Result<()> {
        self.bounded("upsert_task_state", self.inner.upsert_task_state(state)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{DeliveryResult, OccurrenceStatus, Schedule};
    use chrono::NaiveDate;

    fn routine() -> Routine {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(9, 0, 0).unwrap();
        Routine::new("Sync", PartyRef::user("u1"), Schedule::one_time(start, 30, "UTC"))
    }

    fn occurrence(id: &str, routine_id: &str) -> Occurrence {
        let now = Utc::now();
        Occurrence {
            id: id.to_string(),
            routine_id: routine_id.to_string(),
            start: now,
            end: now + chrono::Duration::minutes(30),
            status: OccurrenceStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_save_routine_version_check() {
        let store = MemoryStore::new();
        let r = routine();
        assert_eq!(store.save_routine(&r, 0).await.unwrap(), 1);

        let stale = store.save_routine(&r, 0).await;
        assert!(matches!(
            stale,
            Err(CadenceError::VersionConflict { expected: 0, actual: 1, .. })
        ));

        let loaded = store.load_routine(&r.id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(store.save_routine(&loaded, 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_if_absent_never_overwrites() {
        let store = MemoryStore::new();
        let mut occ = occurrence("occ-1", "r1");
        assert_eq!(store.upsert_occurrence_if_absent(&occ).await.unwrap(), UpsertOutcome::Created);

        occ.status = OccurrenceStatus::Cancelled;
        match store.upsert_occurrence_if_absent(&occ).await.unwrap() {
            UpsertOutcome::Existing(existing) => {
                assert_eq!(existing.status, OccurrenceStatus::Scheduled)
            }
            other => panic!("expected existing, got {other:?}"),
        }
        assert_eq!(store.occurrence_count("r1"), 1);
    }

    #[tokio::test]
    async fn test_receipt_write_is_idempotent() {
        let store = MemoryStore::new();
        let receipt = ReminderReceipt {
            key: ReceiptKey {
                rule_id: "rule".into(),
                occurrence_id: "occ".into(),
                party: PartyRef::user("u1"),
            },
            dispatched_at: Utc::now(),
            result: DeliveryResult::Delivered,
        };
        assert_eq!(store.write_receipt_if_absent(&receipt).await.unwrap(), ReceiptWrite::Written);
        assert_eq!(
            store.write_receipt_if_absent(&receipt).await.unwrap(),
            ReceiptWrite::AlreadyExists
        );
        assert!(store.has_receipt(&receipt.key).await.unwrap());
        assert_eq!(store.receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_fault_hits_only_its_routine() {
        let store = MemoryStore::new();
        store.fail_op("load_horizon", Some("r2"));
        assert!(store.load_horizon("r1").await.is_ok());
        assert!(matches!(store.load_horizon("r2").await, Err(CadenceError::Transient(_))));
        assert!(store.save_horizon("r2", Utc::now()).await.is_ok());
        store.clear_faults();
        assert!(store.load_horizon("r2").await.is_ok());
    }

    #[tokio::test]
    async fn test_outage_is_transient() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.load_horizon("r1").await.unwrap_err();
        assert!(err.is_retryable());
        store.set_unavailable(false);
        assert!(store.load_horizon("r1").await.unwrap().is_none());
    }

    struct StuckStore;

    #[async_trait]
    impl DurableStore for StuckStore {
        async fn load_routine(&self, _: &str) -> Result<Routine> {
            std::future::pending().await
        }
        async fn save_routine(&self, _: &Routine, _: u64) -> Result<u64> {
            std::future::pending().await
        }
        async fn list_routine_ids(&self, _: RoutineStatus) -> Result<Vec<String>> {
            std::future::pending().await
        }
        async fn load_horizon(&self, _: &str) -> Result<Option<DateTime<Utc>>> {
            std::future::pending().await
        }
        async fn save_horizon(&self, _: &str, _: DateTime<Utc>) -> Result<()> {
            std::future::pending().await
        }
        async fn upsert_occurrence_if_absent(&self, _: &Occurrence) -> Result<UpsertOutcome> {
            std::future::pending().await
        }
        async fn save_occurrence(&self, _: &Occurrence) -> Result<()> {
            std::future::pending().await
        }
        async fn load_occurrence(&self, _: &str) -> Result<Option<Occurrence>> {
            std::future::pending().await
        }
        async fn load_occurrences_in_window(&self, _: &str, _: TimeWindow) -> Result<Vec<Occurrence>> {
            std::future::pending().await
        }
        async fn load_participant_states(&self, _: &str) -> Result<Vec<ParticipantOccurrenceState>> {
            std::future::pending().await
        }
        async fn upsert_participant_state(&self, _: &ParticipantOccurrenceState) -> Result<()> {
            std::future::pending().await
        }
        async fn delete_participant_state(&self, _: &str, _: &PartyRef) -> Result<()> {
            std::future::pending().await
        }
        async fn write_receipt_if_absent(&self, _: &ReminderReceipt) -> Result<ReceiptWrite> {
            std::future::pending().await
        }
        async fn has_receipt(&self, _: &ReceiptKey) -> Result<bool> {
            std::future::pending().await
        }
        async fn receipts_for_occurrence(&self, _: &str) -> Result<Vec<ReminderReceipt>> {
            std::future::pending().await
        }
        async fn load_task_states(&self, _: &str) -> Result<Vec<TaskState>> {
            std::future::pending().await
        }
        async fn upsert_task_state(&self, _: &TaskState) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timed_store_turns_hang_into_transient() {
        let store = TimedStore::new(Arc::new(StuckStore), Duration::from_millis(20));
        let err = store.load_routine("r1").await.unwrap_err();
        assert!(matches!(err, CadenceError::Transient(_)));
    }
}
