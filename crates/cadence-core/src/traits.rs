//! Collaborator seams: the durable store and the notification sender.
//!
//! Neither may fail silently: every failure comes back as a `CadenceError`.
//! Outages and timeouts map to `CadenceError::Transient`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Occurrence, ParticipantOccurrenceState, PartyRef, ReceiptKey, ReminderReceipt, ReminderRule,
    Routine, RoutineStatus, TaskState, TimeWindow,
};

/// Outcome of an insert-if-absent on occurrences.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created,
    /// A record with the same id was already stored; it is returned unchanged.
    Existing(Occurrence),
}

/// Outcome of an idempotent receipt write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptWrite {
    Written,
    AlreadyExists,
}

/// Durable storage for routines and everything derived from them.
///
/// ## Versioning
///
/// `save_routine` performs an optimistic check: the stored version must equal
/// `expected_version` (0 = routine must not exist yet). On success the stored
/// version becomes `expected_version + 1`, which is returned. On mismatch the
/// call fails with `CadenceError::VersionConflict` and nothing is written.
///
/// ## Idempotency
///
/// `upsert_occurrence_if_absent` and `write_receipt_if_absent` never overwrite.
/// A second write for an existing key is a no-op reported through the outcome.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ── Routines ─────────────────────────────────────────

    async fn load_routine(&self, routine_id: &str) -> Result<Routine>;

    async fn save_routine(&self, routine: &Routine, expected_version: u64) -> Result<u64>;

    async fn list_routine_ids(&self, status: RoutineStatus) -> Result<Vec<String>>;

    /// End of the materialized horizon for a routine, if any.
    async fn load_horizon(&self, routine_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn save_horizon(&self, routine_id: &str, until: DateTime<Utc>) -> Result<()>;

    // ── Occurrences ──────────────────────────────────────

    async fn upsert_occurrence_if_absent(&self, occurrence: &Occurrence) -> Result<UpsertOutcome>;

    /// Overwrite status/end of an existing occurrence.
    async fn save_occurrence(&self, occurrence: &Occurrence) -> Result<()>;

    async fn load_occurrence(&self, occurrence_id: &str) -> Result<Option<Occurrence>>;

    /// Occurrences whose start lies in `[window.start, window.end)`, ordered by start.
    async fn load_occurrences_in_window(
        &self,
        routine_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Occurrence>>;

    // ── Invitation states ────────────────────────────────

    async fn load_participant_states(
        &self,
        occurrence_id: &str,
    ) -> Result<Vec<ParticipantOccurrenceState>>;

    async fn upsert_participant_state(&self, state: &ParticipantOccurrenceState) -> Result<()>;

    async fn delete_participant_state(&self, occurrence_id: &str, party: &PartyRef) -> Result<()>;

    // ── Receipts ─────────────────────────────────────────

    async fn write_receipt_if_absent(&self, receipt: &ReminderReceipt) -> Result<ReceiptWrite>;

    async fn has_receipt(&self, key: &ReceiptKey) -> Result<bool>;

    async fn receipts_for_occurrence(&self, occurrence_id: &str) -> Result<Vec<ReminderReceipt>>;

    // ── Tasks ────────────────────────────────────────────

    async fn load_task_states(&self, occurrence_id: &str) -> Result<Vec<TaskState>>;

    async fn upsert_task_state(&self, state: &TaskState) -> Result<()>;
}

/// Delivers a reminder to one recipient. Transport is the implementor's concern.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `CadenceError::Delivery` (or `Transient`) when the send failed.
    async fn send(
        &self,
        recipient: &PartyRef,
        occurrence: &Occurrence,
        rule: &ReminderRule,
    ) -> Result<()>;
}
