//! Occurrence materialization: persists expanded occurrences idempotently.
//!
//! Identity is `hash(routine_id, start)`, so re-running expansion (after a
//! restart, a replay, or a concurrent tick) can only ever confirm records,
//! never duplicate them. Records are never deleted; they end Completed or
//! Cancelled.
//!
//! Only a bounded horizon is materialized. The horizon is pushed forward on
//! every lifecycle tick and on queries that reach past it.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DurableStore, UpsertOutcome};
use cadence_core::types::{Occurrence, OccurrenceStatus, Routine, RoutineStatus, TimeWindow};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::recurrence::{self, OccurrenceWindow};

/// Deterministic occurrence id for a routine instant.
pub fn occurrence_id(routine_id: &str, start: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{routine_id}|{}", start.timestamp()));
    let digest = format!("{:x}", hasher.finalize());
    format!("occ-{}", &digest[..32])
}

/// What a materialization pass changed.
#[derive(Debug, Default, Clone)]
pub struct MaterializeReport {
    /// Newly created Scheduled occurrences.
    pub created: Vec<Occurrence>,
    /// Records that already existed and were left as they were.
    pub existing: usize,
    /// Scheduled records whose end moved because the duration changed.
    pub updated: usize,
    /// Scheduled records no longer generated by the schedule.
    pub cancelled: Vec<Occurrence>,
}

/// Owns occurrence records; the only writer of them.
pub struct OccurrenceStore {
    store: Arc<dyn DurableStore>,
    horizon: Duration,
}

impl OccurrenceStore {
    pub fn new(store: Arc<dyn DurableStore>, horizon_days: u32) -> Self {
        Self {
            store,
            horizon: Duration::days(horizon_days.max(1) as i64),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    fn scheduled(routine_id: &str, window: OccurrenceWindow, now: DateTime<Utc>) -> Occurrence {
        Occurrence {
            id: occurrence_id(routine_id, window.start),
            routine_id: routine_id.to_string(),
            start: window.start,
            end: window.end,
            status: OccurrenceStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    /// Insert one expanded instant unless its record already exists.
    async fn upsert(
        &self,
        routine: &Routine,
        window: OccurrenceWindow,
        now: DateTime<Utc>,
        report: &mut MaterializeReport,
    ) -> Result<Occurrence> {
        let candidate = Self::scheduled(&routine.id, window, now);
        match self.store.upsert_occurrence_if_absent(&candidate).await? {
            UpsertOutcome::Created => {
                tracing::debug!("🗓️ Occurrence materialized: {} @ {}", candidate.id, candidate.start);
                report.created.push(candidate.clone());
                Ok(candidate)
            }
            UpsertOutcome::Existing(existing) => {
                if existing.routine_id != routine.id || existing.start != candidate.start {
                    tracing::error!(
                        "💥 Occurrence id collision: {} (routine {} @ {} vs routine {} @ {})",
                        existing.id,
                        existing.routine_id,
                        existing.start,
                        routine.id,
                        candidate.start
                    );
                    return Err(CadenceError::InvariantViolation(format!(
                        "occurrence id {} maps to two instants",
                        existing.id
                    )));
                }
                report.existing += 1;
                Ok(existing)
            }
        }
    }

    /// Materialize every occurrence of `routine` intersecting `window`.
    /// Existing records are confirmed as they are, whatever their status.
    pub async fn ensure_materialized(
        &self,
        routine: &Routine,
        window: TimeWindow,
    ) -> Result<MaterializeReport> {
        let now = Utc::now();
        let mut report = MaterializeReport::default();
        for w in recurrence::expand(&routine.schedule, window)? {
            self.upsert(routine, w, now, &mut report).await?;
        }
        Ok(report)
    }

    /// Push the horizon to `now + horizon`, materializing the gap.
    pub async fn extend_horizon(
        &self,
        routine: &Routine,
        now: DateTime<Utc>,
    ) -> Result<MaterializeReport> {
        let target = now + self.horizon;
        let from = match self.store.load_horizon(&routine.id).await? {
            Some(current) if current >= target => return Ok(MaterializeReport::default()),
            Some(current) => current,
            None => now,
        };
        let report = self
            .ensure_materialized(routine, TimeWindow::new(from, target))
            .await?;
        self.store.save_horizon(&routine.id, target).await?;
        if !report.created.is_empty() {
            tracing::info!(
                "📆 Horizon for '{}' extended to {} ({} new occurrences)",
                routine.id,
                target,
                report.created.len()
            );
        }
        Ok(report)
    }

    /// Occurrences intersecting `window`. For active routines, a window that
    /// reaches past the horizon is materialized first.
    ///
    /// Without a stored horizon the window is materialized but no horizon is
    /// recorded: the first `extend_horizon` must still cover everything from
    /// its own `now`.
    pub async fn occurrences(&self, routine: &Routine, window: TimeWindow) -> Result<Vec<Occurrence>> {
        if routine.status == RoutineStatus::Active {
            match self.store.load_horizon(&routine.id).await? {
                None => {
                    self.ensure_materialized(routine, window).await?;
                }
                Some(h) if window.end > h => {
                    self.ensure_materialized(routine, TimeWindow::new(h, window.end))
                        .await?;
                    self.store.save_horizon(&routine.id, window.end).await?;
                }
                Some(_) => {}
            }
        }
        self.stored(routine, window).await
    }

    /// Stored occurrences intersecting `window`. Never materializes.
    pub async fn stored(&self, routine: &Routine, window: TimeWindow) -> Result<Vec<Occurrence>> {
        let lookback = Duration::minutes(routine.schedule.duration_minutes as i64);
        let found = self
            .store
            .load_occurrences_in_window(
                &routine.id,
                TimeWindow::new(window.start - lookback, window.end),
            )
            .await?;
        Ok(found
            .into_iter()
            .filter(|o| window.intersects(o.start, o.end))
            .collect())
    }

    /// Re-derive future occurrences after a schedule edit.
    ///
    /// Only Scheduled records starting at or after `now` are touched: kept
    /// (end adjusted) if still generated, Cancelled otherwise. Past,
    /// InProgress, Completed and Cancelled records are left alone.
    pub async fn rematerialize(
        &self,
        routine: &Routine,
        now: DateTime<Utc>,
    ) -> Result<MaterializeReport> {
        let stored = self.store.load_horizon(&routine.id).await?;
        let target = stored.map_or(now + self.horizon, |h| h.max(now + self.horizon));
        let window = TimeWindow::new(now, target);

        let expected: HashMap<String, OccurrenceWindow> = recurrence::expand(&routine.schedule, window)?
            .filter(|w| w.start >= now)
            .map(|w| (occurrence_id(&routine.id, w.start), w))
            .collect();

        let mut report = MaterializeReport::default();
        for mut occ in self.store.load_occurrences_in_window(&routine.id, window).await? {
            if occ.status != OccurrenceStatus::Scheduled {
                continue;
            }
            match expected.get(&occ.id) {
                Some(w) if w.end != occ.end => {
                    occ.end = w.end;
                    occ.updated_at = now;
                    self.store.save_occurrence(&occ).await?;
                    report.updated += 1;
                }
                Some(_) => {}
                None => {
                    occ.status = OccurrenceStatus::Cancelled;
                    occ.updated_at = now;
                    self.store.save_occurrence(&occ).await?;
                    tracing::info!("🚫 Occurrence {} no longer in schedule, cancelled", occ.id);
                    report.cancelled.push(occ);
                }
            }
        }

        let mut windows: Vec<OccurrenceWindow> = expected.into_values().collect();
        windows.sort();
        for w in windows {
            self.upsert(routine, w, now, &mut report).await?;
        }
        self.store.save_horizon(&routine.id, target).await?;
        Ok(report)
    }

    /// Cancel every Scheduled occurrence starting at or after `now`.
    pub async fn cancel_future(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        let window = TimeWindow::new(now, DateTime::<Utc>::MAX_UTC);
        let mut cancelled = Vec::new();
        for mut occ in self.store.load_occurrences_in_window(routine_id, window).await? {
            if occ.status == OccurrenceStatus::Scheduled {
                occ.status = OccurrenceStatus::Cancelled;
                occ.updated_at = now;
                self.store.save_occurrence(&occ).await?;
                cancelled.push(occ);
            }
        }
        if !cancelled.is_empty() {
            tracing::info!("🚫 Cancelled {} future occurrences of '{}'", cancelled.len(), routine_id);
        }
        Ok(cancelled)
    }

    /// Move occurrences along with time: Scheduled → InProgress → Completed.
    pub async fn advance(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        let window = TimeWindow::new(DateTime::<Utc>::MIN_UTC, now + Duration::seconds(1));
        let mut changed = Vec::new();
        for mut occ in self.store.load_occurrences_in_window(routine_id, window).await? {
            let next = match occ.status {
                OccurrenceStatus::Scheduled | OccurrenceStatus::InProgress if occ.end <= now => {
                    OccurrenceStatus::Completed
                }
                OccurrenceStatus::Scheduled if occ.start <= now => OccurrenceStatus::InProgress,
                _ => continue,
            };
            occ.status = next;
            occ.updated_at = now;
            self.store.save_occurrence(&occ).await?;
            changed.push(occ);
        }
        Ok(changed)
    }

    /// Close occurrences still running when their routine ends.
    pub async fn close_running(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Vec<Occurrence>> {
        let mut closed = Vec::new();
        for mut occ in self.with_status(routine_id, OccurrenceStatus::InProgress).await? {
            occ.status = OccurrenceStatus::Completed;
            occ.updated_at = now;
            self.store.save_occurrence(&occ).await?;
            closed.push(occ);
        }
        Ok(closed)
    }

    pub async fn load(&self, occurrence_id: &str) -> Result<Occurrence> {
        self.store
            .load_occurrence(occurrence_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("occurrence {occurrence_id}")))
    }

    /// All occurrences of a routine in a given status.
    pub async fn with_status(&self, routine_id: &str, status: OccurrenceStatus) -> Result<Vec<Occurrence>> {
        let window = TimeWindow::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC);
        Ok(self
            .store
            .load_occurrences_in_window(routine_id, window)
            .await?
            .into_iter()
            .filter(|o| o.status == status)
            .collect())
    }

    /// The record for a specific start instant, materializing it on demand
    /// when the schedule generates that instant.
    pub async fn materialize_instant(
        &self,
        routine: &Routine,
        start: DateTime<Utc>,
    ) -> Result<Occurrence> {
        if let Some(existing) = self.store.load_occurrence(&occurrence_id(&routine.id, start)).await? {
            return Ok(existing);
        }
        if !recurrence::generates(&routine.schedule, start)? {
            return Err(CadenceError::NotFound(format!(
                "routine {} has no occurrence at {}",
                routine.id, start
            )));
        }
        let window = OccurrenceWindow {
            start,
            end: start + Duration::minutes(routine.schedule.duration_minutes as i64),
        };
        let mut report = MaterializeReport::default();
        self.upsert(routine, window, Utc::now(), &mut report).await
    }

    /// Explicitly mark an occurrence done. Idempotent for Completed.
    pub async fn mark_done(&self, occurrence_id: &str, now: DateTime<Utc>) -> Result<Occurrence> {
        let mut occ = self.load(occurrence_id).await?;
        match occ.status {
            OccurrenceStatus::Completed => return Ok(occ),
            OccurrenceStatus::Cancelled => {
                return Err(CadenceError::Conflict(format!(
                    "occurrence {occurrence_id} is cancelled"
                )));
            }
            OccurrenceStatus::Scheduled | OccurrenceStatus::InProgress => {}
        }
        occ.status = OccurrenceStatus::Completed;
        occ.updated_at = now;
        self.store.save_occurrence(&occ).await?;
        Ok(occ)
    }

    /// Cancel a single occurrence that has not finished. Idempotent for Cancelled.
    pub async fn cancel_one(&self, occurrence_id: &str, now: DateTime<Utc>) -> Result<Occurrence> {
        let mut occ = self.load(occurrence_id).await?;
        match occ.status {
            OccurrenceStatus::Cancelled => return Ok(occ),
            OccurrenceStatus::Completed => {
                return Err(CadenceError::Conflict(format!(
                    "occurrence {occurrence_id} already completed"
                )));
            }
            OccurrenceStatus::Scheduled | OccurrenceStatus::InProgress => {}
        }
        occ.status = OccurrenceStatus::Cancelled;
        occ.updated_at = now;
        self.store.save_occurrence(&occ).await?;
        Ok(occ)
    }
}
