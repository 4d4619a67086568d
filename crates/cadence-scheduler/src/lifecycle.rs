//! Routine lifecycle: status transitions, versioned edits and the periodic tick.
//!
//! ```text
//! Draft ──activate──► Active ──cancel───► Cancelled
//!                        └────complete──► Completed
//! ```
//!
//! Every mutation of a routine runs under that routine's lock and saves with
//! an optimistic version check. A conflicting writer elsewhere causes a
//! reload and re-apply, up to `max_edit_retries` times.

use std::collections::HashSet;
use std::sync::Arc;

use cadence_core::config::SchedulerConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::DurableStore;
use cadence_core::types::{
    InvitationStatus, Occurrence, OccurrenceStatus, Participant, ParticipantOccurrenceState,
    PartyRef, RecurrenceRule, ReminderRule, Routine, RoutineStatus, Schedule, ScheduleType,
    TaskState, TaskStatus, TaskTemplate, TimeWindow,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invitations::{self, InvitationManager, RosterEntry};
use crate::locks::RoutineLocks;
use crate::occurrences::OccurrenceStore;
use crate::recurrence;
use crate::tasks::{OccurrenceTask, TaskTracker};

/// Partial schedule change. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleEdit {
    pub schedule_type: Option<ScheduleType>,
    pub start_local: Option<NaiveDateTime>,
    pub duration_minutes: Option<u32>,
    pub timezone: Option<String>,
    /// `Some(None)` removes the rule.
    pub rule: Option<Option<RecurrenceRule>>,
    /// `Some(None)` removes the end.
    pub end_local: Option<Option<NaiveDateTime>>,
}

impl ScheduleEdit {
    pub fn apply(&self, schedule: &Schedule) -> Schedule {
        let mut next = schedule.clone();
        if let Some(t) = self.schedule_type {
            next.schedule_type = t;
        }
        if let Some(start) = self.start_local {
            next.start_local = start;
        }
        if let Some(minutes) = self.duration_minutes {
            next.duration_minutes = minutes;
        }
        if let Some(tz) = &self.timezone {
            next.timezone = tz.clone();
        }
        if let Some(rule) = &self.rule {
            next.rule = rule.clone();
        }
        if let Some(end) = self.end_local {
            next.end_local = end;
        }
        next
    }
}

/// What one lifecycle tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub routines: usize,
    pub materialized: usize,
    /// Routines whose pending schedule edit was applied to their occurrences.
    pub rematerialized: usize,
    pub advanced: usize,
    /// Bounded routines that finished during this tick.
    pub completed: Vec<String>,
    pub errors: usize,
}

/// Check a routine definition as a whole.
pub fn validate_routine(routine: &Routine) -> Result<()> {
    if routine.title.values().all(|t| t.trim().is_empty()) {
        return Err(CadenceError::Validation("Routine title is required".into()));
    }
    recurrence::validate(&routine.schedule)?;

    let mut parties = HashSet::new();
    for p in &routine.participants {
        if !parties.insert(&p.party) {
            return Err(CadenceError::Validation(format!("Duplicate participant {}", p.party)));
        }
    }
    let mut rules = HashSet::new();
    for r in &routine.reminder_rules {
        if !rules.insert(r.id.as_str()) {
            return Err(CadenceError::Validation(format!("Duplicate reminder rule '{}'", r.id)));
        }
    }
    let mut tasks = HashSet::new();
    for t in &routine.tasks {
        if !tasks.insert(t.id.as_str()) {
            return Err(CadenceError::Validation(format!("Duplicate task '{}'", t.id)));
        }
    }
    Ok(())
}

fn require_status(routine: &Routine, allowed: &[RoutineStatus], action: &str) -> Result<()> {
    if allowed.contains(&routine.status) {
        Ok(())
    } else {
        Err(CadenceError::Conflict(format!(
            "cannot {action} routine {} while {}",
            routine.id,
            routine.status.as_str()
        )))
    }
}

/// Gate for every routine mutation.
pub struct LifecycleController {
    store: Arc<dyn DurableStore>,
    occurrences: Arc<OccurrenceStore>,
    invitations: Arc<InvitationManager>,
    tasks: TaskTracker,
    locks: RoutineLocks,
    max_edit_retries: u32,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn DurableStore>,
        occurrences: Arc<OccurrenceStore>,
        invitations: Arc<InvitationManager>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            tasks: TaskTracker::new(store.clone()),
            store,
            occurrences,
            invitations,
            locks: RoutineLocks::new(),
            max_edit_retries: config.max_edit_retries,
        }
    }

    /// Load, mutate and save with a version check, re-applying on conflict.
    /// Callers hold the routine lock.
    async fn versioned<F>(&self, routine_id: &str, mut mutate: F) -> Result<Routine>
    where
        F: FnMut(&mut Routine) -> Result<()> + Send,
    {
        let mut attempt = 0;
        loop {
            let mut routine = self.store.load_routine(routine_id).await?;
            let expected = routine.version;
            mutate(&mut routine)?;
            routine.updated_at = Utc::now();
            match self.store.save_routine(&routine, expected).await {
                Ok(version) => {
                    routine.version = version;
                    return Ok(routine);
                }
                Err(CadenceError::VersionConflict { actual, .. }) if attempt < self.max_edit_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "🔁 Version conflict on '{}' (expected {}, found {}), retry {}/{}",
                        routine_id,
                        expected,
                        actual,
                        attempt,
                        self.max_edit_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Creation & reads ─────────────────────────────────

    /// Store a new routine as Draft.
    pub async fn create(&self, mut routine: Routine) -> Result<Routine> {
        if routine.status != RoutineStatus::Draft || routine.version != 0 {
            return Err(CadenceError::Validation(
                "New routines must be unsaved drafts".into(),
            ));
        }
        for p in routine.participants.iter_mut() {
            if p.default_status == InvitationStatus::NotInvited {
                p.default_status = InvitationStatus::Invited;
            }
        }
        validate_routine(&routine)?;
        routine.version = self.store.save_routine(&routine, 0).await?;
        tracing::info!("📝 Routine created: '{}' ({})", routine.title_in("en").unwrap_or_default(), routine.id);
        Ok(routine)
    }

    pub async fn load(&self, routine_id: &str) -> Result<Routine> {
        self.store.load_routine(routine_id).await
    }

    /// Occurrences of a routine intersecting `window`.
    pub async fn occurrences(&self, routine_id: &str, window: TimeWindow) -> Result<Vec<Occurrence>> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self.store.load_routine(routine_id).await?;
        self.occurrences.occurrences(&routine, window).await
    }

    async fn owned_occurrence(&self, routine: &Routine, occurrence_id: &str) -> Result<Occurrence> {
        let occ = self.occurrences.load(occurrence_id).await?;
        if occ.routine_id != routine.id {
            return Err(CadenceError::NotFound(format!(
                "occurrence {occurrence_id} in {}",
                routine.id
            )));
        }
        Ok(occ)
    }

    pub async fn roster(&self, routine_id: &str, occurrence_id: &str) -> Result<Vec<RosterEntry>> {
        let routine = self.store.load_routine(routine_id).await?;
        let occ = self.owned_occurrence(&routine, occurrence_id).await?;
        self.invitations.roster(&routine, &occ).await
    }

    // ── Status transitions ───────────────────────────────

    pub async fn activate(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self
            .versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Draft], "activate")?;
                let has_organizer = r
                    .participants
                    .iter()
                    .any(|p| p.is_organizer() && p.default_status == InvitationStatus::Accepted);
                if !has_organizer {
                    return Err(CadenceError::Conflict(format!(
                        "routine {} needs an accepted organizer before activation",
                        r.id
                    )));
                }
                validate_routine(r)?;
                r.status = RoutineStatus::Active;
                Ok(())
            })
            .await?;

        let report = self.occurrences.extend_horizon(&routine, now).await?;
        self.invitations.seed_states(&routine, &report.created, now).await?;
        tracing::info!("▶️ Routine activated: {} ({} occurrences)", routine.id, report.created.len());
        Ok(routine)
    }

    /// Cancel an active routine and its future occurrences. Repeating the
    /// call on a cancelled routine only re-runs the occurrence cleanup.
    pub async fn cancel(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let current = self.store.load_routine(routine_id).await?;
        let routine = if current.status == RoutineStatus::Cancelled {
            current
        } else {
            self.versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Active], "cancel")?;
                r.status = RoutineStatus::Cancelled;
                Ok(())
            })
            .await?
        };
        self.occurrences.advance(routine_id, now).await?;
        self.occurrences.close_running(routine_id, now).await?;
        let cancelled = self.occurrences.cancel_future(routine_id, now).await?;
        tracing::info!("⏹️ Routine cancelled: {} ({} future occurrences)", routine_id, cancelled.len());
        Ok(routine)
    }

    /// Complete an active routine. Bounded series must have finished;
    /// open-ended ones are closed manually and lose their future occurrences.
    pub async fn complete(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let current = self.store.load_routine(routine_id).await?;
        if current.status == RoutineStatus::Completed {
            return Ok(current);
        }
        require_status(&current, &[RoutineStatus::Active], "complete")?;
        if let Some(last) = recurrence::last_occurrence(&current.schedule)?
            && last.end > now
        {
            return Err(CadenceError::Conflict(format!(
                "routine {} still has occurrences until {}",
                routine_id, last.end
            )));
        }
        self.finish(routine_id, now).await
    }

    async fn finish(&self, routine_id: &str, now: DateTime<Utc>) -> Result<Routine> {
        let routine = self
            .versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Active], "complete")?;
                r.status = RoutineStatus::Completed;
                Ok(())
            })
            .await?;
        self.occurrences.advance(routine_id, now).await?;
        self.occurrences.close_running(routine_id, now).await?;
        self.occurrences.cancel_future(routine_id, now).await?;
        tracing::info!("🏁 Routine completed: {}", routine_id);
        Ok(routine)
    }

    // ── Edits ────────────────────────────────────────────

    /// Change the schedule. For an active routine the new schedule is saved
    /// together with a pending marker first; stored occurrences are then
    /// re-derived. If that fails transiently the edit stands and the next
    /// tick finishes it.
    pub async fn edit_schedule(
        &self,
        routine_id: &str,
        edit: ScheduleEdit,
        now: DateTime<Utc>,
    ) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self
            .versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Draft, RoutineStatus::Active], "edit")?;
                let schedule = edit.apply(&r.schedule);
                recurrence::validate(&schedule)?;
                r.schedule = schedule;
                if r.status == RoutineStatus::Active {
                    r.rematerialize_pending = true;
                }
                Ok(())
            })
            .await?;

        if !routine.rematerialize_pending {
            return Ok(routine);
        }
        match self.rederive(&routine, now).await {
            Ok(done) => Ok(done),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    "⚠️ Schedule of '{}' saved, occurrences follow on the next tick: {e}",
                    routine.id
                );
                Ok(routine)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-derive stored occurrences from the saved schedule, then clear the
    /// pending marker. Callers hold the routine lock.
    async fn rederive(&self, routine: &Routine, now: DateTime<Utc>) -> Result<Routine> {
        let report = self.occurrences.rematerialize(routine, now).await?;
        self.invitations.seed_states(routine, &report.created, now).await?;
        let cleared = self
            .versioned(&routine.id, |r| {
                // A newer schedule saved meanwhile still needs its own pass.
                if r.schedule == routine.schedule {
                    r.rematerialize_pending = false;
                }
                Ok(())
            })
            .await?;
        tracing::info!(
            "✏️ Occurrences of '{}' re-derived: {} new, {} cancelled, {} adjusted",
            routine.id,
            report.created.len(),
            report.cancelled.len(),
            report.updated
        );
        Ok(cleared)
    }

    pub async fn add_participant(
        &self,
        routine_id: &str,
        participant: Participant,
        now: DateTime<Utc>,
    ) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let party = participant.party.clone();
        let routine = self
            .versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Draft, RoutineStatus::Active], "add participants to")?;
                invitations::apply_add(r, participant.clone())
            })
            .await?;
        if routine.status == RoutineStatus::Active {
            self.invitations.propagate_default(&routine, &party, now).await?;
        }
        Ok(routine)
    }

    pub async fn remove_participant(&self, routine_id: &str, party: &PartyRef) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self
            .versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Draft, RoutineStatus::Active], "remove participants from")?;
                invitations::apply_remove(r, party).map(|_| ())
            })
            .await?;
        let purged = self.invitations.purge_removed(routine_id, party).await?;
        tracing::info!("👋 {} removed from '{}' ({} states dropped)", party, routine_id, purged);
        Ok(routine)
    }

    pub async fn set_default_status(
        &self,
        routine_id: &str,
        party: &PartyRef,
        status: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self
            .versioned(routine_id, |r| {
                require_status(r, &[RoutineStatus::Draft, RoutineStatus::Active], "change defaults of")?;
                invitations::apply_default(r, party, status)
            })
            .await?;
        if routine.status == RoutineStatus::Active {
            self.invitations.propagate_default(&routine, party, now).await?;
        }
        Ok(routine)
    }

    /// RSVP of `party` for the occurrence starting at `occurrence_start`.
    pub async fn respond(
        &self,
        routine_id: &str,
        occurrence_start: DateTime<Utc>,
        party: &PartyRef,
        status: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<ParticipantOccurrenceState> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self.store.load_routine(routine_id).await?;
        self.invitations
            .respond(&routine, occurrence_start, party, status, now)
            .await
    }

    pub async fn add_reminder_rule(&self, routine_id: &str, rule: ReminderRule) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        self.versioned(routine_id, |r| {
            require_status(r, &[RoutineStatus::Draft, RoutineStatus::Active], "add reminders to")?;
            if r.reminder_rule(&rule.id).is_some() {
                return Err(CadenceError::Validation(format!("Duplicate reminder rule '{}'", rule.id)));
            }
            r.reminder_rules.push(rule.clone());
            Ok(())
        })
        .await
    }

    pub async fn remove_reminder_rule(&self, routine_id: &str, rule_id: &str) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        self.versioned(routine_id, |r| {
            let before = r.reminder_rules.len();
            r.reminder_rules.retain(|rule| rule.id != rule_id);
            if r.reminder_rules.len() == before {
                return Err(CadenceError::NotFound(format!("reminder rule {rule_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn add_task(&self, routine_id: &str, task: TaskTemplate) -> Result<Routine> {
        let _guard = self.locks.acquire(routine_id).await;
        self.versioned(routine_id, |r| {
            require_status(r, &[RoutineStatus::Draft, RoutineStatus::Active], "add tasks to")?;
            if r.tasks.iter().any(|t| t.id == task.id) {
                return Err(CadenceError::Validation(format!("Duplicate task '{}'", task.id)));
            }
            r.tasks.push(task.clone());
            Ok(())
        })
        .await
    }

    // ── Single occurrences ───────────────────────────────

    pub async fn complete_occurrence(
        &self,
        routine_id: &str,
        occurrence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Occurrence> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self.store.load_routine(routine_id).await?;
        self.owned_occurrence(&routine, occurrence_id).await?;
        self.occurrences.mark_done(occurrence_id, now).await
    }

    pub async fn cancel_occurrence(
        &self,
        routine_id: &str,
        occurrence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Occurrence> {
        let _guard = self.locks.acquire(routine_id).await;
        let routine = self.store.load_routine(routine_id).await?;
        self.owned_occurrence(&routine, occurrence_id).await?;
        let occ = self.occurrences.cancel_one(occurrence_id, now).await?;
        tracing::info!("🚫 Occurrence {} of '{}' cancelled", occurrence_id, routine_id);
        Ok(occ)
    }

    pub async fn tasks_for_occurrence(
        &self,
        routine_id: &str,
        occurrence_id: &str,
    ) -> Result<Vec<OccurrenceTask>> {
        let routine = self.store.load_routine(routine_id).await?;
        let occ = self.owned_occurrence(&routine, occurrence_id).await?;
        self.tasks.tasks_for_occurrence(&routine, &occ).await
    }

    pub async fn set_task_status(
        &self,
        routine_id: &str,
        occurrence_id: &str,
        task_id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<TaskState> {
        let routine = self.store.load_routine(routine_id).await?;
        let occ = self.owned_occurrence(&routine, occurrence_id).await?;
        self.tasks.set_task_status(&routine, &occ, task_id, status, now).await
    }

    // ── Periodic tick ────────────────────────────────────

    /// Extend horizons, advance occurrence statuses and close finished
    /// bounded series for every active routine. One failing routine does
    /// not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        for routine_id in self.store.list_routine_ids(RoutineStatus::Active).await? {
            report.routines += 1;
            let _guard = self.locks.acquire(&routine_id).await;
            if let Err(e) = self.tick_routine(&routine_id, now, &mut report).await {
                report.errors += 1;
                match e {
                    CadenceError::InvariantViolation(_) => {
                        tracing::error!("💥 Tick failed for '{}': {e}", routine_id)
                    }
                    _ => tracing::warn!("⚠️ Tick failed for '{}': {e}", routine_id),
                }
            }
        }
        Ok(report)
    }

    async fn tick_routine(&self, routine_id: &str, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let mut routine = self.store.load_routine(routine_id).await?;
        if routine.status != RoutineStatus::Active {
            return Ok(());
        }
        if routine.rematerialize_pending {
            routine = self.rederive(&routine, now).await?;
            report.rematerialized += 1;
        }
        let extended = self.occurrences.extend_horizon(&routine, now).await?;
        report.materialized += extended.created.len();

        let scheduled = self
            .occurrences
            .with_status(routine_id, OccurrenceStatus::Scheduled)
            .await?;
        self.invitations.seed_states(&routine, &scheduled, now).await?;

        report.advanced += self.occurrences.advance(routine_id, now).await?.len();

        if let Some(last) = recurrence::last_occurrence(&routine.schedule)?
            && last.end <= now
        {
            self.finish(routine_id, now).await?;
            report.completed.push(routine_id.to_string());
        }
        Ok(())
    }
}
