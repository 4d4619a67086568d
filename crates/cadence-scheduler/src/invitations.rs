//! Participant invitations: the per-occurrence RSVP state machine.
//!
//! ```text
//! NotInvited ──add/default──► Invited ──RSVP──► Accepted | Declined | Tentative
//!                                                  ▲                       │
//!                                                  └──── re-respond ───────┘
//! ```
//!
//! A state record that is not `overridden` follows the routine-level default
//! of its participant, read at query time. Once a participant answers for a
//! specific occurrence, that record is overridden and default changes no
//! longer reach it.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::DurableStore;
use cadence_core::types::{
    InvitationStatus, Occurrence, OccurrenceStatus, Participant, ParticipantOccurrenceState,
    PartyRef, RecipientScope, Routine, RoutineStatus, TimeWindow,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::occurrences::OccurrenceStore;

/// One line of an occurrence roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub party: PartyRef,
    pub role: String,
    pub optional: bool,
    pub status: InvitationStatus,
    /// True when the participant answered for this occurrence specifically.
    pub overridden: bool,
}

// ─── Participant list edits (pure) ─────────────────────────

/// Add a participant to the routine definition.
/// A NotInvited default is lifted to Invited: being listed means being invited.
pub fn apply_add(routine: &mut Routine, mut participant: Participant) -> Result<()> {
    if routine.participant(&participant.party).is_some() {
        return Err(CadenceError::Validation(format!(
            "{} is already a participant of {}",
            participant.party, routine.id
        )));
    }
    if participant.default_status == InvitationStatus::NotInvited {
        participant.default_status = InvitationStatus::Invited;
    }
    routine.participants.push(participant);
    Ok(())
}

/// Remove a participant from the routine definition.
pub fn apply_remove(routine: &mut Routine, party: &PartyRef) -> Result<Participant> {
    let idx = routine
        .participants
        .iter()
        .position(|p| &p.party == party)
        .ok_or_else(|| CadenceError::NotFound(format!("participant {party} in {}", routine.id)))?;
    Ok(routine.participants.remove(idx))
}

/// Change a participant's routine-level default.
pub fn apply_default(routine: &mut Routine, party: &PartyRef, status: InvitationStatus) -> Result<()> {
    if status == InvitationStatus::NotInvited {
        return Err(CadenceError::Validation(
            "A listed participant cannot default to NotInvited".into(),
        ));
    }
    let participant = routine
        .participants
        .iter_mut()
        .find(|p| &p.party == party)
        .ok_or_else(|| CadenceError::NotFound(format!("participant {party} in {}", routine.id)))?;
    participant.default_status = status;
    Ok(())
}

/// Status a participant effectively has for one occurrence.
pub fn effective_status(
    participant: &Participant,
    state: Option<&ParticipantOccurrenceState>,
) -> InvitationStatus {
    match state {
        Some(s) if s.overridden => s.status,
        _ => participant.default_status,
    }
}

fn in_scope(participant: &Participant, scope: &RecipientScope) -> bool {
    match scope {
        RecipientScope::AllParticipants => true,
        RecipientScope::OrganizersOnly => participant.is_organizer(),
        RecipientScope::Role(role) => participant.role.eq_ignore_ascii_case(role),
    }
}

// ─── Store-backed manager ──────────────────────────────────

/// Owns participant state records. Routine definitions are saved by the
/// lifecycle controller; this only keeps per-occurrence records in step.
pub struct InvitationManager {
    store: Arc<dyn DurableStore>,
    occurrences: Arc<OccurrenceStore>,
}

impl InvitationManager {
    pub fn new(store: Arc<dyn DurableStore>, occurrences: Arc<OccurrenceStore>) -> Self {
        Self { store, occurrences }
    }

    async fn states_by_party(
        &self,
        occurrence_id: &str,
    ) -> Result<HashMap<PartyRef, ParticipantOccurrenceState>> {
        Ok(self
            .store
            .load_participant_states(occurrence_id)
            .await?
            .into_iter()
            .map(|s| (s.party.clone(), s))
            .collect())
    }

    /// Bring non-overridden records of `occurrences` in line with the current
    /// defaults, creating missing ones. `only` narrows it to one participant.
    async fn sync_defaults(
        &self,
        routine: &Routine,
        occurrences: &[Occurrence],
        only: Option<&PartyRef>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut written = 0;
        for occ in occurrences.iter().filter(|o| o.status == OccurrenceStatus::Scheduled) {
            let existing = self.states_by_party(&occ.id).await?;
            for participant in &routine.participants {
                if only.is_some_and(|p| p != &participant.party) {
                    continue;
                }
                let current = existing.get(&participant.party);
                let stale = match current {
                    None => true,
                    Some(s) => !s.overridden && s.status != participant.default_status,
                };
                if !stale {
                    continue;
                }
                let state = ParticipantOccurrenceState {
                    occurrence_id: occ.id.clone(),
                    party: participant.party.clone(),
                    status: participant.default_status,
                    overridden: false,
                    last_updated_at: now,
                };
                self.store.upsert_participant_state(&state).await?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Default records for freshly materialized occurrences.
    pub async fn seed_states(
        &self,
        routine: &Routine,
        occurrences: &[Occurrence],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let written = self.sync_defaults(routine, occurrences, None, now).await?;
        if written > 0 {
            tracing::debug!("👥 Seeded {} invitation states for '{}'", written, routine.id);
        }
        Ok(written)
    }

    /// Push one participant's current default onto every Scheduled occurrence.
    /// Used after adding a participant or changing its default.
    pub async fn propagate_default(
        &self,
        routine: &Routine,
        party: &PartyRef,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let scheduled = self
            .occurrences
            .with_status(&routine.id, OccurrenceStatus::Scheduled)
            .await?;
        let written = self.sync_defaults(routine, &scheduled, Some(party), now).await?;
        tracing::info!(
            "👥 Default for {} on '{}' applied to {} occurrences",
            party,
            routine.id,
            written
        );
        Ok(written)
    }

    /// Drop a removed participant's records, keeping answered history.
    pub async fn purge_removed(&self, routine_id: &str, party: &PartyRef) -> Result<usize> {
        let everything = TimeWindow::new(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC);
        let mut removed = 0;
        for occ in self.store.load_occurrences_in_window(routine_id, everything).await? {
            let states = self.states_by_party(&occ.id).await?;
            let Some(state) = states.get(party) else {
                continue;
            };
            let keep = occ.status != OccurrenceStatus::Scheduled && state.status.is_response();
            if !keep {
                self.store.delete_participant_state(&occ.id, party).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Record an RSVP for the occurrence starting at `occurrence_start`.
    pub async fn respond(
        &self,
        routine: &Routine,
        occurrence_start: DateTime<Utc>,
        party: &PartyRef,
        status: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<ParticipantOccurrenceState> {
        if !status.is_response() {
            return Err(CadenceError::Validation(format!(
                "'{}' is not an RSVP answer",
                status.as_str()
            )));
        }
        if routine.participant(party).is_none() {
            return Err(CadenceError::Validation(format!(
                "{party} is not a participant of {}",
                routine.id
            )));
        }
        if routine.status != RoutineStatus::Active {
            return Err(CadenceError::Conflict(format!(
                "routine {} is {}",
                routine.id,
                routine.status.as_str()
            )));
        }

        let occ = self.occurrences.materialize_instant(routine, occurrence_start).await?;
        if !matches!(occ.status, OccurrenceStatus::Scheduled | OccurrenceStatus::InProgress) {
            return Err(CadenceError::Conflict(format!(
                "occurrence {} is {}",
                occ.id,
                occ.status.as_str()
            )));
        }

        let state = ParticipantOccurrenceState {
            occurrence_id: occ.id.clone(),
            party: party.clone(),
            status,
            overridden: true,
            last_updated_at: now,
        };
        self.store.upsert_participant_state(&state).await?;
        tracing::info!("✉️ {} answered {} for {}", party, status.as_str(), occ.id);
        Ok(state)
    }

    /// Every listed participant with its effective status for `occurrence`.
    pub async fn roster(&self, routine: &Routine, occurrence: &Occurrence) -> Result<Vec<RosterEntry>> {
        let states = self.states_by_party(&occurrence.id).await?;
        Ok(routine
            .participants
            .iter()
            .map(|p| {
                let state = states.get(&p.party);
                RosterEntry {
                    party: p.party.clone(),
                    role: p.role.clone(),
                    optional: p.optional,
                    status: effective_status(p, state),
                    overridden: state.is_some_and(|s| s.overridden),
                }
            })
            .collect())
    }

    /// Who should receive a reminder of `scope` for `occurrence`.
    pub async fn reminder_recipients(
        &self,
        routine: &Routine,
        occurrence: &Occurrence,
        scope: &RecipientScope,
    ) -> Result<Vec<PartyRef>> {
        let states = self.states_by_party(&occurrence.id).await?;
        Ok(routine
            .participants
            .iter()
            .filter(|p| in_scope(p, scope))
            .filter(|p| {
                let status = effective_status(p, states.get(&p.party));
                match status {
                    InvitationStatus::Declined | InvitationStatus::NotInvited => false,
                    InvitationStatus::Invited => !p.optional,
                    InvitationStatus::Accepted | InvitationStatus::Tentative => true,
                }
            })
            .map(|p| p.party.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{alice, bob, daily_routine, utc};

    struct Fixture {
        occurrences: Arc<OccurrenceStore>,
        invitations: InvitationManager,
        routine: Routine,
        created: Vec<Occurrence>,
    }

    async fn fixture() -> Fixture {
        let mem: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let occurrences = Arc::new(OccurrenceStore::new(mem.clone(), 7));
        let invitations = InvitationManager::new(mem, occurrences.clone());
        let routine = daily_routine(RoutineStatus::Active);
        let now = utc(2024, 1, 1, 0, 0);
        let report = occurrences.extend_horizon(&routine, now).await.unwrap();
        invitations.seed_states(&routine, &report.created, now).await.unwrap();
        Fixture { occurrences, invitations, routine, created: report.created }
    }

    fn status_of(roster: &[RosterEntry], party: &PartyRef) -> InvitationStatus {
        roster.iter().find(|e| &e.party == party).unwrap().status
    }

    #[test]
    fn test_apply_add_rejects_duplicates_and_lifts_not_invited() {
        let mut routine = daily_routine(RoutineStatus::Draft);
        let dup = Participant::new(bob(), "Member", InvitationStatus::Accepted);
        assert!(matches!(apply_add(&mut routine, dup), Err(CadenceError::Validation(_))));

        let carol = PartyRef::user("carol");
        apply_add(&mut routine, Participant::new(carol.clone(), "Guest", InvitationStatus::NotInvited)).unwrap();
        assert_eq!(routine.participant(&carol).unwrap().default_status, InvitationStatus::Invited);

        // Same id, different kind is a different party.
        apply_add(&mut routine, Participant::new(PartyRef::team("bob"), "Team", InvitationStatus::Invited)).unwrap();
        assert_eq!(routine.participants.len(), 4);
    }

    #[test]
    fn test_apply_default_rejects_not_invited() {
        let mut routine = daily_routine(RoutineStatus::Draft);
        assert!(matches!(
            apply_default(&mut routine, &bob(), InvitationStatus::NotInvited),
            Err(CadenceError::Validation(_))
        ));
        assert!(matches!(
            apply_default(&mut routine, &PartyRef::user("nobody"), InvitationStatus::Accepted),
            Err(CadenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rsvp_override_survives_default_change() {
        let mut f = fixture().await;
        let third = f.created[2].clone();
        let fourth = f.created[3].clone();
        let now = utc(2024, 1, 1, 1, 0);

        f.invitations
            .respond(&f.routine, third.start, &bob(), InvitationStatus::Declined, now)
            .await
            .unwrap();

        apply_default(&mut f.routine, &bob(), InvitationStatus::Accepted).unwrap();
        f.invitations.propagate_default(&f.routine, &bob(), now).await.unwrap();

        let r3 = f.invitations.roster(&f.routine, &third).await.unwrap();
        assert_eq!(status_of(&r3, &bob()), InvitationStatus::Declined);
        assert!(r3.iter().find(|e| e.party == bob()).unwrap().overridden);

        let r4 = f.invitations.roster(&f.routine, &fourth).await.unwrap();
        assert_eq!(status_of(&r4, &bob()), InvitationStatus::Accepted);
    }

    #[tokio::test]
    async fn test_respond_validations() {
        let f = fixture().await;
        let start = f.created[0].start;
        let now = utc(2024, 1, 1, 1, 0);

        let not_answer = f.invitations.respond(&f.routine, start, &bob(), InvitationStatus::Invited, now).await;
        assert!(matches!(not_answer, Err(CadenceError::Validation(_))));

        let stranger = f
            .invitations
            .respond(&f.routine, start, &PartyRef::user("mallory"), InvitationStatus::Accepted, now)
            .await;
        assert!(matches!(stranger, Err(CadenceError::Validation(_))));

        f.occurrences.cancel_one(&f.created[0].id, now).await.unwrap();
        let cancelled = f.invitations.respond(&f.routine, start, &bob(), InvitationStatus::Accepted, now).await;
        assert!(matches!(cancelled, Err(CadenceError::Conflict(_))));

        let mut draft = f.routine.clone();
        draft.status = RoutineStatus::Draft;
        let inactive = f.invitations.respond(&draft, f.created[1].start, &bob(), InvitationStatus::Accepted, now).await;
        assert!(matches!(inactive, Err(CadenceError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_respond_materializes_beyond_horizon() {
        let f = fixture().await;
        let far = utc(2024, 3, 1, 9, 0);
        let state = f
            .invitations
            .respond(&f.routine, far, &bob(), InvitationStatus::Tentative, utc(2024, 1, 1, 1, 0))
            .await
            .unwrap();
        assert!(state.overridden);
        let occ = f.occurrences.load(&state.occurrence_id).await.unwrap();
        assert_eq!(occ.start, far);

        let off_schedule = f
            .invitations
            .respond(&f.routine, utc(2024, 3, 1, 9, 30), &bob(), InvitationStatus::Accepted, utc(2024, 1, 1, 1, 0))
            .await;
        assert!(matches!(off_schedule, Err(CadenceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_keeps_answered_history() {
        let f = fixture().await;
        let now = utc(2024, 1, 1, 1, 0);
        let first = f.created[0].clone();
        let second = f.created[1].clone();
        f.invitations.respond(&f.routine, first.start, &bob(), InvitationStatus::Accepted, now).await.unwrap();
        f.invitations.respond(&f.routine, second.start, &bob(), InvitationStatus::Accepted, now).await.unwrap();
        f.occurrences.advance(&f.routine.id, utc(2024, 1, 1, 12, 0)).await.unwrap();

        let removed = f.invitations.purge_removed(&f.routine.id, &bob()).await.unwrap();
        // Everything except the answered, already completed first occurrence.
        assert_eq!(removed, f.created.len() - 1);

        let kept = f.invitations.states_by_party(&first.id).await.unwrap();
        assert_eq!(kept.get(&bob()).unwrap().status, InvitationStatus::Accepted);
        let gone = f.invitations.states_by_party(&second.id).await.unwrap();
        assert!(!gone.contains_key(&bob()));
    }

    #[tokio::test]
    async fn test_reminder_recipients_filtering() {
        let mut f = fixture().await;
        let occ = f.created[0].clone();
        let now = utc(2024, 1, 1, 1, 0);
        let carol = PartyRef::user("carol");
        let dave = PartyRef::user("dave");
        apply_add(&mut f.routine, Participant::new(carol.clone(), "Guest", InvitationStatus::Invited).optional()).unwrap();
        apply_add(&mut f.routine, Participant::new(dave.clone(), "Guest", InvitationStatus::Invited).optional()).unwrap();
        f.invitations.respond(&f.routine, occ.start, &dave, InvitationStatus::Tentative, now).await.unwrap();

        let all = f
            .invitations
            .reminder_recipients(&f.routine, &occ, &RecipientScope::AllParticipants)
            .await
            .unwrap();
        assert_eq!(all, vec![alice(), bob(), dave.clone()]);

        f.invitations.respond(&f.routine, occ.start, &bob(), InvitationStatus::Declined, now).await.unwrap();
        let organizers = f
            .invitations
            .reminder_recipients(&f.routine, &occ, &RecipientScope::OrganizersOnly)
            .await
            .unwrap();
        assert_eq!(organizers, vec![alice()]);
        let guests = f
            .invitations
            .reminder_recipients(&f.routine, &occ, &RecipientScope::Role("guest".into()))
            .await
            .unwrap();
        assert_eq!(guests, vec![dave]);
    }

    #[tokio::test]
    async fn test_roster_includes_unresponded_and_optional() {
        let mut f = fixture().await;
        let carol = PartyRef::user("carol");
        apply_add(&mut f.routine, Participant::new(carol.clone(), "Guest", InvitationStatus::Invited).optional()).unwrap();
        let roster = f.invitations.roster(&f.routine, &f.created[0]).await.unwrap();
        assert_eq!(roster.len(), 3);
        assert_eq!(status_of(&roster, &alice()), InvitationStatus::Accepted);
        assert_eq!(status_of(&roster, &bob()), InvitationStatus::Invited);
        assert!(roster.iter().find(|e| e.party == carol).unwrap().optional);
    }
}
