//! Shared fixtures for the scheduler's unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::NotificationSender;
use cadence_core::types::{
    InvitationStatus, Occurrence, Participant, PartyRef, RecurrenceRule, ReminderRule, Routine,
    RoutineStatus, Schedule,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn alice() -> PartyRef {
    PartyRef::user("alice")
}

pub fn bob() -> PartyRef {
    PartyRef::user("bob")
}

/// Daily 09:00-10:00 UTC from 2024-01-01, organized by alice, bob invited.
pub fn daily_routine(status: RoutineStatus) -> Routine {
    let start = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap();
    let schedule = Schedule::recurring(start, 60, "UTC", RecurrenceRule::daily(1));
    let mut routine = Routine::new("Standup", alice(), schedule);
    routine.participants = vec![
        Participant::organizer(alice()),
        Participant::new(bob(), "Member", InvitationStatus::Invited),
    ];
    routine.status = status;
    routine
}

/// Sender that records every call and fails on request.
#[derive(Default)]
pub struct RecordingSender {
    calls: Mutex<Vec<(PartyRef, String, String)>>,
    fail_remaining: AtomicU32,
    failing: Mutex<HashSet<PartyRef>>,
    hanging: Mutex<HashSet<PartyRef>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends, whoever they are for.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Always fail sends to `party`.
    pub fn fail_for(&self, party: PartyRef) {
        self.failing.lock().unwrap().insert(party);
    }

    /// Never complete sends to `party`.
    pub fn hang_for(&self, party: PartyRef) {
        self.hanging.lock().unwrap().insert(party);
    }

    /// (party, occurrence id, rule id) of every attempted send.
    pub fn calls(&self) -> Vec<(PartyRef, String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, recipient: &PartyRef, occurrence: &Occurrence, rule: &ReminderRule) -> Result<()> {
        self.calls.lock().unwrap().push((
            recipient.clone(),
            occurrence.id.clone(),
            rule.id.clone(),
        ));
        let hang = self.hanging.lock().unwrap().contains(recipient);
        if hang {
            std::future::pending::<()>().await;
        }
        if self.failing.lock().unwrap().contains(recipient) {
            return Err(CadenceError::Delivery(format!("{recipient} unreachable")));
        }
        let failed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CadenceError::Delivery("injected failure".into()));
        }
        Ok(())
    }
}
