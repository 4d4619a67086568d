//! Reminder scan: finds due (rule, occurrence, recipient) tuples and
//! dispatches each exactly once.
//!
//! A receipt is written only after a successful send, so a crash between
//! send and receipt can at worst repeat one reminder; it never loses one.
//! Failed sends leave no receipt and are retried on the next scan until
//! `max_dispatch_attempts`, after which a `Failed` receipt closes the tuple.
//! Attempt counts live in process memory, so a restart grants a fresh set.
//!
//! The scan only reads stored occurrences. Materialization belongs to the
//! lifecycle tick, which runs under the routine lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use cadence_core::config::SchedulerConfig;
use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::{DurableStore, NotificationSender, ReceiptWrite};
use cadence_core::types::{
    DeliveryResult, Occurrence, OccurrenceStatus, PartyRef, ReceiptKey, ReminderReceipt,
    ReminderRule, RoutineStatus, TimeWindow,
};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};

use crate::invitations::InvitationManager;
use crate::occurrences::OccurrenceStore;
use crate::recurrence;

/// One reminder that should go out now.
#[derive(Debug, Clone)]
pub struct DueReminder {
    pub routine_id: String,
    pub occurrence: Occurrence,
    pub rule: ReminderRule,
    pub recipient: PartyRef,
}

impl DueReminder {
    pub fn key(&self) -> ReceiptKey {
        ReceiptKey {
            rule_id: self.rule.id.clone(),
            occurrence_id: self.occurrence.id.clone(),
            party: self.recipient.clone(),
        }
    }
}

/// Tuples collected by one pass over the active routines.
#[derive(Debug, Default)]
pub struct DueList {
    pub reminders: Vec<DueReminder>,
    pub skipped_existing: usize,
    /// Routines that could not be read this pass.
    pub errors: usize,
}

/// Outcome counters of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub due: usize,
    pub delivered: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    pub errors: usize,
    /// Tuples that exhausted their attempts during this scan.
    pub escalated: Vec<ReceiptKey>,
}

enum Dispatch {
    Delivered,
    Duplicate,
    Failed,
    Escalated(ReceiptKey),
}

pub struct ReminderScheduler {
    store: Arc<dyn DurableStore>,
    occurrences: Arc<OccurrenceStore>,
    invitations: Arc<InvitationManager>,
    sender: Arc<dyn NotificationSender>,
    dispatch_timeout: StdDuration,
    max_concurrent: usize,
    max_attempts: u32,
    lookback: Duration,
    attempts: Mutex<HashMap<ReceiptKey, u32>>,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        occurrences: Arc<OccurrenceStore>,
        invitations: Arc<InvitationManager>,
        sender: Arc<dyn NotificationSender>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            occurrences,
            invitations,
            sender,
            dispatch_timeout: StdDuration::from_secs(config.dispatch_timeout_secs.max(1)),
            max_concurrent: config.max_concurrent_dispatches.max(1),
            max_attempts: config.max_dispatch_attempts.max(1),
            lookback: Duration::hours(config.reminder_lookback_hours as i64),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Tuples due at `now` that have no receipt yet. A routine whose reads
    /// fail is skipped and counted; the others are unaffected.
    pub async fn due_reminders(&self, now: DateTime<Utc>) -> Result<DueList> {
        let mut list = DueList::default();
        for routine_id in self.store.list_routine_ids(RoutineStatus::Active).await? {
            if let Err(e) = self.due_for_routine(&routine_id, now, &mut list).await {
                list.errors += 1;
                match e {
                    CadenceError::InvariantViolation(_) => {
                        tracing::error!("💥 Reminder scan failed for '{}': {e}", routine_id)
                    }
                    _ => tracing::warn!("⚠️ Skipping routine '{}' this scan: {e}", routine_id),
                }
            }
        }
        Ok(list)
    }

    async fn due_for_routine(
        &self,
        routine_id: &str,
        now: DateTime<Utc>,
        list: &mut DueList,
    ) -> Result<()> {
        let routine = self.store.load_routine(routine_id).await?;
        let Some(max_lead) = routine.reminder_rules.iter().map(|r| r.lead_minutes).max() else {
            return Ok(());
        };
        let window = TimeWindow::new(
            now - self.lookback,
            now + Duration::minutes(max_lead as i64) + Duration::seconds(1),
        );

        let mut due = Vec::new();
        let mut skipped = 0;
        for occ in self.occurrences.stored(&routine, window).await? {
            if !matches!(occ.status, OccurrenceStatus::Scheduled | OccurrenceStatus::InProgress)
                || occ.end <= now
            {
                continue;
            }
            // Records not yet re-derived after an edit may belong to the old schedule.
            if routine.rematerialize_pending
                && !recurrence::generates(&routine.schedule, occ.start)?
            {
                continue;
            }
            for rule in &routine.reminder_rules {
                if now < occ.start - Duration::minutes(rule.lead_minutes as i64) {
                    continue;
                }
                let recipients = self
                    .invitations
                    .reminder_recipients(&routine, &occ, &rule.scope)
                    .await?;
                for recipient in recipients {
                    let item = DueReminder {
                        routine_id: routine.id.clone(),
                        occurrence: occ.clone(),
                        rule: rule.clone(),
                        recipient,
                    };
                    if self.store.has_receipt(&item.key()).await? {
                        skipped += 1;
                    } else {
                        due.push(item);
                    }
                }
            }
        }
        list.reminders.extend(due);
        list.skipped_existing += skipped;
        Ok(())
    }

    /// Run one scan: compute due tuples and dispatch them concurrently.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let list = self.due_reminders(now).await?;
        if list.errors == 0 {
            self.prune(&list.reminders);
        }
        let mut report = ScanReport {
            due: list.reminders.len(),
            skipped_existing: list.skipped_existing,
            errors: list.errors,
            ..Default::default()
        };
        if list.reminders.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Dispatch> = stream::iter(list.reminders)
            .map(|item| self.dispatch(item, now))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Dispatch::Delivered => report.delivered += 1,
                Dispatch::Duplicate => report.skipped_existing += 1,
                Dispatch::Failed => report.failed += 1,
                Dispatch::Escalated(key) => report.escalated.push(key),
            }
        }
        tracing::info!(
            "🔔 Reminder scan: {} due, {} delivered, {} failed, {} escalated",
            report.due,
            report.delivered,
            report.failed,
            report.escalated.len()
        );
        Ok(report)
    }

    async fn dispatch(&self, item: DueReminder, now: DateTime<Utc>) -> Dispatch {
        let key = item.key();
        let sent = match tokio::time::timeout(
            self.dispatch_timeout,
            self.sender.send(&item.recipient, &item.occurrence, &item.rule),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CadenceError::Delivery(format!(
                "{} timed out after {:?}",
                self.sender.name(),
                self.dispatch_timeout
            ))),
        };

        match sent {
            Ok(()) => {
                self.forget(&key);
                let receipt = ReminderReceipt {
                    key,
                    dispatched_at: now,
                    result: DeliveryResult::Delivered,
                };
                match self.store.write_receipt_if_absent(&receipt).await {
                    Ok(ReceiptWrite::Written) => {
                        tracing::debug!(
                            "📨 Reminder '{}' sent to {} for {}",
                            item.rule.id,
                            item.recipient,
                            item.occurrence.id
                        );
                        Dispatch::Delivered
                    }
                    Ok(ReceiptWrite::AlreadyExists) => Dispatch::Duplicate,
                    Err(e) => {
                        tracing::warn!("⚠️ Reminder sent but receipt not stored ({}): {e}", item.occurrence.id);
                        Dispatch::Failed
                    }
                }
            }
            Err(e) => self.record_failure(item, key, e, now).await,
        }
    }

    async fn record_failure(
        &self,
        item: DueReminder,
        key: ReceiptKey,
        error: CadenceError,
        now: DateTime<Utc>,
    ) -> Dispatch {
        let attempts = {
            let mut table = self
                .attempts
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let n = table.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };

        if attempts < self.max_attempts {
            tracing::warn!(
                "⚠️ Reminder to {} for {} failed (attempt {}/{}): {error}",
                item.recipient,
                item.occurrence.id,
                attempts,
                self.max_attempts
            );
            return Dispatch::Failed;
        }

        tracing::error!(
            "🚨 Reminder '{}' to {} for {} abandoned after {} attempts: {error}",
            item.rule.id,
            item.recipient,
            item.occurrence.id,
            attempts
        );
        let receipt = ReminderReceipt {
            key: key.clone(),
            dispatched_at: now,
            result: DeliveryResult::Failed(error.to_string()),
        };
        match self.store.write_receipt_if_absent(&receipt).await {
            Ok(_) => {
                self.forget(&key);
                Dispatch::Escalated(key)
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not record abandoned reminder: {e}");
                Dispatch::Failed
            }
        }
    }

    /// Drop attempt counts of tuples that are no longer due.
    fn prune(&self, due: &[DueReminder]) {
        let live: HashSet<ReceiptKey> = due.iter().map(DueReminder::key).collect();
        if let Ok(mut table) = self.attempts.lock() {
            table.retain(|key, _| live.contains(key));
        }
    }

    fn forget(&self, key: &ReceiptKey) {
        if let Ok(mut table) = self.attempts.lock() {
            table.remove(key);
        }
    }
}
