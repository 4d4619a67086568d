//! Scheduler Engine: wires the components together and runs the periodic loop.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).

use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use cadence_core::error::Result;
use cadence_core::traits::{DurableStore, NotificationSender};
use chrono::{DateTime, Utc};

use crate::invitations::InvitationManager;
use crate::lifecycle::{LifecycleController, TickReport};
use crate::occurrences::OccurrenceStore;
use crate::reminders::{ReminderScheduler, ScanReport};
use crate::store::TimedStore;

/// The assembled scheduling core.
pub struct SchedulerEngine {
    pub lifecycle: LifecycleController,
    pub reminders: ReminderScheduler,
    scan_interval: Duration,
}

impl SchedulerEngine {
    /// Build every component on top of `store`. All store calls are bounded
    /// by `store_timeout_secs`.
    pub fn new(
        store: Arc<dyn DurableStore>,
        sender: Arc<dyn NotificationSender>,
        config: &SchedulerConfig,
    ) -> Self {
        let store: Arc<dyn DurableStore> = Arc::new(TimedStore::new(
            store,
            Duration::from_secs(config.store_timeout_secs.max(1)),
        ));
        let occurrences = Arc::new(OccurrenceStore::new(store.clone(), config.horizon_days));
        let invitations = Arc::new(InvitationManager::new(store.clone(), occurrences.clone()));
        let lifecycle = LifecycleController::new(
            store.clone(),
            occurrences.clone(),
            invitations.clone(),
            config,
        );
        let reminders = ReminderScheduler::new(store, occurrences, invitations, sender, config);
        Self {
            lifecycle,
            reminders,
            scan_interval: Duration::from_secs(config.scan_interval_secs.max(1)),
        }
    }

    /// One pass: lifecycle tick, then reminder scan.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(TickReport, ScanReport)> {
        let lifecycle = self.lifecycle.tick(now).await?;
        let scan = self.reminders.scan(now).await?;
        Ok((lifecycle, scan))
    }
}

/// Spawn-able scheduler loop. Runs until the task is dropped.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>) {
    tracing::info!(
        "⏰ Scheduler started (check every {}s)",
        engine.scan_interval.as_secs()
    );

    let mut interval = tokio::time::interval(engine.scan_interval);

    loop {
        interval.tick().await;

        match engine.tick(Utc::now()).await {
            Ok((lifecycle, scan)) => {
                if !lifecycle.completed.is_empty() || scan.due > 0 {
                    tracing::info!(
                        "📣 Tick: {} routines, {} completed, {} reminders delivered",
                        lifecycle.routines,
                        lifecycle.completed.len(),
                        scan.delivered
                    );
                }
                if lifecycle.errors > 0 || scan.errors > 0 {
                    tracing::warn!(
                        "⚠️ {} routines failed the tick and {} the reminder scan, retrying next tick",
                        lifecycle.errors,
                        scan.errors
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("⚠️ Scheduler pass failed, retrying next tick: {e}");
            }
            Err(e) => {
                tracing::error!("💥 Scheduler pass failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{RecordingSender, daily_routine, utc};
    use cadence_core::types::{RecipientScope, ReminderRule, RoutineStatus};

    #[tokio::test]
    async fn test_tick_runs_lifecycle_then_reminders() {
        let mem = Arc::new(MemoryStore::new());
        let sender = Arc::new(RecordingSender::new());
        let config = SchedulerConfig { horizon_days: 7, ..Default::default() };
        let engine = SchedulerEngine::new(mem.clone(), sender.clone(), &config);

        let mut draft = daily_routine(RoutineStatus::Draft);
        draft.reminder_rules.push(ReminderRule::new("r10", 10, RecipientScope::OrganizersOnly));
        let routine = engine.lifecycle.create(draft).await.unwrap();
        engine.lifecycle.activate(&routine.id, utc(2024, 1, 1, 0, 0)).await.unwrap();

        let (lifecycle, scan) = engine.tick(utc(2024, 1, 2, 8, 55)).await.unwrap();
        assert_eq!(lifecycle.routines, 1);
        assert_eq!(lifecycle.advanced, 1);
        assert_eq!(scan.delivered, 1);
        assert_eq!(sender.calls().len(), 1);

        let (_, again) = engine.tick(utc(2024, 1, 2, 8, 56)).await.unwrap();
        assert_eq!(again.delivered, 0);
        assert_eq!(again.skipped_existing, 1);
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let mem = Arc::new(MemoryStore::new());
        let engine = SchedulerEngine::new(mem.clone(), Arc::new(RecordingSender::new()), &SchedulerConfig::default());
        mem.set_unavailable(true);
        let err = engine.tick(utc(2024, 1, 1, 0, 0)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
