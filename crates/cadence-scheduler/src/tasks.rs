//! Per-occurrence tasks: a routine's task templates instantiated for one occurrence.

use std::sync::Arc;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::DurableStore;
use cadence_core::types::{
    DueAnchor, Occurrence, OccurrenceStatus, Routine, TaskState, TaskStatus, TaskTemplate,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A task template resolved against a concrete occurrence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OccurrenceTask {
    pub template: TaskTemplate,
    pub occurrence_id: String,
    pub due_at: DateTime<Utc>,
    pub status: TaskStatus,
}

/// When a template falls due for `occurrence`.
pub fn due_at(template: &TaskTemplate, occurrence: &Occurrence) -> DateTime<Utc> {
    let anchor = match template.due.anchor {
        DueAnchor::Start => occurrence.start,
        DueAnchor::End => occurrence.end,
    };
    anchor + Duration::minutes(template.due.offset_minutes)
}

pub struct TaskTracker {
    store: Arc<dyn DurableStore>,
}

impl TaskTracker {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Every template of `routine` with its due moment and effective status.
    /// Without a recorded state a task is Pending, or Skipped on a cancelled occurrence.
    pub async fn tasks_for_occurrence(
        &self,
        routine: &Routine,
        occurrence: &Occurrence,
    ) -> Result<Vec<OccurrenceTask>> {
        let states = self.store.load_task_states(&occurrence.id).await?;
        Ok(routine
            .tasks
            .iter()
            .map(|t| {
                let recorded = states.iter().find(|s| s.task_id == t.id).map(|s| s.status);
                let status = recorded.unwrap_or(if occurrence.status == OccurrenceStatus::Cancelled {
                    TaskStatus::Skipped
                } else {
                    TaskStatus::Pending
                });
                OccurrenceTask {
                    template: t.clone(),
                    occurrence_id: occurrence.id.clone(),
                    due_at: due_at(t, occurrence),
                    status,
                }
            })
            .collect())
    }

    /// Record a task's status for one occurrence.
    pub async fn set_task_status(
        &self,
        routine: &Routine,
        occurrence: &Occurrence,
        task_id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<TaskState> {
        if occurrence.routine_id != routine.id {
            return Err(CadenceError::Validation(format!(
                "occurrence {} does not belong to {}",
                occurrence.id, routine.id
            )));
        }
        if !routine.tasks.iter().any(|t| t.id == task_id) {
            return Err(CadenceError::NotFound(format!("task {task_id} in {}", routine.id)));
        }
        let state = TaskState {
            occurrence_id: occurrence.id.clone(),
            task_id: task_id.to_string(),
            status,
            updated_at: now,
        };
        self.store.upsert_task_state(&state).await?;
        tracing::info!("✅ Task '{}' on {} → {:?}", task_id, occurrence.id, status);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occurrences::OccurrenceStore;
    use crate::store::MemoryStore;
    use crate::testing::{daily_routine, utc};
    use cadence_core::types::{DueCondition, RoutineStatus, TaskAssignee};

    fn agenda_task() -> TaskTemplate {
        TaskTemplate {
            id: "agenda".into(),
            title: "Share agenda".into(),
            description: String::new(),
            assignee: TaskAssignee::Role("Organizer".into()),
            due: DueCondition { anchor: DueAnchor::Start, offset_minutes: -30 },
        }
    }

    fn notes_task() -> TaskTemplate {
        TaskTemplate {
            id: "notes".into(),
            title: "Publish notes".into(),
            description: String::new(),
            assignee: TaskAssignee::User("bob".into()),
            due: DueCondition { anchor: DueAnchor::End, offset_minutes: 60 },
        }
    }

    #[tokio::test]
    async fn test_tasks_due_and_status() {
        let mem: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let occurrences = OccurrenceStore::new(mem.clone(), 3);
        let tracker = TaskTracker::new(mem);
        let mut routine = daily_routine(RoutineStatus::Active);
        routine.tasks = vec![agenda_task(), notes_task()];
        let report = occurrences.extend_horizon(&routine, utc(2024, 1, 1, 0, 0)).await.unwrap();
        let occ = report.created[0].clone();

        let tasks = tracker.tasks_for_occurrence(&routine, &occ).await.unwrap();
        assert_eq!(tasks[0].due_at, utc(2024, 1, 1, 8, 30));
        assert_eq!(tasks[1].due_at, utc(2024, 1, 1, 11, 0));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));

        tracker
            .set_task_status(&routine, &occ, "agenda", TaskStatus::Completed, utc(2024, 1, 1, 8, 0))
            .await
            .unwrap();
        let tasks = tracker.tasks_for_occurrence(&routine, &occ).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);

        let missing = tracker
            .set_task_status(&routine, &occ, "nope", TaskStatus::Completed, utc(2024, 1, 1, 8, 0))
            .await;
        assert!(matches!(missing, Err(CadenceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_occurrence_skips_open_tasks() {
        let mem: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let occurrences = OccurrenceStore::new(mem.clone(), 3);
        let tracker = TaskTracker::new(mem);
        let mut routine = daily_routine(RoutineStatus::Active);
        routine.tasks = vec![agenda_task(), notes_task()];
        let report = occurrences.extend_horizon(&routine, utc(2024, 1, 1, 0, 0)).await.unwrap();
        let occ = report.created[1].clone();

        tracker
            .set_task_status(&routine, &occ, "agenda", TaskStatus::Completed, utc(2024, 1, 1, 8, 0))
            .await
            .unwrap();
        let cancelled = occurrences.cancel_one(&occ.id, utc(2024, 1, 1, 8, 0)).await.unwrap();
        let tasks = tracker.tasks_for_occurrence(&routine, &cancelled).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].status, TaskStatus::Skipped);
    }
}
