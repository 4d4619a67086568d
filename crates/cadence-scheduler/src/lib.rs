//! # Cadence Scheduler
//!
//! Recurring-routine scheduling core: recurrence expansion, idempotent
//! occurrence materialization, per-occurrence invitations and an
//! exactly-once reminder scan.
//!
//! ## Design Principles
//! - Occurrence identity is derived from (routine, start), so every write is replayable
//! - Time zones are resolved per instant, so wall-clock times survive DST
//! - Only a bounded horizon is materialized; queries past it extend it
//! - Tokio timers only, idle between ticks
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval)
//!   ├── LifecycleController.tick (per-routine lock)
//!   │     ├── OccurrenceStore.rematerialize, if an edit is pending
//!   │     ├── OccurrenceStore.extend_horizon ← recurrence::expand
//!   │     ├── InvitationManager.seed_states
//!   │     └── OccurrenceStore.advance / auto-complete
//!   └── ReminderScheduler.scan
//!         ├── due (rule, occurrence, recipient) tuples from stored occurrences
//!         ├── buffer_unordered dispatch → NotificationSender
//!         │                                 ├── WebhookSender (HTTP POST)
//!         │                                 └── LogSender
//!         └── write_receipt_if_absent
//!
//! DurableStore ── TimedStore ─┬── SqliteStore
//!                             └── MemoryStore
//! ```

pub mod dispatch;
pub mod engine;
pub mod invitations;
pub mod lifecycle;
pub mod locks;
pub mod occurrences;
pub mod persistence;
pub mod recurrence;
pub mod reminders;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use dispatch::{LogSender, WebhookSender, sender_from_config};
pub use engine::{SchedulerEngine, spawn_scheduler};
pub use invitations::{InvitationManager, RosterEntry};
pub use lifecycle::{LifecycleController, ScheduleEdit, TickReport};
pub use locks::RoutineLocks;
pub use occurrences::{MaterializeReport, OccurrenceStore, occurrence_id};
pub use persistence::SqliteStore;
pub use recurrence::{OccurrenceIter, OccurrenceWindow};
pub use reminders::{DueList, DueReminder, ReminderScheduler, ScanReport};
pub use store::{MemoryStore, TimedStore};
pub use tasks::{OccurrenceTask, TaskTracker};
