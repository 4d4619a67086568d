//! Per-routine mutual exclusion.
//!
//! Schedule edits, participant edits and materialization of one routine are
//! serialized behind that routine's lock; different routines never contend.
//! The optimistic version check in the store still guards against writers in
//! other processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Idle lock entries are pruned once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Lock table keyed by routine id.
#[derive(Default)]
pub struct RoutineLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RoutineLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `routine_id`. Released when the guard drops.
    pub async fn acquire(&self, routine_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if table.len() > PRUNE_THRESHOLD {
                table.retain(|_, l| Arc::strong_count(l) > 1);
            }
            table
                .entry(routine_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        tracing::trace!("🔒 Routine lock requested: {}", routine_id);
        lock.lock_owned().await
    }

    /// Number of routines with a lock entry.
    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_routine_is_serialized() {
        let locks = Arc::new(RoutineLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("r1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_routines_do_not_contend() {
        let locks = RoutineLocks::new();
        let _a = locks.acquire("r1").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("r2")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
