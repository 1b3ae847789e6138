//! Live sessions of streaming runs, keyed by task id.
//!
//! The registry holds a [`SessionHandle`] per running task: enough to ask the
//! run to stop and to read where it is. The browser session itself stays owned
//! by the run. Registration is scoped: dropping the [`SessionGuard`] removes
//! the entry, whichever way the run ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::types::TaskId;

/// Where a run currently is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionProgress {
    pub goal: String,
    pub attempt: u32,
    pub step_index: Option<usize>,
    pub last_error: Option<String>,
}

/// The part of a run's state other callers may see. Only the stop flag is
/// writable from outside; progress is written by the owning run.
#[derive(Debug)]
pub struct SessionHandle {
    task_id: TaskId,
    started_at: DateTime<Utc>,
    stop_requested: AtomicBool,
    progress: Mutex<SessionProgress>,
}

impl SessionHandle {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            started_at: Utc::now(),
            stop_requested: AtomicBool::new(false),
            progress: Mutex::new(SessionProgress::default()),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> SessionProgress {
        self.progress.lock().clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut SessionProgress)) {
        f(&mut self.progress.lock());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopping,
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<TaskId, Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session for `task_id`. A second registration for an id
    /// that is still live is rejected.
    pub fn register(&self, task_id: TaskId) -> Result<SessionGuard, RegistryError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&task_id) {
            return Err(RegistryError::AlreadyRegistered(task_id));
        }
        let handle = Arc::new(SessionHandle::new(task_id));
        sessions.insert(task_id, Arc::clone(&handle));
        debug!(task_id, "session registered");
        Ok(SessionGuard {
            registry: self.clone(),
            handle,
        })
    }

    pub fn lookup(&self, task_id: TaskId) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().get(&task_id).cloned()
    }

    /// Flip the stop flag of a live session. Unknown ids are reported, not an error.
    pub fn request_stop(&self, task_id: TaskId) -> StopOutcome {
        match self.lookup(task_id) {
            Some(handle) => {
                info!(task_id, "stop requested");
                handle.request_stop();
                StopOutcome::Stopping
            }
            None => StopOutcome::NotFound,
        }
    }

    /// Remove the entry for `task_id`, but only if it is still `handle`'s.
    pub fn unregister(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(&handle.task_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(&handle.task_id);
                debug!(task_id = handle.task_id, "session unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn active(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Keeps a registration alive; unregisters on drop.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    handle: Arc<SessionHandle>,
}

impl SessionGuard {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_and_drop() {
        let registry = SessionRegistry::new();
        let guard = registry.register(7).unwrap();

        assert_eq!(registry.active(), vec![7]);
        assert!(Arc::ptr_eq(&registry.lookup(7).unwrap(), guard.handle()));

        drop(guard);
        assert!(registry.lookup(7).is_none());
        assert!(registry.active().is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = SessionRegistry::new();
        let _guard = registry.register(1).unwrap();

        assert_eq!(
            registry.register(1).unwrap_err(),
            RegistryError::AlreadyRegistered(1)
        );
        assert!(registry.register(2).is_ok());
    }

    #[test]
    fn id_is_reusable_after_the_run_ends() {
        let registry = SessionRegistry::new();
        drop(registry.register(3).unwrap());
        assert!(registry.register(3).is_ok());
    }

    #[test]
    fn request_stop_sets_the_flag() {
        let registry = SessionRegistry::new();
        let guard = registry.register(5).unwrap();

        assert!(!guard.handle().stop_requested());
        assert_eq!(registry.request_stop(5), StopOutcome::Stopping);
        assert!(guard.handle().stop_requested());
        assert_eq!(registry.request_stop(5), StopOutcome::Stopping);
    }

    #[test]
    fn request_stop_on_unknown_id_is_a_no_op() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.request_stop(42), StopOutcome::NotFound);

        drop(registry.register(42).unwrap());
        assert_eq!(registry.request_stop(42), StopOutcome::NotFound);
    }

    #[test]
    fn stale_guard_does_not_remove_a_newer_entry() {
        let registry = SessionRegistry::new();
        let first = registry.register(9).unwrap();
        let stale = Arc::clone(first.handle());
        drop(first);
        let _second = registry.register(9).unwrap();

        assert!(!registry.unregister(&stale));
        assert!(registry.lookup(9).is_some());
    }

    #[test]
    fn progress_is_visible_to_other_callers() {
        let registry = SessionRegistry::new();
        let guard = registry.register(11).unwrap();
        guard.handle().update(|p| {
            p.attempt = 2;
            p.step_index = Some(1);
        });

        let seen = registry.lookup(11).unwrap().progress();
        assert_eq!(seen.attempt, 2);
        assert_eq!(seen.step_index, Some(1));
    }

    #[test]
    fn concurrent_stop_requests_are_safe() {
        let registry = SessionRegistry::new();
        let guard = registry.register(1).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.request_stop(1))
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), StopOutcome::Stopping);
        }
        assert!(guard.handle().stop_requested());
    }
}
