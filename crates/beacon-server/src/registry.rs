use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use beacon_core::ids::{SubscriberId, TaskId, UserId};

/// Cancellation handle for one live session, tracked for introspection and
/// coordinated shutdown. Not on the message-delivery hot path.
pub struct SessionHandle {
    pub id: SubscriberId,
    pub task_id: TaskId,
    pub user_id: UserId,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: SubscriberId, task_id: TaskId, user_id: UserId, cancel: CancellationToken) -> Self {
        Self {
            id,
            task_id,
            user_id,
            cancel,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Registry of all live sessions, keyed by subscriber id. Sessions remove
/// themselves synchronously on every exit path, so entries never outlive
/// their connection.
pub struct SessionRegistry {
    sessions: DashMap<SubscriberId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, handle: SessionHandle) {
        tracing::debug!(subscriber_id = %handle.id, task_id = %handle.task_id, "session registered");
        self.sessions.insert(handle.id.clone(), handle);
    }

    pub fn unregister(&self, id: &SubscriberId) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(subscriber_id = %id, "session unregistered");
        }
    }

    /// Subscriber ids of every live session for a task.
    pub fn list_by_task(&self, task_id: &TaskId) -> Vec<SubscriberId> {
        self.sessions
            .iter()
            .filter(|entry| &entry.value().task_id == task_id)
            .map(|entry| entry.value().id.clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel every session attached to a task (e.g. the task was deleted).
    /// Returns how many were signalled; each removes itself as it closes.
    pub fn close_task(&self, task_id: &TaskId) -> usize {
        let mut signalled = 0;
        for entry in self.sessions.iter() {
            if &entry.value().task_id == task_id {
                entry.value().cancel();
                signalled += 1;
            }
        }
        if signalled > 0 {
            tracing::info!(task_id = %task_id, sessions = signalled, "closing sessions for task");
        }
        signalled
    }

    /// Cancel every live session (daemon shutdown).
    pub fn close_all(&self) -> usize {
        let mut signalled = 0;
        for entry in self.sessions.iter() {
            entry.value().cancel();
            signalled += 1;
        }
        if signalled > 0 {
            tracing::info!(sessions = signalled, "closing all sessions");
        }
        signalled
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(task: &str) -> (SessionHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        let handle = SessionHandle::new(
            SubscriberId::new(),
            TaskId::from_raw(task),
            UserId::new(),
            cancel.clone(),
        );
        (handle, cancel)
    }

    #[test]
    fn register_and_unregister() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.count(), 0);

        let (h1, _) = handle("task_1");
        let id1 = h1.id.clone();
        let (h2, _) = handle("task_1");
        registry.register(h1);
        registry.register(h2);
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = SessionRegistry::new();
        registry.unregister(&SubscriberId::new());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn list_by_task_filters() {
        let registry = SessionRegistry::new();
        let (h1, _) = handle("task_1");
        let (h2, _) = handle("task_1");
        let (h3, _) = handle("task_2");
        let expected = vec![h1.id.clone(), h2.id.clone()];
        registry.register(h1);
        registry.register(h2);
        registry.register(h3);

        let mut listed = registry.list_by_task(&TaskId::from_raw("task_1"));
        listed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let mut expected = expected;
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(listed, expected);
    }

    #[test]
    fn close_task_signals_only_matching_sessions() {
        let registry = SessionRegistry::new();
        let (h1, c1) = handle("task_1");
        let (h2, c2) = handle("task_2");
        registry.register(h1);
        registry.register(h2);

        let signalled = registry.close_task(&TaskId::from_raw("task_1"));
        assert_eq!(signalled, 1);
        assert!(c1.is_cancelled());
        assert!(!c2.is_cancelled());
    }

    #[test]
    fn close_all_signals_everything() {
        let registry = SessionRegistry::new();
        let (h1, c1) = handle("task_1");
        let (h2, c2) = handle("task_2");
        registry.register(h1);
        registry.register(h2);

        assert_eq!(registry.close_all(), 2);
        assert!(c1.is_cancelled());
        assert!(c2.is_cancelled());
    }
}
