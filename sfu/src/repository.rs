use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::session::Session;

/// All sessions of one lobby, keyed by user. A user joins a lobby at most once. Only the
/// lobby sequencer inserts and removes, the hub reads snapshots for fan-out.
#[derive(Debug, Default)]
pub struct SessionRepository {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the user already has a session.
    pub fn add(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().expect("session repository poisoned");
        if sessions.contains_key(&session.user_id) {
            return false;
        }
        sessions.insert(session.user_id, session);
        true
    }

    pub fn find_by_user(&self, user_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("session repository poisoned")
            .get(&user_id)
            .cloned()
    }

    pub fn delete_by_user(&self, user_id: Uuid) -> bool {
        self.sessions
            .write()
            .expect("session repository poisoned")
            .remove(&user_id)
            .is_some()
    }

    pub fn contains_session(&self, session_id: Uuid) -> bool {
        self.sessions
            .read()
            .expect("session repository poisoned")
            .values()
            .any(|session| session.id == session_id)
    }

    /// Snapshot for iteration outside the lock.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .expect("session repository poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session repository poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
