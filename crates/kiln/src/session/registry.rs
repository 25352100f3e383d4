use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::session::live::Session;

/// Table of live sessions.
///
/// The lock is only held while the map itself changes; callers get an
/// `Arc<Session>` and do all I/O and process control outside it.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Arc<Session>) {
        self.map().insert(session.id(), session);
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.map().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.map().remove(id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.map().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Sessions nobody has touched for longer than `threshold`
    pub fn idle(&self, threshold: Duration) -> Vec<Uuid> {
        self.map()
            .values()
            .filter(|session| session.idle_for() > threshold)
            .map(|session| session.id())
            .collect()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
