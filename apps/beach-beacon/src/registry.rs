use std::sync::Arc;

use dashmap::DashMap;

use crate::channel::PeerHandle;

/// Directory of registered identities and the connection currently bound to each.
///
/// Cheap to clone; every clone shares the same map. None of the operations touch I/O.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<DashMap<String, PeerHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `user_id` to `handle`, replacing any previous binding without closing it.
    /// Returns whether a previous binding existed.
    pub fn upsert(&self, user_id: &str, handle: PeerHandle) -> bool {
        self.clients.insert(user_id.to_string(), handle).is_some()
    }

    pub fn lookup(&self, user_id: &str) -> Option<PeerHandle> {
        self.clients.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, user_id: &str) {
        self.clients.remove(user_id);
    }

    /// Removes `user_id` only while it is still bound to `handle`'s connection.
    pub fn remove_if_current(&self, user_id: &str, handle: &PeerHandle) -> bool {
        self.clients
            .remove_if(user_id, |_, current| current.is_same_connection(handle))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
