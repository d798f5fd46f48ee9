//! Process-wide registry of logged-in client sessions
//!
//! The registry hands out connection ids and maps ids of authenticated,
//! not-yet-torn-down sessions to their shared handles. It carries its own lock,
//! independent of the room registry and of any session's outbound queue, and
//! every accessor releases it before returning: callers get snapshots, never
//! guards.

use crate::client::ClientSession;
use log::{debug, info, warn};
use shared::ClientId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ClientRegistry {
    /// Authenticated sessions indexed by their id
    clients: RwLock<HashMap<ClientId, Arc<ClientSession>>>,
    /// Next id to hand out at accept time
    next_client_id: AtomicU32,
}

impl ClientRegistry {
    /// Creates an empty registry; ids start from 0
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU32::new(0),
        }
    }

    /// Hands out a fresh connection id
    ///
    /// Ids increase monotonically and are never reused, even after the
    /// session that held one is gone.
    pub fn allocate_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds a session after a successful login
    ///
    /// Returns false if the id was already registered.
    pub async fn register(&self, session: Arc<ClientSession>) -> bool {
        let mut clients = self.clients.write().await;
        let id = session.id();
        if clients.contains_key(&id) {
            warn!("Client {} is already registered", id);
            return false;
        }
        clients.insert(id, session);
        info!("Client {} registered ({} online)", id, clients.len());
        true
    }

    /// Removes a session during teardown
    pub async fn remove(&self, client_id: ClientId) -> Option<Arc<ClientSession>> {
        let removed = self.clients.write().await.remove(&client_id);
        if removed.is_some() {
            debug!("Client {} unregistered", client_id);
        }
        removed
    }

    pub async fn get(&self, client_id: ClientId) -> Option<Arc<ClientSession>> {
        self.clients.read().await.get(&client_id).cloned()
    }

    /// Looks up several ids at once, silently skipping unknown ones
    ///
    /// Missing ids are expected: the peer may have disconnected since the
    /// caller learned about it.
    pub async fn resolve<I>(&self, ids: I) -> Vec<Arc<ClientSession>>
    where
        I: IntoIterator<Item = ClientId>,
    {
        let clients = self.clients.read().await;
        ids.into_iter()
            .filter_map(|id| clients.get(&id).cloned())
            .collect()
    }

    pub async fn contains(&self, client_id: ClientId) -> bool {
        self.clients.read().await.contains_key(&client_id)
    }

    /// Returns the number of logged-in clients
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
