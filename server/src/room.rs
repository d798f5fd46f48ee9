//! Rooms and the room registry
//!
//! A room keeps its members in join order; the order decides who becomes
//! master when the current master leaves. Rooms exist only while they have at
//! least one member: the registry creates a room on first join and deletes it
//! when the last member leaves.
//!
//! Each room also owns a lock used by synced broadcasts. It is separate from
//! the registry lock, so a long synced fan-out to one room never blocks
//! lookups of other rooms.

use crate::client::ClientSession;
use log::{debug, info, warn};
use shared::{ClientId, RoomSummary};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub struct Room {
    name: String,
    /// Join order, no duplicates
    members: Vec<Arc<ClientSession>>,
    /// Always one of `members`
    master: ClientId,
    sync_lock: Arc<Mutex<()>>,
}

impl Room {
    fn new(name: &str, founder: Arc<ClientSession>) -> Self {
        Self {
            name: name.to_string(),
            master: founder.id(),
            members: vec![founder],
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn master(&self) -> ClientId {
        self.master
    }

    pub fn member_ids(&self) -> Vec<ClientId> {
        self.members.iter().map(|member| member.id()).collect()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.members.iter().any(|member| member.id() == client_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns false if the client is already a member
    fn add_member(&mut self, session: Arc<ClientSession>) -> bool {
        if self.contains(session.id()) {
            return false;
        }
        self.members.push(session);
        true
    }

    /// Removes a member, electing the earliest-joined survivor if the master
    /// left
    ///
    /// Returns `None` if the client was not a member, otherwise the new master
    /// if one had to be chosen.
    fn remove_member(&mut self, client_id: ClientId) -> Option<Option<ClientId>> {
        let index = self
            .members
            .iter()
            .position(|member| member.id() == client_id)?;
        self.members.remove(index);

        if self.master != client_id {
            return Some(None);
        }
        match self.members.first() {
            Some(successor) => {
                self.master = successor.id();
                Some(Some(self.master))
            }
            None => Some(None),
        }
    }
}

/// Result of adding a client to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Master after the join
    pub master: ClientId,
    /// Members that were already present, in join order
    pub peers: Vec<ClientId>,
}

/// Result of removing a client from a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The client was not listed in the room (or the room is gone)
    NotMember,
    /// The client was the last member; the room no longer exists
    RoomDeleted,
    Left { new_master: Option<ClientId> },
}

/// Recipients of a broadcast, captured under the registry lock
pub struct FanOut {
    pub members: Vec<Arc<ClientSession>>,
    pub sync_lock: Arc<Mutex<()>>,
}

/// Process-wide map of room name to room
pub struct RoomRegistry {
    rooms: RwLock<BTreeMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds a client to a room, creating it with the client as master if
    /// needed
    pub async fn join(&self, name: &str, session: Arc<ClientSession>) -> JoinOutcome {
        let client_id = session.id();
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get_mut(name) {
            let peers: Vec<ClientId> = room
                .member_ids()
                .into_iter()
                .filter(|id| *id != client_id)
                .collect();
            if !room.add_member(session) {
                warn!("Client {} is already in room {}", client_id, name);
            }
            debug!("Client {} joined room {} ({} members)", client_id, name, room.len());
            return JoinOutcome {
                master: room.master(),
                peers,
            };
        }

        rooms.insert(name.to_string(), Room::new(name, session));
        info!("Room {} created by client {}", name, client_id);
        JoinOutcome {
            master: client_id,
            peers: Vec::new(),
        }
    }

    /// Removes a client from a room, deleting the room if it becomes empty
    pub async fn leave(&self, name: &str, client_id: ClientId) -> LeaveOutcome {
        let mut rooms = self.rooms.write().await;

        let Some(room) = rooms.get_mut(name) else {
            return LeaveOutcome::NotMember;
        };
        let Some(new_master) = room.remove_member(client_id) else {
            return LeaveOutcome::NotMember;
        };

        if room.is_empty() {
            rooms.remove(name);
            info!("Room {} deleted", name);
            return LeaveOutcome::RoomDeleted;
        }
        if let Some(master) = new_master {
            info!("Client {} is now master of room {}", master, name);
        }
        LeaveOutcome::Left { new_master }
    }

    /// Snapshots a room's members and its sync lock handle
    pub async fn fan_out(&self, name: &str) -> Option<FanOut> {
        let rooms = self.rooms.read().await;
        rooms.get(name).map(|room| FanOut {
            members: room.members.clone(),
            sync_lock: Arc::clone(&room.sync_lock),
        })
    }

    /// Room names with member counts, ordered by name
    pub async fn listing(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read().await;
        rooms
            .values()
            .map(|room| RoomSummary {
                name: room.name().to_string(),
                members: room.len(),
            })
            .collect()
    }

    pub async fn master_of(&self, name: &str) -> Option<ClientId> {
        self.rooms.read().await.get(name).map(Room::master)
    }

    pub async fn members_of(&self, name: &str) -> Option<Vec<ClientId>> {
        self.rooms.read().await.get(name).map(Room::member_ids)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.rooms.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
