//! Command handling, room membership and message fan-out
//!
//! The engine is shared by every session task. It holds no state of its own
//! beyond the two registries; per-client state arrives as the caller's
//! [`SessionState`].
//!
//! Two fan-out contracts exist for room broadcasts:
//! - **unsynced**: members are snapshotted under the room registry lock, the
//!   lock is released, then each recipient's queue is appended to
//!   independently. Concurrent broadcasts may interleave differently per
//!   recipient.
//! - **synced**: the room's own lock is held across the whole enqueue loop, so
//!   every recipient sees synced messages to that room in the same order.
//!   Queue appends nest inside the room lock, never the other way around.

use crate::client::{ClientSession, SessionState};
use crate::client_manager::ClientRegistry;
use crate::room::{LeaveOutcome, RoomRegistry};
use bytes::Bytes;
use log::{debug, warn};
use shared::command::LEAVE_ROOM;
use shared::{BroadcastMode, ClientId, Command, ServerMessage};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Why a client is leaving its room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// `2:-1` or switching rooms; the leaver gets a confirmation
    Explicit,
    /// Connection teardown; there is nobody left to confirm to
    Disconnected,
}

pub struct RoomEngine {
    clients: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl RoomEngine {
    pub fn new(clients: Arc<ClientRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        Self { clients, rooms }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Decodes and executes one frame; malformed frames are logged and dropped
    pub async fn handle_frame(
        &self,
        session: &Arc<ClientSession>,
        state: &mut SessionState,
        frame: &[u8],
    ) {
        match Command::parse(frame) {
            Ok(command) => self.handle_command(session, state, command).await,
            Err(e) => warn!(
                "Dropping malformed frame from client {}: {} ({:?})",
                session.id(),
                e,
                String::from_utf8_lossy(frame)
            ),
        }
    }

    pub async fn handle_command(
        &self,
        session: &Arc<ClientSession>,
        state: &mut SessionState,
        command: Command,
    ) {
        let client_id = session.id();

        if !state.is_authenticated() {
            match command {
                Command::Login { username, .. } => self.login(session, state, username).await,
                other => warn!(
                    "Client {} sent type {} before logging in, dropped",
                    client_id,
                    other.kind()
                ),
            }
            return;
        }

        debug!("Client {} -> type {}", client_id, command.kind());
        match command {
            Command::Login { .. } => {
                warn!("Client {} is already logged in, login dropped", client_id);
            }
            Command::ListRooms => self.list_rooms(session).await,
            Command::JoinRoom { room } => self.join_room(session, state, &room).await,
            Command::LeaveRoom => {
                if state.current_room.is_some() {
                    self.leave_room(session, state, Departure::Explicit).await;
                } else {
                    debug!("Client {} asked to leave but is not in a room", client_id);
                }
            }
            Command::Broadcast { mode, payload } => {
                self.broadcast_from(session, state, mode, payload).await;
            }
            Command::GroupSend { group, payload } => {
                self.send_to_group(session, state, &group, payload).await;
            }
            Command::DefineGroup { group, members } => {
                Self::define_group(client_id, state, group, members);
            }
        }
    }

    /// Accepts any credentials; registers the session and confirms its id
    async fn login(&self, session: &Arc<ClientSession>, state: &mut SessionState, username: String) {
        state.authenticate(session.id(), username);
        self.clients.register(Arc::clone(session)).await;
        session.send_message(&ServerMessage::LoggedIn {
            client_id: session.id(),
        });
    }

    async fn list_rooms(&self, session: &ClientSession) {
        let rooms = self.rooms.listing().await;
        session.send_message(&ServerMessage::RoomList { rooms });
    }

    /// Moves the client into `room`, creating it if needed
    ///
    /// The joiner receives, in order: its own arrival notice (as part of the
    /// room broadcast), one notice per member already present, then the
    /// current master.
    pub async fn join_room(&self, session: &Arc<ClientSession>, state: &mut SessionState, room: &str) {
        let client_id = session.id();
        if room.is_empty() || room == LEAVE_ROOM {
            debug!("Client {} sent a join without a room, ignored", client_id);
            return;
        }
        if state.in_room(room) {
            debug!("Client {} is already in room {}", client_id, room);
            return;
        }
        if state.current_room.is_some() {
            self.leave_room(session, state, Departure::Explicit).await;
        }

        let outcome = self.rooms.join(room, Arc::clone(session)).await;
        state.current_room = Some(room.to_string());

        self.broadcast(room, &ServerMessage::joined(client_id, room), None, false)
            .await;
        for peer in &outcome.peers {
            session.send_message(&ServerMessage::joined(*peer, room));
        }
        session.send_message(&ServerMessage::Master {
            client_id: outcome.master,
        });
    }

    /// Takes the client out of its current room
    ///
    /// Remaining members learn of the departure first, then (for an explicit
    /// leave) the leaver gets the same notice, then the room learns of a new
    /// master if the leaver held that role.
    pub async fn leave_room(
        &self,
        session: &Arc<ClientSession>,
        state: &mut SessionState,
        departure: Departure,
    ) {
        let client_id = session.id();
        let Some(room) = state.current_room.take() else {
            return;
        };

        let outcome = self.rooms.leave(&room, client_id).await;
        if outcome == LeaveOutcome::NotMember {
            warn!("Client {} was not listed in room {}, leave ignored", client_id, room);
            return;
        }

        let notice = ServerMessage::left(client_id);
        self.broadcast(&room, &notice, None, false).await;
        if departure == Departure::Explicit {
            session.send_message(&notice);
        }
        if let LeaveOutcome::Left {
            new_master: Some(master),
        } = outcome
        {
            self.broadcast(&room, &ServerMessage::Master { client_id: master }, None, false)
                .await;
        }
    }

    async fn broadcast_from(
        &self,
        session: &ClientSession,
        state: &SessionState,
        mode: BroadcastMode,
        payload: String,
    ) {
        let Some(room) = state.current_room.as_deref() else {
            debug!("Client {} broadcast outside a room, ignored", session.id());
            return;
        };
        let message = ServerMessage::Data {
            sender: session.id(),
            payload,
        };
        let exclude = (!mode.includes_sender()).then_some(session.id());
        self.broadcast(room, &message, exclude, mode.is_synced()).await;
    }

    /// Enqueues `message` for every member of `room` except `exclude`
    ///
    /// Returns the number of queues the frame was appended to. A room that
    /// vanished since the caller looked it up is a no-op.
    pub async fn broadcast(
        &self,
        room: &str,
        message: &ServerMessage,
        exclude: Option<ClientId>,
        synced: bool,
    ) -> usize {
        let Some(fan_out) = self.rooms.fan_out(room).await else {
            debug!("Room {} is gone, broadcast dropped", room);
            return 0;
        };
        let frame = message.to_bytes();

        if synced {
            let _ordered = fan_out.sync_lock.lock().await;
            deliver(&fan_out.members, &frame, exclude)
        } else {
            deliver(&fan_out.members, &frame, exclude)
        }
    }

    /// Sends to the ids of one of the sender's groups that are still online
    async fn send_to_group(
        &self,
        session: &ClientSession,
        state: &SessionState,
        group: &str,
        payload: String,
    ) {
        let Some(members) = state.groups.get(group) else {
            debug!("Client {} has no group {}", session.id(), group);
            return;
        };

        let recipients = self.clients.resolve(members.iter().copied()).await;
        if recipients.len() < members.len() {
            debug!(
                "Group {} of client {}: {} of {} members online",
                group,
                session.id(),
                recipients.len(),
                members.len()
            );
        }

        let frame = ServerMessage::Data {
            sender: session.id(),
            payload,
        }
        .to_bytes();
        deliver(&recipients, &frame, None);
    }

    /// Replaces the named group; groups are never merged or shared
    fn define_group(
        client_id: ClientId,
        state: &mut SessionState,
        group: String,
        members: BTreeSet<ClientId>,
    ) {
        debug!("Client {} defined group {} as {:?}", client_id, group, members);
        state.groups.insert(group, members);
    }

    /// Removes a torn-down session from its room and from the client registry
    ///
    /// Must only run after the session's egress task has finished.
    pub async fn disconnect(&self, session: &Arc<ClientSession>, state: &mut SessionState) {
        self.leave_room(session, state, Departure::Disconnected).await;
        if self.clients.remove(session.id()).await.is_none() && state.username.is_some() {
            warn!("Client {} was already unregistered", session.id());
        }
    }
}

/// Appends one frame to each recipient's queue
///
/// A recipient whose connection is already going away refuses the frame; its
/// own ingest task handles the teardown, so the loop simply moves on.
fn deliver(recipients: &[Arc<ClientSession>], frame: &Bytes, exclude: Option<ClientId>) -> usize {
    let mut delivered = 0;
    for member in recipients {
        if Some(member.id()) == exclude {
            continue;
        }
        if member.send(frame.clone()) {
            delivered += 1;
        }
    }
    delivered
}
