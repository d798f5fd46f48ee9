//! Per-connection session handle and connection-local state
//!
//! A session is split in two:
//! - [`ClientSession`] is shared (`Arc`) with the registries and rooms so
//!   other connections can enqueue frames for it
//! - [`SessionState`] is owned by the session's ingest task and holds what
//!   only that client's own commands may change

use bytes::Bytes;
use log::{debug, info};
use shared::{ClientId, ServerMessage};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Item on a session's outbound queue
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    /// Raised once the session stops being alive so egress wakes up and exits
    Close,
}

pub type OutboxReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Shared half of a client connection
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    alive: AtomicBool,
    outbox: mpsc::UnboundedSender<Outbound>,
    /// Fired once by a forced disconnect; observed by both session tasks
    disconnect: CancellationToken,
}

impl ClientSession {
    /// Creates a live session and the receiving end of its outbound queue
    ///
    /// The receiver belongs to the session's egress task and nothing else.
    pub fn new(id: ClientId) -> (Arc<Self>, OutboxReceiver) {
        let (outbox, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            alive: AtomicBool::new(true),
            outbox,
            disconnect: CancellationToken::new(),
        });
        (session, receiver)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Appends a frame to the outbound queue
    ///
    /// Returns false when the session is already shutting down. Callers in a
    /// fan-out loop ignore the result and move on to the next recipient.
    pub fn send(&self, frame: Bytes) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.outbox.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn send_message(&self, message: &ServerMessage) -> bool {
        self.send(message.to_bytes())
    }

    /// Forces the connection down
    ///
    /// Egress stops writing at once and drops whatever is still queued;
    /// ingest stops reading and runs the normal teardown.
    pub fn disconnect(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!("Client {} marked for disconnect", self.id);
        }
        self.disconnect.cancel();
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called
    ///
    /// Any number of tasks may wait; all of them are released.
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await;
    }

    /// Marks the session dead and wakes the egress loop
    ///
    /// Frames already queued are still written; anything sent afterwards is
    /// refused.
    pub fn close_outbox(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.outbox.send(Outbound::Close);
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticating,
    Active,
    Disconnecting,
    Terminated,
}

/// Connection-local state, mutated only by the session's own commands
#[derive(Debug)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub username: Option<String>,
    pub current_room: Option<String>,
    /// Named multicast lists of peer ids
    pub groups: HashMap<String, BTreeSet<ClientId>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Connecting,
            username: None,
            current_room: None,
            groups: HashMap::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// Records a successful login; the username is never changed afterwards
    pub fn authenticate(&mut self, client_id: ClientId, username: String) {
        if self.username.is_none() {
            self.username = Some(username);
        }
        self.set_phase(client_id, SessionPhase::Active);
    }

    pub fn set_phase(&mut self, client_id: ClientId, phase: SessionPhase) {
        if self.phase != phase {
            debug!("Client {}: {:?} -> {:?}", client_id, self.phase, phase);
            if phase == SessionPhase::Active {
                info!(
                    "Client {} logged in as {}",
                    client_id,
                    self.username.as_deref().unwrap_or_default()
                );
            }
            self.phase = phase;
        }
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.current_room.as_deref() == Some(room)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_text(item: Outbound) -> String {
        match item {
            Outbound::Frame(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
            Outbound::Close => panic!("Unexpected close marker"),
        }
    }

    #[test]
    fn test_session_creation() {
        let (session, _outbox) = ClientSession::new(4);

        assert_eq!(session.id(), 4);
        assert!(session.is_alive());
    }

    #[test]
    fn test_send_preserves_order() {
        let (session, mut outbox) = ClientSession::new(1);

        assert!(session.send(Bytes::from_static(b"first")));
        assert!(session.send_message(&ServerMessage::Master { client_id: 1 }));

        assert_eq!(frame_text(outbox.try_recv().unwrap()), "first");
        assert_eq!(frame_text(outbox.try_recv().unwrap()), "4:1");
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn test_close_outbox_refuses_new_frames() {
        let (session, mut outbox) = ClientSession::new(1);

        session.send(Bytes::from_static(b"queued"));
        session.close_outbox();

        assert!(!session.is_alive());
        assert!(!session.send(Bytes::from_static(b"late")));
        assert_eq!(frame_text(outbox.try_recv().unwrap()), "queued");
        assert!(matches!(outbox.try_recv().unwrap(), Outbound::Close));
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (session, outbox) = ClientSession::new(1);
        drop(outbox);

        assert!(!session.send(Bytes::from_static(b"nobody")));
    }

    #[tokio::test]
    async fn test_disconnect_wakes_waiter() {
        let (session, _outbox) = ClientSession::new(2);

        session.disconnect();

        // Still observable by a waiter that arrives late.
        tokio::time::timeout(std::time::Duration::from_secs(1), session.disconnected())
            .await
            .expect("disconnect notification");
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_disconnect_releases_every_waiter() {
        let (session, _outbox) = ClientSession::new(2);

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.disconnected().await })
            })
            .collect();
        tokio::task::yield_now().await;
        session.disconnect();

        for waiter in waiters {
            tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
                .await
                .expect("every waiter released")
                .unwrap();
        }
    }

    #[test]
    fn test_session_state_lifecycle() {
        let mut state = SessionState::new();
        assert_eq!(state.phase, SessionPhase::Connecting);
        assert!(!state.is_authenticated());

        state.set_phase(0, SessionPhase::Authenticating);
        state.authenticate(0, "alice".to_string());
        assert!(state.is_authenticated());
        assert_eq!(state.username.as_deref(), Some("alice"));

        state.authenticate(0, "mallory".to_string());
        assert_eq!(state.username.as_deref(), Some("alice"));

        state.current_room = Some("room1".to_string());
        assert!(state.in_room("room1"));
        assert!(!state.in_room("room2"));
    }
}
