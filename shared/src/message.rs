//! Frames sent from the server to clients

use crate::command::ClientId;
use bytes::Bytes;
use std::fmt;

/// One entry of a room listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub name: String,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `0:<clientId>:`
    LoggedIn { client_id: ClientId },
    /// `1:<room>-<count>,...`
    RoomList { rooms: Vec<RoomSummary> },
    /// `2:<clientId>:<room>`, with an empty room when the client left
    Membership {
        client_id: ClientId,
        room: Option<String>,
    },
    /// `3:<senderId>:<payload>`
    Data { sender: ClientId, payload: String },
    /// `4:<masterId>`
    Master { client_id: ClientId },
}

impl ServerMessage {
    pub fn joined(client_id: ClientId, room: &str) -> Self {
        ServerMessage::Membership {
            client_id,
            room: Some(room.to_string()),
        }
    }

    pub fn left(client_id: ClientId) -> Self {
        ServerMessage::Membership {
            client_id,
            room: None,
        }
    }

    /// Frame payload, ready for the active codec
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::LoggedIn { client_id } => write!(f, "0:{}:", client_id),
            ServerMessage::RoomList { rooms } => {
                f.write_str("1:")?;
                for (i, room) in rooms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}-{}", room.name, room.members)?;
                }
                Ok(())
            }
            ServerMessage::Membership { client_id, room } => {
                write!(f, "2:{}:{}", client_id, room.as_deref().unwrap_or_default())
            }
            ServerMessage::Data { sender, payload } => write!(f, "3:{}:{}", sender, payload),
            ServerMessage::Master { client_id } => write!(f, "4:{}", client_id),
        }
    }
}
