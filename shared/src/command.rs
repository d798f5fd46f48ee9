//! Client commands carried inside frames
//!
//! A frame holds colon-separated fields; the first field selects one of six
//! command types. Decoding only checks shape (type, arity, submode); whether a
//! command is allowed in the session's current phase is decided by the server.

use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Server-assigned connection identifier
pub type ClientId = u32;

/// Room name that stands for "leave the current room"
pub const LEAVE_ROOM: &str = "-1";

/// Protocol errors: the frame is dropped, the connection stays open
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown command type `{0}`")]
    UnknownType(String),
    #[error("command type {kind} expects {expected} fields, got {actual}")]
    Arity {
        kind: &'static str,
        expected: &'static str,
        actual: usize,
    },
    #[error("unknown broadcast submode `{0}`")]
    UnknownBroadcastMode(String),
}

/// Fan-out mode for a room broadcast (type `3`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// `0`
    OthersUnsynced,
    /// `1`
    AllUnsynced,
    /// `2`
    OthersSynced,
    /// `3`
    AllSynced,
}

impl BroadcastMode {
    pub fn includes_sender(self) -> bool {
        matches!(self, BroadcastMode::AllUnsynced | BroadcastMode::AllSynced)
    }

    /// Synced fan-out holds the room lock for the whole delivery loop
    pub fn is_synced(self) -> bool {
        matches!(self, BroadcastMode::OthersSynced | BroadcastMode::AllSynced)
    }
}

impl FromStr for BroadcastMode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(BroadcastMode::OthersUnsynced),
            "1" => Ok(BroadcastMode::AllUnsynced),
            "2" => Ok(BroadcastMode::OthersSynced),
            "3" => Ok(BroadcastMode::AllSynced),
            other => Err(DecodeError::UnknownBroadcastMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `0:username:password`
    Login { username: String, password: String },
    /// `1`
    ListRooms,
    /// `2:roomName`; an empty name is accepted and ignored by the server
    JoinRoom { room: String },
    /// `2:-1`
    LeaveRoom,
    /// `3:submode:payload`
    Broadcast { mode: BroadcastMode, payload: String },
    /// `4:groupName:payload`
    GroupSend { group: String, payload: String },
    /// `5:groupName:id,id,...`
    DefineGroup {
        group: String,
        members: BTreeSet<ClientId>,
    },
}

impl Command {
    /// Decodes one frame payload
    pub fn parse(frame: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| DecodeError::InvalidUtf8)?;
        text.parse()
    }

    /// Wire type digit, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Login { .. } => "0",
            Command::ListRooms => "1",
            Command::JoinRoom { .. } | Command::LeaveRoom => "2",
            Command::Broadcast { .. } => "3",
            Command::GroupSend { .. } => "4",
            Command::DefineGroup { .. } => "5",
        }
    }
}

impl FromStr for Command {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        let kind = text.split(':').next().unwrap_or_default();
        match kind {
            "0" => {
                let fields: Vec<&str> = text.split(':').collect();
                if fields.len() != 3 {
                    return Err(arity("0", "exactly 3", text));
                }
                Ok(Command::Login {
                    username: fields[1].to_string(),
                    password: fields[2].to_string(),
                })
            }
            "1" => {
                if text != "1" {
                    return Err(arity("1", "exactly 1", text));
                }
                Ok(Command::ListRooms)
            }
            "2" => {
                let fields: Vec<&str> = text.split(':').collect();
                if fields.len() != 2 {
                    return Err(arity("2", "exactly 2", text));
                }
                match fields[1] {
                    LEAVE_ROOM => Ok(Command::LeaveRoom),
                    room => Ok(Command::JoinRoom {
                        room: room.to_string(),
                    }),
                }
            }
            "3" => {
                let (mode, payload) = target_and_payload("3", text)?;
                Ok(Command::Broadcast {
                    mode: mode.parse()?,
                    payload: payload.to_string(),
                })
            }
            "4" => {
                let (group, payload) = target_and_payload("4", text)?;
                Ok(Command::GroupSend {
                    group: group.to_string(),
                    payload: payload.to_string(),
                })
            }
            "5" => {
                let (group, ids) = target_and_payload("5", text)?;
                Ok(Command::DefineGroup {
                    group: group.to_string(),
                    members: parse_member_ids(ids),
                })
            }
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

/// Splits `kind:target:rest`, keeping any further colons inside `rest`
fn target_and_payload<'a>(
    kind: &'static str,
    text: &'a str,
) -> Result<(&'a str, &'a str), DecodeError> {
    let mut fields = text.splitn(3, ':').skip(1);
    match (fields.next(), fields.next()) {
        (Some(target), Some(rest)) => Ok((target, rest)),
        _ => Err(arity(kind, "at least 3", text)),
    }
}

fn arity(kind: &'static str, expected: &'static str, text: &str) -> DecodeError {
    DecodeError::Arity {
        kind,
        expected,
        actual: text.split(':').count(),
    }
}

/// Non-numeric tokens are skipped rather than rejecting the whole list
fn parse_member_ids(ids: &str) -> BTreeSet<ClientId> {
    ids.split([',', ':'])
        .filter_map(|token| token.trim().parse().ok())
        .collect()
}
