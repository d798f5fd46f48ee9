//! Wire protocol shared by the relay server and its clients
//!
//! - [`codec`] turns a byte stream into frames (newline or length-prefixed)
//! - [`command`] decodes client frames into commands
//! - [`message`] renders the frames the server sends back

pub mod codec;
pub mod command;
pub mod message;

pub use codec::{FrameCodec, FrameError, Framing};
pub use command::{BroadcastMode, ClientId, Command, DecodeError};
pub use message::{RoomSummary, ServerMessage};
