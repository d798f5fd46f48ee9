//! Server configuration from the command line and environment

use clap::{ArgAction, Parser};
use shared::codec::DEFAULT_MAX_FRAME_LEN;
use shared::Framing;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Room-based TCP relay server")]
pub struct ServerConfig {
    /// Server IP address to bind to
    #[arg(short = 'H', long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, env = "RELAY_PORT", default_value_t = 3290)]
    pub port: u16,

    /// Wire framing: `text` (newline-delimited) or `binary` (2-byte length prefix)
    #[arg(short, long, env = "RELAY_FRAMING", default_value_t = Framing::Text)]
    pub framing: Framing,

    /// Bytes requested per socket read
    #[arg(long, env = "RELAY_READ_BUFFER", default_value_t = 1024)]
    pub read_buffer: usize,

    /// Set TCP_NODELAY on accepted connections
    #[arg(long, env = "RELAY_NODELAY", default_value_t = true, action = ArgAction::Set)]
    pub nodelay: bool,

    /// Longest accepted text frame, in bytes; longer lines are skipped
    #[arg(long, env = "RELAY_MAX_FRAME", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame: usize,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3290,
            framing: Framing::Text,
            read_buffer: 1024,
            nodelay: true,
            max_frame: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
