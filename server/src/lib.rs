//! # Room Relay Server Library
//!
//! This library provides a TCP relay that lets connected clients log in, join
//! named rooms and exchange broadcast or targeted messages. Each non-empty room
//! has exactly one master, the member other clients treat as authoritative
//! (for example the owner of shared game state).
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Every connection moves through `Connecting → Authenticating → Active →
//! Disconnecting → Terminated`. A session runs two tasks: ingest reads and
//! executes commands, egress drains the session's outbound queue to the
//! socket. Teardown waits for egress to finish before the client is removed
//! from shared state.
//!
//! ### Rooms and Masters
//! Rooms are created on first join and deleted when the last member leaves.
//! When the master leaves, the earliest-joined remaining member takes over.
//!
//! ### Broadcast Ordering
//! Unsynced broadcasts are enqueued per recipient with no cross-recipient
//! ordering. Synced broadcasts hold the room's lock for the whole fan-out, so
//! every member sees synced messages in one agreed order.
//!
//! ## Module Organization
//!
//! ### Client Module (`client`)
//! The shared session handle (outbound queue, alive flag, forced disconnect)
//! and the connection-local session state (phase, username, room, groups).
//!
//! ### Client Manager Module (`client_manager`)
//! Registry of logged-in sessions and the connection id counter.
//!
//! ### Room Module (`room`)
//! Room membership, master election and the room registry.
//!
//! ### Engine Module (`engine`)
//! Command dispatch, join/leave notifications and both fan-out contracts.
//!
//! ### Network Module (`network`)
//! TCP listener and the per-connection ingest/egress tasks.
//!
//! ### Config Module (`config`)
//! Command-line and environment configuration.
//!
//! ## Locking
//!
//! Four independent lock domains exist: the client registry, the room
//! registry, each room's sync lock and each session's outbound queue.
//! Registry locks are only held long enough to take a snapshot. The one
//! permitted nesting is a room's sync lock held across queue appends.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".to_string(),
//!         port: 3290,
//!         ..ServerConfig::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_manager;
pub mod config;
pub mod engine;
pub mod network;
pub mod room;
