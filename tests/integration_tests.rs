//! Integration tests for the relay server
//!
//! These tests run a real listener on an ephemeral port and talk to it over
//! TCP with the same codec the server uses.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use server::config::ServerConfig;
use server::network::Server;
use shared::{FrameCodec, Framing};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};

const WAIT: Duration = Duration::from_secs(2);

async fn start_server(framing: Framing) -> SocketAddr {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        framing,
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

struct TestClient {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, framing: Framing) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            frames: FramedRead::new(reader, FrameCodec::from(framing)),
            sink: FramedWrite::new(writer, FrameCodec::from(framing)),
        }
    }

    /// Connects and logs in, returning the client with its login reply consumed
    async fn login(addr: SocketAddr, framing: Framing, name: &str, expected_id: u32) -> Self {
        let mut client = Self::connect(addr, framing).await;
        client.send(&format!("0:{}:secret", name)).await;
        client.expect(&format!("0:{}:", expected_id)).await;
        client
    }

    async fn send(&mut self, command: &str) {
        self.sink
            .send(Bytes::copy_from_slice(command.as_bytes()))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        let frame = timeout(WAIT, self.frames.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        String::from_utf8(frame.to_vec()).unwrap()
    }

    async fn expect(&mut self, expected: &str) {
        assert_eq!(self.recv().await, expected);
    }

    /// Asserts nothing arrives within a short window
    async fn expect_silence(&mut self) {
        let next = timeout(Duration::from_millis(100), self.frames.next()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    /// Round-trips a room listing so everything sent before it has been handled
    async fn sync(&mut self) -> String {
        self.send("1").await;
        self.recv().await
    }
}

/// SESSION AND ROOM TESTS
mod room_tests {
    use super::*;

    /// Tests the full login, join, broadcast and departure sequence
    #[tokio::test]
    async fn join_broadcast_and_master_handover() {
        let addr = start_server(Framing::Text).await;
        let mut alice = TestClient::login(addr, Framing::Text, "alice", 0).await;
        let mut bob = TestClient::login(addr, Framing::Text, "bob", 1).await;

        alice.send("2:lobby").await;
        alice.expect("2:0:lobby").await;
        alice.expect("4:0").await;

        bob.send("2:lobby").await;
        bob.expect("2:1:lobby").await;
        bob.expect("2:0:lobby").await;
        bob.expect("4:0").await;
        alice.expect("2:1:lobby").await;

        alice.send("3:0:hi:there").await;
        bob.expect("3:0:hi:there").await;

        bob.send("3:1:everyone").await;
        alice.expect("3:1:everyone").await;
        bob.expect("3:1:everyone").await;
        assert_eq!(alice.sync().await, "1:lobby-2");

        drop(alice);
        bob.expect("2:0:").await;
        bob.expect("4:1").await;
        assert_eq!(bob.sync().await, "1:lobby-1");
    }

    /// Tests that an explicit leave is confirmed and empties the room
    #[tokio::test]
    async fn leave_deletes_empty_room() {
        let addr = start_server(Framing::Text).await;
        let mut carol = TestClient::login(addr, Framing::Text, "carol", 0).await;

        carol.send("2:attic").await;
        carol.expect("2:0:attic").await;
        carol.expect("4:0").await;
        assert_eq!(carol.sync().await, "1:attic-1");

        carol.send("2:-1").await;
        carol.expect("2:0:").await;
        assert_eq!(carol.sync().await, "1:");

        // Leaving again is a no-op
        carol.send("2:-1").await;
        assert_eq!(carol.sync().await, "1:");
    }

    /// Tests that switching rooms leaves the old room first
    #[tokio::test]
    async fn switching_rooms() {
        let addr = start_server(Framing::Text).await;
        let mut dave = TestClient::login(addr, Framing::Text, "dave", 0).await;
        let mut erin = TestClient::login(addr, Framing::Text, "erin", 1).await;

        dave.send("2:red").await;
        dave.expect("2:0:red").await;
        dave.expect("4:0").await;
        erin.send("2:red").await;
        erin.expect("2:1:red").await;
        erin.expect("2:0:red").await;
        erin.expect("4:0").await;
        dave.expect("2:1:red").await;

        dave.send("2:blue").await;
        erin.expect("2:0:").await;
        erin.expect("4:1").await;
        dave.expect("2:0:").await;
        dave.expect("2:0:blue").await;
        dave.expect("4:0").await;

        assert_eq!(erin.sync().await, "1:blue-1,red-1");
    }

    /// Tests that commands before login are ignored
    #[tokio::test]
    async fn commands_before_login_are_dropped() {
        let addr = start_server(Framing::Text).await;
        let mut client = TestClient::connect(addr, Framing::Text).await;

        client.send("1").await;
        client.send("2:lobby").await;
        client.expect_silence().await;

        client.send("0:frank:pw").await;
        client.expect("0:0:").await;
        assert_eq!(client.sync().await, "1:");
    }
}

/// MESSAGING TESTS
mod messaging_tests {
    use super::*;

    /// Tests that group sends reach only online members of the group
    #[tokio::test]
    async fn group_send_reaches_defined_members() {
        let addr = start_server(Framing::Text).await;
        let mut a = TestClient::login(addr, Framing::Text, "a", 0).await;
        let mut b = TestClient::login(addr, Framing::Text, "b", 1).await;
        let mut c = TestClient::login(addr, Framing::Text, "c", 2).await;

        a.send("5:g1:1,2,42").await;
        a.send("4:g1:ping").await;
        b.expect("3:0:ping").await;
        c.expect("3:0:ping").await;

        a.send("5:g1:2").await;
        a.send("4:g1:again").await;
        c.expect("3:0:again").await;

        a.send("4:nope:lost").await;
        assert_eq!(a.sync().await, "1:");
        b.expect_silence().await;
        c.expect_silence().await;
    }

    /// Tests that broadcasts outside a room and malformed frames are ignored
    #[tokio::test]
    async fn invalid_traffic_keeps_session_alive() {
        let addr = start_server(Framing::Text).await;
        let mut client = TestClient::login(addr, Framing::Text, "gina", 0).await;

        client.send("3:0:nobody").await;
        client.send("9:what").await;
        client.send("3:7:bad-mode").await;
        client.send("").await;

        client.send("2:lobby").await;
        client.expect("2:0:lobby").await;
        client.expect("4:0").await;
    }

    /// Tests the length-prefixed framing end to end
    #[tokio::test]
    async fn binary_framing_round_trip() {
        let addr = start_server(Framing::Binary).await;
        let mut host = TestClient::login(addr, Framing::Binary, "host", 0).await;
        let mut guest = TestClient::login(addr, Framing::Binary, "guest", 1).await;

        host.send("2:arena").await;
        host.expect("2:0:arena").await;
        host.expect("4:0").await;
        guest.send("2:arena").await;
        guest.expect("2:1:arena").await;
        guest.expect("2:0:arena").await;
        guest.expect("4:0").await;
        host.expect("2:1:arena").await;

        guest.send("3:2:state\nwith newline").await;
        host.expect("3:1:state\nwith newline").await;
        assert_eq!(guest.sync().await, "1:arena-2");
    }
}
