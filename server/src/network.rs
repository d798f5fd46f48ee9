//! Server network layer: TCP listener and per-connection session tasks
//!
//! Every accepted connection gets two tasks:
//! - **ingest** reads frames, decodes commands and drives the [`RoomEngine`]
//! - **egress** drains the session's outbound queue to the socket
//!
//! Teardown is ordered: ingest marks the session dead, wakes egress, waits for
//! it to finish, and only then removes the client from its room and from the
//! client registry.

use crate::client::{ClientSession, OutboxReceiver, Outbound, SessionPhase, SessionState};
use crate::client_manager::ClientRegistry;
use crate::config::ServerConfig;
use crate::engine::RoomEngine;
use crate::room::RoomRegistry;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ClientId, FrameCodec, FrameError};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Relay server bound to a listening socket
pub struct Server {
    listener: TcpListener,
    engine: Arc<RoomEngine>,
    config: ServerConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        info!(
            "Server listening on {} ({} framing)",
            listener.local_addr()?,
            config.framing
        );

        let engine = RoomEngine::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(RoomRegistry::new()),
        );

        Ok(Server {
            listener,
            engine: Arc::new(engine),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn engine(&self) -> Arc<RoomEngine> {
        Arc::clone(&self.engine)
    }

    /// Accepts connections until the process is terminated
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves
    ///
    /// Sessions already running are not interrupted.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Server no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
        }

        let client_id = self.engine.clients().allocate_id();
        info!("Client {} connected from {}", client_id, peer);

        let engine = Arc::clone(&self.engine);
        let codec = FrameCodec::new(self.config.framing, self.config.max_frame);
        let read_buffer = self.config.read_buffer;

        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            run_session(reader, writer, client_id, engine, codec, read_buffer).await;
            info!("Client {} disconnected", client_id);
        });
    }
}

/// Runs one session from accept to teardown
///
/// Returns once the connection is closed and the client has been removed
/// from all shared state.
pub async fn run_session<R, W>(
    reader: R,
    writer: W,
    client_id: ClientId,
    engine: Arc<RoomEngine>,
    codec: FrameCodec,
    read_buffer: usize,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, outbox) = ClientSession::new(client_id);
    let mut state = SessionState::new();

    let sink = FramedWrite::new(writer, codec.clone());
    let egress = tokio::spawn(run_egress(sink, outbox, Arc::clone(&session)));
    state.set_phase(client_id, SessionPhase::Authenticating);

    let frames = FramedRead::with_capacity(reader, codec, read_buffer);
    run_ingest(frames, &session, &mut state, &engine).await;

    state.set_phase(client_id, SessionPhase::Disconnecting);
    session.close_outbox();
    if let Err(e) = egress.await {
        error!("Egress task for client {} failed: {}", client_id, e);
    }

    engine.disconnect(&session, &mut state).await;
    state.set_phase(client_id, SessionPhase::Terminated);
}

async fn run_ingest<R>(
    mut frames: FramedRead<R, FrameCodec>,
    session: &Arc<ClientSession>,
    state: &mut SessionState,
    engine: &RoomEngine,
) where
    R: AsyncRead + Unpin,
{
    let client_id = session.id();

    loop {
        tokio::select! {
            _ = session.disconnected() => {
                info!("Client {} disconnected by the server", client_id);
                break;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => engine.handle_frame(session, state, &frame).await,
                Some(Err(e)) => {
                    warn!("Read from client {} failed: {}", client_id, e);
                    break;
                }
                None => {
                    debug!("Client {} closed the connection", client_id);
                    break;
                }
            },
        }
    }
}

/// Writes queued frames until the close marker arrives
///
/// A forced disconnect stops egress at once, mid-write if the peer has
/// stopped reading, and the rest of the queue is dropped. A failed write
/// forces the session down the same way.
async fn run_egress<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbox: OutboxReceiver,
    session: Arc<ClientSession>,
) where
    W: AsyncWrite + Unpin,
{
    let client_id = session.id();

    let drained = tokio::select! {
        drained = drain_outbox(&mut sink, &mut outbox) => Some(drained),
        _ = session.disconnected() => None,
    };

    match drained {
        Some(Ok(())) => {
            if let Err(e) = sink.close().await {
                debug!("Closing connection to client {} failed: {}", client_id, e);
            }
        }
        Some(Err(e)) => {
            debug!("Write to client {} failed: {}", client_id, e);
            session.disconnect();
        }
        None => debug!("Client {} forced down, queued frames dropped", client_id),
    }
    debug!("Egress for client {} finished", client_id);
}

/// Frames queued together are flushed together
async fn drain_outbox<W>(
    sink: &mut FramedWrite<W, FrameCodec>,
    outbox: &mut OutboxReceiver,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = outbox.recv().await {
        let mut open = true;
        let mut pending = Some(first);
        while let Some(item) = pending.take() {
            match item {
                Outbound::Frame(frame) => {
                    sink.feed(frame).await?;
                    pending = outbox.try_recv().ok();
                }
                Outbound::Close => open = false,
            }
        }
        sink.flush().await?;

        if !open {
            break;
        }
    }
    Ok(())
}
