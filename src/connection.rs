//! Per-connection supervisor.
//!
//! Drives one client socket through its lifecycle:
//!
//! ```text
//! Accepted -> Handshaking -> Registered -> ReadLoop -> Closed
//!                  |                          |
//!                  +--------> Closed <--------+
//! ```
//!
//! The idle deadline is renewed after every frame, so a client that sends
//! keepalives more often than the idle timeout stays connected and a silent
//! one is closed when the timeout elapses.

use crate::admission::AdmissionGuard;
use crate::config::Config;
use crate::error::{HandshakeFailure, RelayError};
use crate::forward::Forwarder;
use crate::protocol::{parse_username, Frame, FrameReader};
use crate::registry::{BoxedWriter, Client, ClientRegistry, Connection};
use crate::throughput::ThroughputTracker;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// State shared by every supervisor.
pub struct Shared {
    pub config: Config,
    pub registry: Arc<ClientRegistry>,
    pub throughput: Arc<ThroughputTracker>,
    pub forwarder: Forwarder,
}

impl Shared {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new());
        let forwarder = Forwarder::new(Arc::clone(&registry), config.write_timeout);
        Arc::new(Self {
            config,
            registry,
            throughput: Arc::new(ThroughputTracker::new()),
            forwarder,
        })
    }
}

/// Lifecycle state of a supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Handshaking,
    Registered,
    ReadLoop,
    Closed,
}

impl ConnState {
    /// Whether `next` is a legal successor of this state.
    pub fn allows(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Accepted, Handshaking)
                | (Handshaking, Registered)
                | (Registered, ReadLoop)
                | (Accepted | Handshaking | Registered | ReadLoop, Closed)
        )
    }
}

struct Supervisor {
    peer: SocketAddr,
    state: ConnState,
    shared: Arc<Shared>,
    /// Registry key and handle, set once the client is registered
    registration: Option<(usize, Arc<Connection>)>,
    // Held for the connection's lifetime; dropping releases the slot
    _admission: AdmissionGuard,
}

/// Run a connection to completion. Never fails; errors end the connection.
pub async fn supervise(
    stream: TcpStream,
    peer: SocketAddr,
    admission: AdmissionGuard,
    shared: Arc<Shared>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut supervisor = Supervisor {
        peer,
        state: ConnState::Accepted,
        shared,
        registration: None,
        _admission: admission,
    };

    let result = supervisor
        .drive(BufReader::new(read_half), Box::new(write_half))
        .await;
    supervisor.teardown(result);
}

impl Supervisor {
    fn transition(&mut self, next: ConnState) {
        debug_assert!(
            self.state.allows(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    async fn drive<R>(
        &mut self,
        mut reader: R,
        writer: BoxedWriter,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
    {
        self.transition(ConnState::Handshaking);
        let username = self.handshake(&mut reader).await?;
        self.shared
            .throughput
            .increment(self.peer.ip(), self.shared.config.handshake_size as u64);

        let connection = Connection::new(self.peer, writer);
        let key = self
            .shared
            .registry
            .register(Client::new(username.clone(), Arc::clone(&connection)));
        self.registration = Some((key, Arc::clone(&connection)));
        self.transition(ConnState::Registered);
        debug!(peer = %self.peer, username = %username, "Client registered");

        self.transition(ConnState::ReadLoop);
        let config = &self.shared.config;
        let mut frames = FrameReader::new(reader, config.max_content_size, config.max_resync_bytes);

        loop {
            let frame = tokio::select! {
                _ = connection.closed() => {
                    debug!(peer = %self.peer, "Connection closed by forwarder");
                    return Ok(());
                }
                frame = tokio::time::timeout(config.idle_timeout, frames.next_frame()) => {
                    frame.map_err(|_| RelayError::IdleTimeout)??
                }
            };
            self.shared
                .throughput
                .increment(self.peer.ip(), frames.take_consumed());

            match frame {
                Frame::Keepalive => trace!(peer = %self.peer, "Keepalive"),
                Frame::Content { size, payload } => {
                    trace!(peer = %self.peer, size, "Content frame");
                    self.shared.forwarder.forward(&payload).await;
                }
            }
        }
    }

    async fn handshake<R>(&self, reader: &mut R) -> Result<String, HandshakeFailure>
    where
        R: AsyncRead + Unpin,
    {
        let mut field = vec![0u8; self.shared.config.handshake_size];
        let read = reader.read_exact(&mut field);
        match tokio::time::timeout(self.shared.config.handshake_timeout, read).await {
            Err(_) => Err(HandshakeFailure::Timeout),
            Ok(Err(e)) => Err(HandshakeFailure::Io(e)),
            Ok(Ok(_)) => parse_username(&field).ok_or(HandshakeFailure::EmptyUsername),
        }
    }

    fn teardown(&mut self, result: Result<(), RelayError>) {
        match &result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => debug!(peer = %self.peer, "Peer disconnected"),
            Err(
                e @ (RelayError::InvalidFrameSize { .. } | RelayError::ResyncLimitExceeded { .. }),
            ) => {
                warn!(peer = %self.peer, error = %e, "Protocol violation, closing connection")
            }
            Err(e) => debug!(peer = %self.peer, error = %e, "Closing connection"),
        }

        if let Some((key, connection)) = self.registration.take() {
            connection.close();
            self.shared.registry.remove(key);
        }
        self.transition(ConnState::Closed);
    }
}
