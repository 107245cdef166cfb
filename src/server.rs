//! TCP server for the relay.
//!
//! Accepts connections, gates them through per-address admission, and
//! spawns one supervisor task per admitted socket. A separate task runs
//! the reporting cycle.

use crate::admission::AdmissionTable;
use crate::config::Config;
use crate::connection::{supervise, Shared};
use crate::metrics::Reporter;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    admission: Arc<AdmissionTable>,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        info!(address = %listener.local_addr()?, "Server listening");

        Ok(Server {
            listener,
            admission: AdmissionTable::new(config.max_connections_per_address),
            shared: Shared::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get a reference to the shared state for testing
    #[cfg(test)]
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> io::Result<()> {
        let reporter = Reporter::new(
            Arc::clone(&self.admission),
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.throughput),
            self.shared.config.report_interval,
        );
        tokio::spawn(reporter.run());

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let admission = match self.admission.try_admit(peer.ip()) {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Rejecting connection");
                            drop(stream);
                            continue;
                        }
                    };
                    if admission.first_seen() {
                        self.shared.throughput.set(admission.address(), 0);
                    }
                    debug!(peer = %peer, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(supervise(stream, peer, admission, shared));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
