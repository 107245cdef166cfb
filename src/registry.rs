//! Registry of handshaken clients.
//!
//! Entries are not keyed by username: several live connections may share
//! a name and every one of them is a forwarding target. All access goes
//! through one lock with short critical sections; forwarding works on a
//! snapshot of matching connections so no lock is held across a write.

use crate::error::RelayError;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

/// Write side of a client socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to a client connection.
///
/// The supervisor owns the read side; forwarders write through this handle
/// and may close it, which wakes the supervisor so it can tear down.
pub struct Connection {
    address: SocketAddr,
    writer: tokio::sync::Mutex<BoxedWriter>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Connection {
    pub fn new(address: SocketAddr, writer: BoxedWriter) -> Arc<Self> {
        Arc::new(Self {
            address,
            writer: tokio::sync::Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Write `frame` in full within `timeout`.
    pub async fn send(&self, frame: &[u8], timeout: Duration) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(self.write_failed("connection closed"));
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };

        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.write_failed(&e.to_string())),
            Err(_) => Err(self.write_failed("write timed out")),
        }
    }

    /// Mark closed and wake whoever is waiting in `closed()`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!(peer = %self.address, "Connection closed");
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once `close` has been called.
    pub async fn closed(&self) {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    fn write_failed(&self, reason: &str) -> RelayError {
        RelayError::ForwardWriteFailed {
            address: self.address,
            reason: reason.to_string(),
        }
    }
}

/// A registered client.
#[derive(Clone)]
pub struct Client {
    pub username: String,
    pub connection: Arc<Connection>,
}

impl Client {
    pub fn new(username: String, connection: Arc<Connection>) -> Self {
        Self {
            username,
            connection,
        }
    }
}

/// Process-wide set of registered clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Slab<Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client; the returned key removes exactly this entry.
    pub fn register(&self, client: Client) -> usize {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.insert(client)
    }

    pub fn remove(&self, key: usize) -> Option<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.try_remove(key)
    }

    /// Snapshot of live connections registered under `username`.
    pub fn connections_for(&self, username: &str) -> Vec<Arc<Connection>> {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients
            .iter()
            .filter(|(_, client)| client.username == username && !client.connection.is_closed())
            .map(|(_, client)| Arc::clone(&client.connection))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn client(username: &str, port: u16) -> (Client, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let connection = Connection::new(addr(port), Box::new(ours));
        (Client::new(username.to_string(), connection), theirs)
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ClientRegistry::new();
        let (alice, _a) = client("alice", 1000);
        let (bob, _b) = client("bob", 1001);

        let alice_key = registry.register(alice);
        registry.register(bob);
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(alice_key).unwrap();
        assert_eq!(removed.username, "alice");
        assert!(registry.connections_for("alice").is_empty());
        assert_eq!(registry.connections_for("bob").len(), 1);

        assert!(registry.remove(alice_key).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reconnect_from_same_address_kept() {
        let registry = ClientRegistry::new();
        let (stale, _a) = client("alice", 1000);
        let (fresh, _b) = client("alice", 1000);
        let stale_connection = Arc::clone(&stale.connection);
        let fresh_connection = Arc::clone(&fresh.connection);

        let stale_key = registry.register(stale);
        registry.register(fresh);

        // Tearing down the old connection leaves the new one registered
        let removed = registry.remove(stale_key).unwrap();
        assert!(Arc::ptr_eq(&removed.connection, &stale_connection));
        let targets = registry.connections_for("alice");
        assert_eq!(targets.len(), 1);
        assert!(Arc::ptr_eq(&targets[0], &fresh_connection));
    }

    #[test]
    fn test_shared_username() {
        let registry = ClientRegistry::new();
        let (first, _a) = client("alice", 1000);
        let (second, _b) = client("alice", 1001);
        registry.register(first);
        let second_key = registry.register(second);

        let targets = registry.connections_for("alice");
        assert_eq!(targets.len(), 2);

        // Removing one listener leaves the other in place
        registry.remove(second_key);
        let targets = registry.connections_for("alice");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address(), addr(1000));
    }

    #[test]
    fn test_closed_connections_skipped() {
        let registry = ClientRegistry::new();
        let (alice, _a) = client("alice", 1000);
        let connection = Arc::clone(&alice.connection);
        registry.register(alice);

        connection.close();
        assert!(registry.connections_for("alice").is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (alice, mut peer) = client("alice", 1000);
        alice
            .connection
            .send(b"frame", Duration::from_secs(1))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");
    }

    #[tokio::test]
    async fn test_send_times_out() {
        // Peer never reads, so the 8-byte pipe fills up
        let (ours, _theirs) = tokio::io::duplex(8);
        let connection = Connection::new(addr(1000), Box::new(ours));

        let err = connection
            .send(&[0u8; 64], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ForwardWriteFailed { .. }));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (alice, _peer) = client("alice", 1000);
        alice.connection.close();
        assert!(alice
            .connection
            .send(b"x", Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_closed_wakes_waiter() {
        let (alice, _peer) = client("alice", 1000);
        let connection = Arc::clone(&alice.connection);

        let waiter = tokio::spawn(async move { connection.closed().await });
        tokio::task::yield_now().await;
        alice.connection.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already closed resolves immediately
        alice.connection.closed().await;
    }
}
