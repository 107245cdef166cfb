//! Delivery of content frames to every client registered under the
//! recipient name.
//!
//! One name may have several simultaneous listeners; each gets its own
//! copy. Delivery is best effort: a target that cannot take the frame
//! within the write timeout is closed and the remaining targets are still
//! tried. The sender is never told about failures.

use crate::protocol::{encode_content_frame, recipient};
use crate::registry::ClientRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Outcome of forwarding one frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Forwarder {
    registry: Arc<ClientRegistry>,
    write_timeout: Duration,
}

impl Forwarder {
    pub fn new(registry: Arc<ClientRegistry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Re-frame `payload` unchanged and write it to each matching client.
    pub async fn forward(&self, payload: &[u8]) -> Delivery {
        let recipient = recipient(payload);
        let targets = self.registry.connections_for(&recipient);
        if targets.is_empty() {
            trace!(recipient = %recipient, "No registered recipient");
            return Delivery::default();
        }

        let frame = encode_content_frame(payload);
        let mut delivery = Delivery::default();
        for target in targets {
            match target.send(&frame, self.write_timeout).await {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    debug!(recipient = %recipient, error = %e, "Closing unresponsive recipient");
                    target.close();
                    delivery.failed += 1;
                }
            }
        }

        trace!(
            recipient = %recipient,
            size = payload.len(),
            delivered = delivery.delivered,
            failed = delivery.failed,
            "Forwarded content frame"
        );
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{pad_field, Frame, FrameReader, RECIPIENT_FIELD_SIZE};
    use crate::registry::{Client, Connection};
    use std::net::SocketAddr;
    use tokio::io::DuplexStream;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn register(
        registry: &ClientRegistry,
        username: &str,
        port: u16,
        buffer: usize,
    ) -> (usize, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(buffer);
        let connection = Connection::new(addr(port), Box::new(ours));
        let key = registry.register(Client::new(username.to_string(), connection));
        (key, theirs)
    }

    fn message(to: &str, body: &[u8]) -> Vec<u8> {
        let mut payload = pad_field(to, RECIPIENT_FIELD_SIZE).unwrap();
        payload.extend_from_slice(body);
        payload
    }

    async fn read_payload(peer: DuplexStream) -> Vec<u8> {
        let mut frames = FrameReader::new(peer, 101_000, 0);
        match frames.next_frame().await.unwrap() {
            Frame::Content { payload, .. } => payload.to_vec(),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_shared_username() {
        let registry = Arc::new(ClientRegistry::new());
        let (_, first) = register(&registry, "alice", 1000, 4096);
        let (_, second) = register(&registry, "alice", 1001, 4096);
        let _bob = register(&registry, "bob", 1002, 4096);

        let forwarder = Forwarder::new(Arc::clone(&registry), Duration::from_secs(1));
        let payload = message("alice", b"hello");
        let delivery = forwarder.forward(&payload).await;
        assert_eq!(delivery, Delivery { delivered: 2, failed: 0 });

        assert_eq!(read_payload(first).await, payload);
        assert_eq!(read_payload(second).await, payload);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_noop() {
        let registry = Arc::new(ClientRegistry::new());
        let _bob = register(&registry, "bob", 1000, 4096);

        let forwarder = Forwarder::new(Arc::clone(&registry), Duration::from_secs(1));
        let delivery = forwarder.forward(&message("nobody", b"hello")).await;
        assert_eq!(delivery, Delivery::default());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_recipient_gets_nothing() {
        let registry = Arc::new(ClientRegistry::new());
        let (key, _alice) = register(&registry, "alice", 1000, 4096);
        registry.remove(key);

        let forwarder = Forwarder::new(Arc::clone(&registry), Duration::from_secs(1));
        let delivery = forwarder.forward(&message("alice", b"hello")).await;
        assert_eq!(delivery.delivered, 0);
    }

    #[tokio::test]
    async fn test_slow_recipient_closed_others_delivered() {
        let registry = Arc::new(ClientRegistry::new());
        // Too small to hold the frame and never drained
        let _stuck = register(&registry, "alice", 1000, 16);
        let (_, healthy) = register(&registry, "alice", 1001, 4096);

        let forwarder = Forwarder::new(Arc::clone(&registry), Duration::from_millis(50));
        let payload = message("alice", b"hello");
        let delivery = forwarder.forward(&payload).await;
        assert_eq!(delivery, Delivery { delivered: 1, failed: 1 });

        assert_eq!(read_payload(healthy).await, payload);

        // The stuck connection is closed and no longer a target
        let targets = registry.connections_for("alice");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].address(), addr(1001));
    }

    #[tokio::test]
    async fn test_short_payload_uses_whole_payload_as_name() {
        let registry = Arc::new(ClientRegistry::new());
        let (_, peer) = register(&registry, "carol", 1000, 4096);

        let forwarder = Forwarder::new(Arc::clone(&registry), Duration::from_secs(1));
        let delivery = forwarder.forward(b"carol   ").await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(read_payload(peer).await, b"carol   ");
    }
}
