//! In-process rendezvous for running whole meshes inside one process.
//!
//! Identifiers are bound in a shared table; a second bind of a live
//! identifier is an identity collision. Each link is a pair of unbounded
//! queues drained by pump tasks, which gives per-link ordering and no
//! ordering across links.

use super::{next_link_id, Channel, Direction, Endpoint, EventSink, Transport, TransportEvent};
use crate::error::TransportError;
use crate::network::message::SyncMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Binding {
    serial: u64,
    sink: EventSink,
    token: CancellationToken,
    /// Registered with the rendezvous (false after a simulated signaling drop).
    online: bool,
    /// Drop everything addressed to this endpoint.
    frozen: Arc<AtomicBool>,
}

#[derive(Default)]
struct Rendezvous {
    bindings: HashMap<String, Binding>,
    next_serial: u64,
}

/// Shared in-memory rendezvous. Clone it into every peer of a simulated mesh.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Rendezvous>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, id: &str) -> bool {
        self.inner.lock().bindings.contains_key(id)
    }

    pub fn bound_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().bindings.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Simulate losing the rendezvous connection. Open links keep working.
    pub fn sever_signaling(&self, id: &str) {
        let mut rendezvous = self.inner.lock();
        if let Some(binding) = rendezvous.bindings.get_mut(id) {
            binding.online = false;
            binding.sink.emit(TransportEvent::Disconnected);
        }
    }

    /// Simulate a dead path: messages addressed to `id` vanish.
    pub fn set_frozen(&self, id: &str, frozen: bool) {
        if let Some(binding) = self.inner.lock().bindings.get(id) {
            binding.frozen.store(frozen, Ordering::SeqCst);
        }
    }

    /// Force a transport error on a bound endpoint.
    pub fn inject_error(&self, id: &str, error: TransportError) {
        if let Some(binding) = self.inner.lock().bindings.get(id) {
            binding.sink.emit(TransportEvent::Error(error));
        }
    }
}

impl Transport for MemoryNetwork {
    fn bind(&self, id: &str, sink: EventSink) -> Box<dyn Endpoint> {
        let mut rendezvous = self.inner.lock();
        rendezvous.next_serial += 1;
        let serial = rendezvous.next_serial;
        let token = CancellationToken::new();

        if rendezvous.bindings.contains_key(id) {
            debug!(id, "memory bind refused: identifier taken");
            sink.emit(TransportEvent::Error(TransportError::IdentityCollision(
                id.to_string(),
            )));
            token.cancel();
        } else {
            rendezvous.bindings.insert(
                id.to_string(),
                Binding {
                    serial,
                    sink: sink.clone(),
                    token: token.clone(),
                    online: true,
                    frozen: Arc::new(AtomicBool::new(false)),
                },
            );
            sink.emit(TransportEvent::Open);
        }

        Box::new(MemoryEndpoint {
            id: id.to_string(),
            serial,
            network: self.clone(),
            sink,
            token,
        })
    }
}

struct MemoryEndpoint {
    id: String,
    serial: u64,
    network: MemoryNetwork,
    sink: EventSink,
    token: CancellationToken,
}

impl MemoryEndpoint {
    fn fail(&self, remote_id: &str, reason: &str) {
        self.sink.emit(TransportEvent::ChannelFailed {
            remote_id: remote_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl Endpoint for MemoryEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self, remote_id: &str) {
        let rendezvous = self.network.inner.lock();

        let local = match rendezvous.bindings.get(&self.id) {
            Some(b) if b.serial == self.serial && b.online => b,
            _ => {
                self.fail(remote_id, "endpoint not registered");
                return;
            }
        };
        let remote = match rendezvous.bindings.get(remote_id) {
            Some(b) if b.online && !b.token.is_cancelled() => b,
            _ => {
                self.fail(remote_id, "peer unavailable");
                return;
            }
        };

        let link_id = next_link_id();
        let link = CancellationToken::new();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();

        remote.sink.emit(TransportEvent::ChannelOpened {
            channel: Channel::new(self.id.clone(), link_id, remote_tx, link.clone()),
            direction: Direction::Inbound,
        });
        local.sink.emit(TransportEvent::ChannelOpened {
            channel: Channel::new(remote_id.to_string(), link_id, local_tx, link.clone()),
            direction: Direction::Outbound,
        });

        tokio::spawn(pump(
            local_rx,
            PumpEnds {
                from_id: self.id.clone(),
                link_id,
                link: link.clone(),
                from_token: local.token.clone(),
                to_token: remote.token.clone(),
                to_sink: remote.sink.clone(),
                to_frozen: remote.frozen.clone(),
            },
        ));
        tokio::spawn(pump(
            remote_rx,
            PumpEnds {
                from_id: remote_id.to_string(),
                link_id,
                link,
                from_token: remote.token.clone(),
                to_token: local.token.clone(),
                to_sink: local.sink.clone(),
                to_frozen: local.frozen.clone(),
            },
        ));
    }

    fn reconnect(&self) {
        let mut rendezvous = self.network.inner.lock();
        match rendezvous.bindings.get_mut(&self.id) {
            Some(binding) if binding.serial == self.serial => {
                binding.online = true;
                binding.sink.emit(TransportEvent::Open);
            }
            _ => {
                self.sink.emit(TransportEvent::Error(TransportError::Network(
                    "binding lost".to_string(),
                )));
            }
        }
    }

    fn destroy(&self) {
        self.token.cancel();
        let mut rendezvous = self.network.inner.lock();
        if rendezvous
            .bindings
            .get(&self.id)
            .is_some_and(|b| b.serial == self.serial)
        {
            rendezvous.bindings.remove(&self.id);
        }
    }
}

struct PumpEnds {
    from_id: String,
    link_id: u64,
    link: CancellationToken,
    from_token: CancellationToken,
    to_token: CancellationToken,
    to_sink: EventSink,
    to_frozen: Arc<AtomicBool>,
}

async fn pump(mut rx: mpsc::UnboundedReceiver<SyncMessage>, ends: PumpEnds) {
    loop {
        tokio::select! {
            _ = ends.link.cancelled() => break,
            _ = ends.from_token.cancelled() => break,
            _ = ends.to_token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(message) => {
                    if ends.to_frozen.load(Ordering::SeqCst) {
                        continue;
                    }
                    let delivered = ends.to_sink.emit(TransportEvent::ChannelData {
                        remote_id: ends.from_id.clone(),
                        link_id: ends.link_id,
                        message,
                    });
                    if !delivered {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    ends.link.cancel();
    ends.to_sink.emit(TransportEvent::ChannelClosed {
        remote_id: ends.from_id,
        link_id: ends.link_id,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::TaggedEvent;
    use std::time::Duration;

    async fn next(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("sink closed")
            .event
    }

    #[tokio::test]
    async fn test_bind_collision() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let _a = network.bind("hub-acme", EventSink::new(1, tx_a));
        assert!(matches!(next(&mut rx_a).await, TransportEvent::Open));

        let b = network.bind("hub-acme", EventSink::new(1, tx_b));
        assert!(matches!(
            next(&mut rx_b).await,
            TransportEvent::Error(TransportError::IdentityCollision(_))
        ));

        // Destroying the loser must not release the winner's binding
        b.destroy();
        assert!(network.is_bound("hub-acme"));
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let a = network.bind("node-a", EventSink::new(1, tx_a));
        let _b = network.bind("hub-x", EventSink::new(1, tx_b));
        next(&mut rx_a).await;
        next(&mut rx_b).await;

        a.connect("hub-x");
        let inbound = match next(&mut rx_b).await {
            TransportEvent::ChannelOpened { channel, direction } => {
                assert_eq!(direction, Direction::Inbound);
                assert_eq!(channel.remote_id(), "node-a");
                channel
            }
            other => panic!("unexpected {:?}", other),
        };
        let outbound = match next(&mut rx_a).await {
            TransportEvent::ChannelOpened { channel, direction } => {
                assert_eq!(direction, Direction::Outbound);
                channel
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(inbound.link_id(), outbound.link_id());

        outbound.send(SyncMessage::Ping).unwrap();
        match next(&mut rx_b).await {
            TransportEvent::ChannelData {
                remote_id, message, ..
            } => {
                assert_eq!(remote_id, "node-a");
                assert_eq!(message, SyncMessage::Ping);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Destroying one endpoint closes the link for the other
        a.destroy();
        assert!(matches!(
            next(&mut rx_b).await,
            TransportEvent::ChannelClosed { .. }
        ));
        assert!(!network.is_bound("node-a"));
    }

    #[tokio::test]
    async fn test_connect_to_missing_peer_fails() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = network.bind("node-a", EventSink::new(1, tx));
        next(&mut rx).await;

        a.connect("hub-nowhere");
        assert!(matches!(
            next(&mut rx).await,
            TransportEvent::ChannelFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_sever_and_reconnect() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = network.bind("node-a", EventSink::new(1, tx));
        next(&mut rx).await;

        network.sever_signaling("node-a");
        assert!(matches!(next(&mut rx).await, TransportEvent::Disconnected));

        a.reconnect();
        assert!(matches!(next(&mut rx).await, TransportEvent::Open));
    }
}
