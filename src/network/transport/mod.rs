//! Point-to-point messaging transport seen by the session.
//!
//! A transport binds an endpoint under an identifier and reports everything
//! that happens to it (endpoint open/disconnect/error, channels opening,
//! data, closure) as [`TransportEvent`]s through an [`EventSink`]. The sink
//! stamps every event with the session generation that created the
//! endpoint, so events from a superseded endpoint can be told apart.

pub mod memory;
pub mod tcp;

use crate::error::{SyncError, TransportError};
use crate::network::message::SyncMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryNetwork;
pub use tcp::TcpTransport;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique link id. Both halves of a link share it.
pub fn next_link_id() -> u64 {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Direction of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,  // Peer dialled us
    Outbound, // We dialled the peer
}

#[derive(Debug)]
pub enum TransportEvent {
    /// Endpoint is bound and reachable under its identifier.
    Open,
    /// Lost the rendezvous; existing channels may survive.
    Disconnected,
    Error(TransportError),
    ChannelOpened {
        channel: Channel,
        direction: Direction,
    },
    ChannelData {
        remote_id: String,
        link_id: u64,
        message: SyncMessage,
    },
    /// An outbound dial failed, or an open channel hit an error.
    ChannelFailed { remote_id: String, reason: String },
    ChannelClosed { remote_id: String, link_id: u64 },
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Open => "open",
            TransportEvent::Disconnected => "disconnected",
            TransportEvent::Error(_) => "error",
            TransportEvent::ChannelOpened { .. } => "channel-opened",
            TransportEvent::ChannelData { .. } => "channel-data",
            TransportEvent::ChannelFailed { .. } => "channel-failed",
            TransportEvent::ChannelClosed { .. } => "channel-closed",
        }
    }
}

#[derive(Debug)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a bound endpoint delivers its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the receiving session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One reliable, ordered link to a remote endpoint.
///
/// Cloning is cheap; all clones share the link. The link is closed for both
/// sides as soon as either side calls [`Channel::close`] or the transport
/// drops it.
#[derive(Debug, Clone)]
pub struct Channel {
    remote_id: String,
    link_id: u64,
    outbound: mpsc::UnboundedSender<SyncMessage>,
    closed: CancellationToken,
}

impl Channel {
    pub fn new(
        remote_id: String,
        link_id: u64,
        outbound: mpsc::UnboundedSender<SyncMessage>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            remote_id,
            link_id,
            outbound,
            closed,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.outbound.is_closed()
    }

    pub fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        if self.closed.is_cancelled() {
            return Err(SyncError::ConnectionSend {
                remote_id: self.remote_id.clone(),
            });
        }
        self.outbound
            .send(message)
            .map_err(|_| SyncError::ConnectionSend {
                remote_id: self.remote_id.clone(),
            })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// A bound endpoint. Outcomes of every call arrive as events.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> &str;

    /// Dial `remote_id`. Reports `ChannelOpened` or `ChannelFailed`.
    fn connect(&self, remote_id: &str);

    /// Re-register with the rendezvous after `Disconnected`.
    fn reconnect(&self);

    /// Release the identifier and close every channel of this endpoint.
    fn destroy(&self);
}

pub trait Transport: Send + Sync + 'static {
    /// Bind an endpoint under `id`. Reports `Open` or `Error` through `sink`.
    ///
    /// Must be called from within a tokio runtime.
    fn bind(&self, id: &str, sink: EventSink) -> Box<dyn Endpoint>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_send_after_close_fails() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Channel::new("peer".into(), next_link_id(), tx, CancellationToken::new());

        assert!(channel.is_open());
        channel.send(SyncMessage::Ping).unwrap();
        assert_eq!(rx.try_recv().unwrap(), SyncMessage::Ping);

        channel.close();
        assert!(!channel.is_open());
        assert_eq!(
            channel.send(SyncMessage::Pong),
            Err(SyncError::ConnectionSend {
                remote_id: "peer".into()
            })
        );
    }

    #[test]
    fn test_channel_send_after_receiver_dropped_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel::new("peer".into(), next_link_id(), tx, CancellationToken::new());
        drop(rx);
        assert!(!channel.is_open());
        assert!(channel.send(SyncMessage::Ping).is_err());
    }

    #[test]
    fn test_sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.emit(TransportEvent::Open));
        let tagged = rx.try_recv().unwrap();
        assert_eq!(tagged.generation, 7);
        assert_eq!(tagged.event.kind(), "open");
    }
}
