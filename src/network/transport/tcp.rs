//! TCP transport with a static route table.
//!
//! There is no rendezvous service here: an endpoint that has a listen
//! address accepts channels on it, and `connect(id)` dials whatever address
//! the route table maps `id` to. The dialler's identifier travels in a
//! `HELLO` frame before any [`SyncMessage`]. A listen address that is
//! already in use means another process holds our identifier, so it is
//! reported as an identity collision.

use super::{next_link_id, Channel, Direction, Endpoint, EventSink, Transport, TransportEvent};
use crate::error::TransportError;
use crate::network::message::SyncMessage;
use crate::network::wire::{self, Hello};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    listen_address: Option<String>,
    routes: Arc<HashMap<String, String>>,
}

impl TcpTransport {
    pub fn new(listen_address: Option<String>, routes: HashMap<String, String>) -> Self {
        Self {
            listen_address,
            routes: Arc::new(routes),
        }
    }
}

impl Transport for TcpTransport {
    fn bind(&self, id: &str, sink: EventSink) -> Box<dyn Endpoint> {
        let token = CancellationToken::new();

        match self.listen_address.clone() {
            Some(addr) => {
                tokio::spawn(run_listener(
                    addr,
                    id.to_string(),
                    sink.clone(),
                    token.clone(),
                ));
            }
            None => {
                // Dial-only endpoint: nothing to bind
                sink.emit(TransportEvent::Open);
            }
        }

        Box::new(TcpEndpoint {
            id: id.to_string(),
            routes: self.routes.clone(),
            sink,
            token,
        })
    }
}

struct TcpEndpoint {
    id: String,
    routes: Arc<HashMap<String, String>>,
    sink: EventSink,
    token: CancellationToken,
}

impl Endpoint for TcpEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self, remote_id: &str) {
        let Some(addr) = self.routes.get(remote_id).cloned() else {
            self.sink.emit(TransportEvent::ChannelFailed {
                remote_id: remote_id.to_string(),
                reason: TransportError::UnknownRoute(remote_id.to_string()).to_string(),
            });
            return;
        };

        let local_id = self.id.clone();
        let remote_id = remote_id.to_string();
        let sink = self.sink.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            if let Err(reason) = dial(&addr, &local_id, &remote_id, &sink, &token).await {
                tracing::warn!("❌ Dial to {} ({}) failed: {}", remote_id, addr, reason);
                sink.emit(TransportEvent::ChannelFailed { remote_id, reason });
            }
        });
    }

    fn reconnect(&self) {
        // No rendezvous to re-register with; a live listener is all we need.
        if !self.token.is_cancelled() {
            self.sink.emit(TransportEvent::Open);
        }
    }

    fn destroy(&self) {
        self.token.cancel();
    }
}

async fn run_listener(addr: String, id: String, sink: EventSink, token: CancellationToken) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            let error = if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::IdentityCollision(id)
            } else {
                TransportError::Network(format!("bind {}: {}", addr, e))
            };
            sink.emit(TransportEvent::Error(error));
            return;
        }
    };

    tracing::info!("🔌 Listening for mesh channels on {} as {}", addr, id);
    sink.emit(TransportEvent::Open);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let sink = sink.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept(stream, &sink, &token).await {
                            tracing::debug!("Rejected inbound channel from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed on {}: {}", addr, e);
                    sink.emit(TransportEvent::Error(TransportError::Network(e.to_string())));
                    break;
                }
            }
        }
    }

    tracing::debug!("Listener on {} closed", addr);
}

async fn accept(
    stream: TcpStream,
    sink: &EventSink,
    token: &CancellationToken,
) -> Result<(), String> {
    configure_socket(&stream);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let hello: Hello = match timeout(HELLO_TIMEOUT, wire::read_frame(&mut reader)).await {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => return Err("closed before HELLO".to_string()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err("HELLO timeout".to_string()),
    };

    start_link(
        hello.id,
        Direction::Inbound,
        reader,
        BufWriter::new(writer),
        sink,
        token,
    );
    Ok(())
}

async fn dial(
    addr: &str,
    local_id: &str,
    remote_id: &str,
    sink: &EventSink,
    token: &CancellationToken,
) -> Result<(), String> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| "connect timeout".to_string())?
        .map_err(|e| format!("Connection failed: {}", e))?;
    configure_socket(&stream);

    let (reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);
    wire::write_frame(
        &mut writer,
        &Hello {
            id: local_id.to_string(),
        },
    )
    .await?;

    start_link(
        remote_id.to_string(),
        Direction::Outbound,
        BufReader::new(reader),
        writer,
        sink,
        token,
    );
    Ok(())
}

fn configure_socket(stream: &TcpStream) {
    // Disable Nagle's algorithm to prevent batching of small messages
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(30))
        .with_interval(std::time::Duration::from_secs(10));

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        tracing::warn!("Failed to set TCP_KEEPALIVE: {}", e);
    }
}

fn start_link<R, W>(
    remote_id: String,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    sink: &EventSink,
    endpoint_token: &CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let link_id = next_link_id();
    let link = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<SyncMessage>();

    sink.emit(TransportEvent::ChannelOpened {
        channel: Channel::new(remote_id.clone(), link_id, tx, link.clone()),
        direction,
    });

    // Writer half
    {
        let link = link.clone();
        let endpoint_token = endpoint_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = link.cancelled() => break,
                    _ = endpoint_token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(message) => {
                            if let Err(e) = wire::write_message(&mut writer, &message).await {
                                tracing::debug!("Write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            link.cancel();
        });
    }

    // Reader half
    let sink = sink.clone();
    let endpoint_token = endpoint_token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = link.cancelled() => break,
                _ = endpoint_token.cancelled() => break,
                result = wire::read_message(&mut reader) => match result {
                    Ok(Some(message)) => {
                        let delivered = sink.emit(TransportEvent::ChannelData {
                            remote_id: remote_id.clone(),
                            link_id,
                            message,
                        });
                        if !delivered {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(reason) => {
                        sink.emit(TransportEvent::ChannelFailed {
                            remote_id: remote_id.clone(),
                            reason,
                        });
                        break;
                    }
                }
            }
        }
        link.cancel();
        sink.emit(TransportEvent::ChannelClosed { remote_id, link_id });
    });
}
