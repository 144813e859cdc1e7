use crate::error::SyncError;
use crate::network::message::SyncMessage;
use crate::network::transport::{Channel, Direction};
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

struct RegisteredConnection {
    channel: Channel,
    direction: Direction,
    connected_at: Instant,
    /// A PING went out and nothing has come back since.
    awaiting_pong: bool,
    missed_pongs: u32,
}

/// Summary of one registered connection (for status/monitoring).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_id: String,
    pub direction: Direction,
    pub connected_for_secs: u64,
    pub missed_pongs: u32,
}

/// Every open channel of this device, keyed by remote identifier.
///
/// Owned by the session actor and only touched from its task. A failed
/// send deregisters the connection on the spot; callers only learn which
/// ids were dropped.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, RegisteredConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. A previous channel for the same remote is closed and returned.
    pub fn register(&mut self, channel: Channel, direction: Direction) -> Option<Channel> {
        let remote_id = channel.remote_id().to_string();
        let replaced = self.connections.insert(
            remote_id.clone(),
            RegisteredConnection {
                channel,
                direction,
                connected_at: Instant::now(),
                awaiting_pong: false,
                missed_pongs: 0,
            },
        );
        debug!("✅ Registered connection: {} ({:?})", remote_id, direction);

        replaced.map(|old| {
            debug!("Replacing existing connection to {}", remote_id);
            old.channel.close();
            old.channel
        })
    }

    /// Remove and close the connection to `remote_id`.
    pub fn unregister(&mut self, remote_id: &str) -> bool {
        match self.connections.remove(remote_id) {
            Some(conn) => {
                conn.channel.close();
                debug!("🔌 Unregistered connection: {}", remote_id);
                true
            }
            None => false,
        }
    }

    /// Remove `remote_id` only if it is still the given link (ignores events from replaced links).
    pub fn unregister_link(&mut self, remote_id: &str, link_id: u64) -> bool {
        let matches = self
            .connections
            .get(remote_id)
            .is_some_and(|conn| conn.channel.link_id() == link_id);
        matches && self.unregister(remote_id)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.connections.contains_key(remote_id)
    }

    pub fn is_current_link(&self, remote_id: &str, link_id: u64) -> bool {
        self.connections
            .get(remote_id)
            .is_some_and(|conn| conn.channel.link_id() == link_id)
    }

    pub fn is_open(&self, remote_id: &str) -> bool {
        self.connections
            .get(remote_id)
            .is_some_and(|conn| conn.channel.is_open())
    }

    /// Any traffic from a peer proves the path is alive.
    pub fn mark_active(&mut self, remote_id: &str) {
        if let Some(conn) = self.connections.get_mut(remote_id) {
            conn.awaiting_pong = false;
            conn.missed_pongs = 0;
        }
    }

    /// Send to one peer. On failure the connection is deregistered.
    pub fn send_to_peer(&mut self, remote_id: &str, message: SyncMessage) -> Result<(), SyncError> {
        let result = match self.connections.get(remote_id) {
            Some(conn) => conn.channel.send(message),
            None => {
                return Err(SyncError::ConnectionSend {
                    remote_id: remote_id.to_string(),
                })
            }
        };

        if result.is_err() {
            debug!("🔌 Send to {} failed, dropping connection", remote_id);
            self.unregister(remote_id);
        }
        result
    }

    /// Send to every registered peer. Returns the ids dropped because the send failed.
    pub fn broadcast(&mut self, message: &SyncMessage) -> Vec<String> {
        if self.connections.is_empty() {
            debug!(
                "⚠️  Broadcast: no peers connected (message type: {})",
                message.message_type()
            );
            return Vec::new();
        }

        debug!(
            "📡 Broadcasting {} to {} peer(s)",
            message.message_type(),
            self.connections.len()
        );

        let failed: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.channel.send(message.clone()).is_err())
            .map(|(id, _)| id.clone())
            .collect();

        for remote_id in &failed {
            self.unregister(remote_id);
        }
        failed
    }

    /// PING every open connection, counting the previous PING as missed if unanswered.
    ///
    /// Connections reaching `max_missed` (when non-zero) and connections whose
    /// send fails are deregistered; their ids are returned.
    pub fn ping_all(&mut self, max_missed: u32) -> (usize, Vec<String>) {
        let mut pinged = 0;
        let mut dropped = Vec::new();

        for (remote_id, conn) in self.connections.iter_mut() {
            if !conn.channel.is_open() {
                dropped.push(remote_id.clone());
                continue;
            }

            if conn.awaiting_pong {
                conn.missed_pongs += 1;
                debug!(
                    "⚠️ No PONG from {} (missed: {}/{})",
                    remote_id, conn.missed_pongs, max_missed
                );
                if max_missed > 0 && conn.missed_pongs >= max_missed {
                    dropped.push(remote_id.clone());
                    continue;
                }
            }

            if conn.channel.send(SyncMessage::Ping).is_err() {
                dropped.push(remote_id.clone());
                continue;
            }
            conn.awaiting_pong = true;
            pinged += 1;
        }

        for remote_id in &dropped {
            self.unregister(remote_id);
        }
        (pinged, dropped)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|(id, conn)| ConnectionInfo {
                remote_id: id.clone(),
                direction: conn.direction,
                connected_for_secs: conn.connected_at.elapsed().as_secs(),
                missed_pongs: conn.missed_pongs,
            })
            .collect();
        infos.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        infos
    }

    pub fn peer_count(&self) -> usize {
        self.connections.len()
    }

    /// Close and forget every connection.
    pub fn clear(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.channel.close();
        }
    }
}
