//! Periodic keepalive over every open connection.
//!
//! Idle relay/NAT mappings expire without traffic, so each tick PINGs every
//! registered connection that still reports open. A connection that leaves
//! `max_missed_pongs` consecutive PINGs unanswered (no traffic of any kind
//! in between) is evicted. Setting the limit to 0 keeps the old behaviour
//! of evicting only on a failed send.

use crate::network::connection_registry::ConnectionRegistry;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    interval: Duration,
    max_missed_pongs: u32,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration, max_missed_pongs: u32) -> Self {
        Self {
            interval,
            max_missed_pongs,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A tokio interval that skips missed ticks instead of bursting.
    pub fn ticker(&self) -> tokio::time::Interval {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker
    }

    pub fn tick(&self, registry: &mut ConnectionRegistry) -> HeartbeatReport {
        let (pinged, evicted) = registry.ping_all(self.max_missed_pongs);

        if !evicted.is_empty() {
            info!(
                "💔 Heartbeat evicted {} connection(s): {:?}",
                evicted.len(),
                evicted
            );
        }
        debug!("💓 Heartbeat: pinged {} connection(s)", pinged);

        HeartbeatReport { pinged, evicted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::SyncMessage;
    use crate::network::transport::{next_link_id, Channel, Direction};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_tick_pings_open_connections() {
        let scheduler = HeartbeatScheduler::new(Duration::from_secs(25), 3);
        let mut registry = ConnectionRegistry::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(
            Channel::new("node-a".into(), next_link_id(), tx, CancellationToken::new()),
            Direction::Inbound,
        );
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        registry.register(
            Channel::new("node-b".into(), next_link_id(), dead_tx, CancellationToken::new()),
            Direction::Inbound,
        );
        drop(dead_rx);

        let report = scheduler.tick(&mut registry);
        assert_eq!(report.pinged, 1);
        assert_eq!(report.evicted, vec!["node-b".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), SyncMessage::Ping);
    }

    #[tokio::test]
    async fn test_ticker_first_tick_after_interval() {
        let scheduler = HeartbeatScheduler::new(Duration::from_millis(50), 3);
        let mut ticker = scheduler.ticker();
        let start = tokio::time::Instant::now();
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
