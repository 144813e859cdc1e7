//! Spoke-side supervision of the single outbound link to the hub.
//!
//! The supervisor only decides; the session performs the side effects
//! (dialling, scheduling the retry timer, sending the snapshot).

use crate::network::connection_state::ReconnectState;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubLinkState {
    Down,
    Dialing,
    Up { link_id: u64 },
    RetryScheduled,
}

#[derive(Debug)]
pub struct HubSupervisor {
    hub_id: String,
    state: HubLinkState,
    reconnect: ReconnectState,
}

impl HubSupervisor {
    pub fn new(hub_id: String, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            hub_id,
            state: HubLinkState::Down,
            reconnect: ReconnectState::new(backoff_base, backoff_cap),
        }
    }

    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    pub fn state(&self) -> HubLinkState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.reconnect.attempt
    }

    pub fn is_up(&self) -> bool {
        matches!(self.state, HubLinkState::Up { .. })
    }

    pub fn is_hub(&self, remote_id: &str) -> bool {
        remote_id == self.hub_id
    }

    /// Returns true if a dial should be issued now.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            HubLinkState::Up { .. } | HubLinkState::Dialing => false,
            HubLinkState::Down | HubLinkState::RetryScheduled => {
                info!("🔗 Dialing hub {}", self.hub_id);
                self.state = HubLinkState::Dialing;
                true
            }
        }
    }

    pub fn on_open(&mut self, link_id: u64) {
        info!("🤝 Hub link to {} open", self.hub_id);
        self.state = HubLinkState::Up { link_id };
        self.reconnect.reset();
    }

    /// The hub link failed or closed. Returns the retry delay, or None if a
    /// retry is already pending or `link_id` names a superseded link.
    pub fn on_failure(&mut self, link_id: Option<u64>, reason: &str) -> Option<Duration> {
        match (self.state, link_id) {
            (HubLinkState::RetryScheduled, _) => return None,
            (HubLinkState::Up { link_id: current }, Some(closed)) if current != closed => {
                return None
            }
            (HubLinkState::Down, _) => return None,
            _ => {}
        }

        let delay = self.reconnect.next_delay();
        warn!(
            "❌ Hub link to {} lost ({}), retry #{} in {}ms",
            self.hub_id,
            reason,
            self.reconnect.attempt,
            delay.as_millis()
        );
        self.state = HubLinkState::RetryScheduled;
        Some(delay)
    }

    /// Endpoint (re)opened: the next failure starts from the base delay again.
    pub fn reset_backoff(&mut self) {
        self.reconnect.reset();
    }

    /// Endpoint went away; forget the link without scheduling anything.
    pub fn reset(&mut self) {
        self.state = HubLinkState::Down;
        self.reconnect.reset();
    }
}
