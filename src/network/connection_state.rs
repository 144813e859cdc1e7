use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle of the local transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never started
    Idle,
    /// Endpoint bound, waiting for the transport to report open
    Opening { started_at: Instant },
    /// Registered and reachable
    Open { since: Instant },
    /// Lost the rendezvous past the debounce window
    Disconnected,
    /// Transport reconnect primitive invoked, waiting for open
    Reconnecting { since: Instant },
    /// Endpoint released
    Destroyed,
}

/// Three-state indicator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Disconnected,
}

impl SessionState {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionState::Open { .. })
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, SessionState::Destroyed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Opening { .. } => "opening",
            SessionState::Open { .. } => "open",
            SessionState::Disconnected => "disconnected",
            SessionState::Reconnecting { .. } => "reconnecting",
            SessionState::Destroyed => "destroyed",
        }
    }

    pub fn status(&self) -> SyncStatus {
        match self {
            SessionState::Open { .. } => SyncStatus::Synced,
            SessionState::Opening { .. } | SessionState::Reconnecting { .. } => SyncStatus::Syncing,
            SessionState::Idle | SessionState::Disconnected | SessionState::Destroyed => {
                SyncStatus::Disconnected
            }
        }
    }

    /// Transition table.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Opening { .. })
                | (Destroyed, Opening { .. })
                | (Opening { .. }, Open { .. })
                | (Opening { .. }, Destroyed)
                | (Open { .. }, Disconnected)
                | (Open { .. }, Destroyed)
                | (Disconnected, Reconnecting { .. })
                | (Disconnected, Destroyed)
                | (Reconnecting { .. }, Open { .. })
                | (Reconnecting { .. }, Destroyed)
        )
    }
}

/// Session state with validated transitions.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true if the transition was valid and applied.
    pub fn try_transition(&mut self, next: SessionState) -> bool {
        if self.state.can_transition_to(&next) {
            debug!(
                "✅ Session transition: {} -> {}",
                self.state.name(),
                next.name()
            );
            self.state = next;
            true
        } else {
            warn!(
                "❌ Invalid session transition: {} -> {}",
                self.state.name(),
                next.name()
            );
            false
        }
    }

    pub fn mark_opening(&mut self) -> bool {
        self.try_transition(SessionState::Opening {
            started_at: Instant::now(),
        })
    }

    pub fn mark_open(&mut self) -> bool {
        self.try_transition(SessionState::Open {
            since: Instant::now(),
        })
    }

    pub fn mark_disconnected(&mut self) -> bool {
        self.try_transition(SessionState::Disconnected)
    }

    pub fn mark_reconnecting(&mut self) -> bool {
        self.try_transition(SessionState::Reconnecting {
            since: Instant::now(),
        })
    }

    /// Destroy is allowed from every live state; a no-op when idle or already destroyed.
    pub fn mark_destroyed(&mut self) -> bool {
        match self.state {
            SessionState::Idle | SessionState::Destroyed => false,
            _ => self.try_transition(SessionState::Destroyed),
        }
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry bookkeeping for the hub link.
///
/// `attempt` grows without bound; only the delay saturates at the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    base: Duration,
    cap: Duration,
}

impl ReconnectState {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    /// Delay for a given attempt: `min(base * 2^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let delay_ms = 2u64
            .checked_pow(attempt)
            .and_then(|factor| base_ms.checked_mul(factor))
            .map_or(cap_ms, |ms| ms.min(cap_ms));
        Duration::from_millis(delay_ms)
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
