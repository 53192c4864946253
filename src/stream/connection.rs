use crate::stream::types::{ConnectionState, StreamConfig};
use std::time::Duration;
use tracing::{debug, info};

/// Identifies one transport session. Events carrying a stale id are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_cap: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            base_delay_ms: config.reconnect_base_ms,
            max_delay_ms: config.reconnect_max_ms,
            attempt_cap: config.reconnect_attempt_cap,
        }
    }

    /// `min(base * 2^attempt, max)`, with the exponent frozen at the attempt cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.attempt_cap);
        let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The event belonged to a session that is no longer live.
    Stale,
    Idle,
    Reconnect { attempt: u32, delay: Duration },
}

/// Reconnection state machine. Owns no I/O: callers open and close transports
/// according to the session ids it hands out.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempt: u32,
    should_reconnect: bool,
    visible: bool,
    next_session: u64,
    live: Option<SessionId>,
}

impl ConnectionManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempt: 0,
            should_reconnect: true,
            visible: true,
            next_session: 0,
            live: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.live
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        self.live == Some(session)
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_should_reconnect(&mut self, should_reconnect: bool) {
        self.should_reconnect = should_reconnect;
    }

    pub fn reset_attempts(&mut self) {
        self.attempt = 0;
    }

    /// Starts a new session unless one is already live or connecting is not allowed.
    pub fn connect(&mut self) -> Option<SessionId> {
        if !self.should_reconnect || !self.visible {
            debug!(
                should_reconnect = self.should_reconnect,
                visible = self.visible,
                "connect refused"
            );
            return None;
        }
        if !matches!(self.state, ConnectionState::Disconnected) {
            return None;
        }

        self.next_session = self.next_session.wrapping_add(1);
        let session = SessionId(self.next_session);
        self.live = Some(session);
        self.state = ConnectionState::Connecting;
        info!(session = session.0, attempt = self.attempt, "opening transport");
        Some(session)
    }

    pub fn on_open(&mut self, session: SessionId) -> bool {
        if !self.is_current(session) {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        info!(session = session.0, "transport connected");
        true
    }

    pub fn on_closed(&mut self, session: SessionId) -> CloseOutcome {
        if !self.is_current(session) {
            return CloseOutcome::Stale;
        }
        self.live = None;
        self.state = ConnectionState::Disconnected;

        if !(self.should_reconnect && self.visible) {
            return CloseOutcome::Idle;
        }

        let attempt = self.attempt;
        let delay = self.policy.delay_for(attempt);
        self.state = ConnectionState::Reconnecting {
            attempt,
            delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
        };
        info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "transport closed, scheduling reconnect"
        );
        CloseOutcome::Reconnect { attempt, delay }
    }

    pub fn on_backoff_elapsed(&mut self) -> Option<SessionId> {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1).min(self.policy.attempt_cap);
        self.state = ConnectionState::Disconnected;
        self.connect()
    }

    /// Drops the live session and any pending reconnect. Returns the session the
    /// caller must close.
    pub fn teardown(&mut self) -> Option<SessionId> {
        self.state = ConnectionState::Disconnected;
        self.live.take()
    }
}
