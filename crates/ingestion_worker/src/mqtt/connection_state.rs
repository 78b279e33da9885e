use crate::domain::RetryPolicy;
use std::fmt;
use std::time::Duration;

/// Lifecycle of the broker subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
}

/// Transport events that move the subscription between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    ConnAck,
    TransportError,
    Shutdown,
}

impl ConnectionState {
    pub fn on(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (_, Shutdown) => Disconnected,
            (Disconnected, Start) => Connecting,
            (Disconnected, _) => Disconnected,
            (_, ConnAck) => Subscribed,
            (_, TransportError) => Reconnecting,
            (state, Start) => state,
        }
    }

    /// Subscriptions do not survive a disconnect, so they are issued on every
    /// entry into `Subscribed`.
    pub fn requires_subscribe(event: ConnectionEvent) -> bool {
        event == ConnectionEvent::ConnAck
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Delay between reconnect attempts: doubles per consecutive failure up to the
/// maximum, and starts over once a connection is acknowledged.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    delays: RetryPolicy,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            delays: RetryPolicy::new(u32::MAX, min_delay, max_delay),
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delays.delay_for(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
