use std::time::Duration;

use tracing::debug;

/// Exponential reconnect delay: 1 s, growing by 1.5x, capped at 10 s.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    pub const BASE: Duration = Duration::from_secs(1);
    pub const FACTOR: f64 = 1.5;
    pub const CAP: Duration = Duration::from_secs(10);

    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            current: base,
        }
    }

    /// Delay before the next attempt. Each call grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Self::BASE, Self::FACTOR, Self::CAP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
        }
    }
}

/// `DISCONNECTED -> CONNECTING -> OPEN -> DISCONNECTED`, with the backoff
/// reset whenever a connection opens.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: ReconnectBackoff,
    opened_before: bool,
}

impl ConnectionMachine {
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            opened_before: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connecting(&mut self) {
        self.transition(ConnectionState::Connecting);
    }

    /// Returns `true` when this is not the first connection.
    pub fn opened(&mut self) -> bool {
        self.transition(ConnectionState::Open);
        self.backoff.reset();
        std::mem::replace(&mut self.opened_before, true)
    }

    /// Records the loss of the connection, or a failed attempt, and returns
    /// how long to wait before the next attempt.
    pub fn closed(&mut self) -> Duration {
        self.transition(ConnectionState::Disconnected);
        self.backoff.next_delay()
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            target: "pier::client",
            from = self.state.as_str(),
            to = next.as_str(),
            "connection state"
        );
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn delays_grow_by_half_until_the_cap() {
        let mut backoff = ReconnectBackoff::default();
        let delays: Vec<u128> = (0..9).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(
            delays,
            vec![1000, 1500, 2250, 3375, 5062, 7593, 10000, 10000, 10000]
        );
    }

    #[test_timeout::timeout]
    fn opening_resets_the_backoff() {
        let mut machine = ConnectionMachine::new(ReconnectBackoff::default());
        assert_eq!(machine.state(), ConnectionState::Disconnected);

        machine.connecting();
        assert_eq!(machine.closed(), Duration::from_secs(1));
        machine.connecting();
        assert_eq!(machine.closed(), Duration::from_millis(1500));

        machine.connecting();
        assert!(!machine.opened(), "first connection is not a reconnect");
        assert_eq!(machine.state(), ConnectionState::Open);
        assert_eq!(machine.closed(), Duration::from_secs(1));

        machine.connecting();
        assert!(machine.opened());
    }
}
