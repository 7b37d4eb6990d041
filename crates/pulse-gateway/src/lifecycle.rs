//! Connection lifecycle state machine.
//!
//! One connection moves through:
//!
//! ```text
//! Connecting → Connected → HandshakePending → Authenticated → Active ⇄ Degraded
//!                                                               ↓        ↓
//!                                                             Closing → Closed
//! ```
//!
//! with an `Error → Recovery → Active` side path. Transitions are guarded by
//! compare-and-set on an atomic state field, so concurrent transition
//! attempts cannot interleave. `transition_to_closing` fails when the
//! connection is already `Closing`/`Closed`, which is the double-close guard.

use std::sync::atomic::{AtomicU8, Ordering};

/// State of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// TCP/WS accept in progress.
    Connecting = 0,
    /// Transport established, handshake not started.
    Connected = 1,
    /// Application handshake in flight.
    HandshakePending = 2,
    /// Auth layer validated the user.
    Authenticated = 3,
    /// Live and writable.
    Active = 4,
    /// Live but unhealthy (missed heartbeats, transient write failures).
    Degraded = 5,
    /// Close initiated; no further writes admitted.
    Closing = 6,
    /// Terminal.
    Closed = 7,
    /// Fault observed; eligible for recovery.
    Error = 8,
    /// Recovering from `Error` back toward `Active`.
    Recovery = 9,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::HandshakePending,
            3 => Self::Authenticated,
            4 => Self::Active,
            5 => Self::Degraded,
            6 => Self::Closing,
            7 => Self::Closed,
            8 => Self::Error,
            _ => Self::Recovery,
        }
    }

    /// Whether writes are admitted in this state.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// Whether the connection is shutting down or gone.
    #[must_use]
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Whether `self → to` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use ConnectionState::{
            Active, Authenticated, Closed, Closing, Connected, Connecting, Degraded, Error,
            HandshakePending, Recovery,
        };
        // Any live state may begin closing.
        if to == Closing {
            return !self.is_closing_or_closed();
        }
        matches!(
            (self, to),
            (Connecting, Connected)
                | (Connected, HandshakePending)
                | (HandshakePending, Authenticated)
                | (Authenticated, Active)
                | (Active, Degraded)
                | (Degraded, Active)
                | (Closing, Closed)
                | (Error, Recovery)
                | (Recovery, Active)
                | (
                    Connecting | Connected | HandshakePending | Authenticated | Active | Degraded
                        | Recovery,
                    Error
                )
        )
    }
}

/// Atomic holder for a connection's state.
#[derive(Debug)]
pub struct LifecycleState {
    state: AtomicU8,
}

impl LifecycleState {
    /// New state machine starting at [`ConnectionState::Connecting`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    /// Current state (atomic read).
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attempt `current → to`. Returns `false` if the transition is illegal
    /// or another task changed the state concurrently to one from which the
    /// transition is illegal.
    pub fn transition_to(&self, to: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !ConnectionState::from_u8(current).can_transition_to(to) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Begin closing. Returns `false` when already `Closing`/`Closed`,
    /// preventing double-close.
    pub fn transition_to_closing(&self) -> bool {
        self.transition_to(ConnectionState::Closing)
    }

    /// Whether writes are admitted right now.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.load().is_writable()
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{
        Active, Authenticated, Closed, Closing, Connected, Connecting, Degraded, Error,
        HandshakePending, Recovery,
    };
    use super::*;

    fn at(state: ConnectionState) -> LifecycleState {
        let lifecycle = LifecycleState::new();
        lifecycle.state.store(state as u8, Ordering::SeqCst);
        lifecycle
    }

    #[test]
    fn starts_connecting() {
        assert_eq!(LifecycleState::new().load(), Connecting);
    }

    #[test]
    fn happy_path_to_active() {
        let lifecycle = LifecycleState::new();
        assert!(lifecycle.transition_to(Connected));
        assert!(lifecycle.transition_to(HandshakePending));
        assert!(lifecycle.transition_to(Authenticated));
        assert!(lifecycle.transition_to(Active));
        assert_eq!(lifecycle.load(), Active);
        assert!(lifecycle.is_writable());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let lifecycle = LifecycleState::new();
        assert!(!lifecycle.transition_to(Active));
        assert_eq!(lifecycle.load(), Connecting);
    }

    #[test]
    fn active_degraded_round_trip() {
        let lifecycle = at(Active);
        assert!(lifecycle.transition_to(Degraded));
        assert!(lifecycle.transition_to(Active));
    }

    #[test]
    fn error_recovery_path() {
        let lifecycle = at(Active);
        assert!(lifecycle.transition_to(Error));
        assert!(lifecycle.transition_to(Recovery));
        assert!(lifecycle.transition_to(Active));
    }

    #[test]
    fn closing_from_any_live_state() {
        for state in [
            Connecting,
            Connected,
            HandshakePending,
            Authenticated,
            Active,
            Degraded,
            Error,
            Recovery,
        ] {
            let lifecycle = at(state);
            assert!(lifecycle.transition_to_closing(), "from {state:?}");
            assert_eq!(lifecycle.load(), Closing);
        }
    }

    #[test]
    fn double_close_rejected() {
        let lifecycle = at(Active);
        assert!(lifecycle.transition_to_closing());
        assert!(!lifecycle.transition_to_closing());
        assert!(lifecycle.transition_to(Closed));
        assert!(!lifecycle.transition_to_closing());
    }

    #[test]
    fn closed_is_terminal() {
        let lifecycle = at(Closed);
        for state in [Connecting, Active, Degraded, Closing, Error, Recovery] {
            assert!(!lifecycle.transition_to(state), "to {state:?}");
        }
        assert_eq!(lifecycle.load(), Closed);
    }

    #[test]
    fn closing_and_closed_not_writable() {
        assert!(!Closing.is_writable());
        assert!(!Closed.is_writable());
        assert!(Closing.is_closing_or_closed());
        assert!(Closed.is_closing_or_closed());
        assert!(!Degraded.is_closing_or_closed());
    }

    #[test]
    fn concurrent_closing_only_one_wins() {
        let lifecycle = std::sync::Arc::new(at(Active));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lc = lifecycle.clone();
            handles.push(std::thread::spawn(move || lc.transition_to_closing()));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
        assert_eq!(lifecycle.load(), Closing);
    }
}
