//! Per-connection trust state
//!
//! Every accepted connection gets a [`Session`] that starts out
//! `AwaitingOnboarding`. Forward transitions follow a fixed table; the only way
//! into `Untrusted` is [`Session::revoke`], and `Untrusted` is terminal.

use hyperion_connection::ConnectionId;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

/// Trust level of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthenticityState {
    AwaitingOnboarding,
    AwaitingCipherAuthentication,
    Trusted,
    Untrusted,
}

impl AuthenticityState {
    /// Transitions reachable through [`Session::update_state`]
    pub fn can_transition_to(self, next: AuthenticityState) -> bool {
        use AuthenticityState::*;
        matches!(
            (self, next),
            (AwaitingOnboarding, AwaitingCipherAuthentication)
                | (AwaitingCipherAuthentication, Trusted)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == AuthenticityState::Untrusted
    }
}

impl fmt::Display for AuthenticityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthenticityState::AwaitingOnboarding => "awaiting-onboarding",
            AuthenticityState::AwaitingCipherAuthentication => "awaiting-cipher-authentication",
            AuthenticityState::Trusted => "trusted",
            AuthenticityState::Untrusted => "untrusted",
        };
        f.write_str(s)
    }
}

/// Raised when a session is revoked; the connection must be torn down
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Security violation by connection {connection_id}: {reason}")]
pub struct SecurityViolation {
    pub connection_id: ConnectionId,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: AuthenticityState,
        to: AuthenticityState,
    },
}

pub struct Session {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    state: watch::Sender<AuthenticityState>,
    violation: Mutex<Option<SecurityViolation>>,
}

impl Session {
    pub fn new(id: ConnectionId) -> Self {
        let (state, _) = watch::channel(AuthenticityState::AwaitingOnboarding);
        Self {
            id,
            peer_addr: None,
            state,
            violation: Mutex::new(None),
        }
    }

    /// Bind the client address this session belongs to
    pub fn with_peer(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> AuthenticityState {
        *self.state.borrow()
    }

    pub fn is_revoked(&self) -> bool {
        self.state().is_terminal()
    }

    /// Watch state changes; the relay task uses this to react to revocation
    pub fn subscribe(&self) -> watch::Receiver<AuthenticityState> {
        self.state.subscribe()
    }

    /// Move the session forward along the transition table
    pub fn update_state(&self, next: AuthenticityState) -> Result<(), SessionError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                result = Err(SessionError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Revoke the session's trust.
    ///
    /// Logs the reason once, marks the session `Untrusted`, and returns the
    /// violation for the caller to raise. The connection must not continue
    /// relaying afterwards.
    pub fn revoke(&self, reason: impl Into<String>) -> SecurityViolation {
        let violation = SecurityViolation {
            connection_id: self.id,
            reason: reason.into(),
        };

        warn!(
            connection_id = %self.id,
            peer_addr = ?self.peer_addr,
            reason = %violation.reason,
            "Revoking session trust"
        );

        *self
            .violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(violation.clone());
        self.state.send_replace(AuthenticityState::Untrusted);

        violation
    }

    /// The most recent revocation, if the session has been revoked
    pub fn violation(&self) -> Option<SecurityViolation> {
        self.violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
