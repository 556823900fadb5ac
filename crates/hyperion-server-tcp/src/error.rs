use hyperion_connection::GatewayError;
use hyperion_control::{RegistryError, SecurityViolation};
use std::fmt;
use thiserror::Error;

/// Which side of a relayed connection an IO failure happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Gateway,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client"),
            Leg::Gateway => f.write_str("gateway"),
        }
    }
}

/// Errors that end a single relayed connection
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Transport failure on {leg} leg: {source}")]
    TransportFailure {
        leg: Leg,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    SecurityViolation(#[from] SecurityViolation),

    #[error("Backend unavailable: {0}")]
    UnavailableBackend(#[source] GatewayError),

    #[error("Relay failure: {0}")]
    Unclassified(String),
}

impl RelayError {
    pub(crate) fn transport(leg: Leg, source: std::io::Error) -> Self {
        Self::TransportFailure { leg, source }
    }
}

impl From<GatewayError> for RelayError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable { .. } => Self::UnavailableBackend(err),
            GatewayError::NotConnected => Self::Unclassified(err.to_string()),
        }
    }
}

impl From<RegistryError> for RelayError {
    fn from(err: RegistryError) -> Self {
        Self::Unclassified(err.to_string())
    }
}

/// Errors from the listener itself
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}
