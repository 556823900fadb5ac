//! Per-connection session state and the shared connection registry
pub mod registry;
pub mod session;

pub use registry::{ConnectionEntry, ConnectionRegistry, RegistryError};
pub use session::{AuthenticityState, SecurityViolation, Session, SessionError};
