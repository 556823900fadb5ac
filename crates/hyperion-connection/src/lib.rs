//! Connection handles for the relay
//!
//! Client-side connection records, the outbound gateway connection, and the
//! non-blocking liveness check shared by both.

pub mod client;
pub mod gateway;
pub mod id;
pub mod liveness;

pub use client::{ClientConnection, ConnectionRecord};
pub use gateway::{
    GatewayConnection, GatewayError, Resolver, SystemResolver, DEFAULT_CONNECT_TIMEOUT,
};
pub use id::ConnectionId;
pub use liveness::is_disconnected;
