//! TCP relay server
//!
//! Accepts client connections and relays each one, byte for byte, to a single
//! fixed gateway. Every connection gets its own session and relay task; the
//! server bounds how many run at once and tears them all down on shutdown.

pub mod duplex;
pub mod error;
mod relay;
mod server;

pub use duplex::{BurstLimits, DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_BUDGET, DEFAULT_MAX_BURST};
pub use error::{Leg, RelayError, RelayServerError};
pub use relay::RelayExit;
pub use server::{
    ConnectionInfo, GatewayTarget, RelayServer, RelayServerConfig, DEFAULT_MAX_CONNECTIONS,
};
