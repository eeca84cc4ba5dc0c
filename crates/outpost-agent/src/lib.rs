//! Tunnel agent
//!
//! Runs next to the local service: dials the server's control endpoint,
//! requests tunnels, terminates dispatched HTTP requests against the local
//! origin, relays TCP sub-connections, and reconnects with backoff.

pub mod client;
pub mod config;
pub mod origin;
pub mod tls;

pub use client::{Agent, AgentError, AgentState};
pub use config::{reconnect_delay, AgentConfig, ConfigError, TunnelSlot};
pub use origin::{OriginError, OriginResponse};
