//! Control Protocol Definitions
//!
//! This crate defines the message envelopes, the JSON frame codec, and the
//! IP access policy shared by the outpost server and agent.

pub mod codec;
pub mod ip_filter;
pub mod messages;

pub use codec::{decode, encode, CodecError};
pub use ip_filter::{Decision, FilterMode, IpAccessPolicy, IpFilterError};
pub use messages::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Path on the public listener that upgrades into the control channel
pub const CONTROL_PATH: &str = "/_tunnel";

/// Maximum accepted control frame size (16MB)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// WebSocket close code used for IP denial and auth failure
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
