//! Real-time fan-out over WebSocket.
//!
//! - [`Hub`]: the single event loop that owns client membership and fans
//!   every broadcast out to each member's mailbox.
//! - [`Client`]: the per-connection pump pair (inbound + outbound) with
//!   heartbeat liveness and the drop-slow-consumer policy.
//! - [`message`]: payload normalization and outbound batching.

pub mod client;
pub mod hub;
pub mod message;

pub use client::{Client, ClientError};
pub use hub::{ClientId, Hub, HubError, HubHandle};
pub use message::Payload;
