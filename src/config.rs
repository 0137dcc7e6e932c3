//! Runtime configuration for the hub, the client pumps, and the server.
//!
//! Every knob has a default matching the documented constants; the binary
//! overrides them from command-line flags and calls [`Config::validate`]
//! before anything starts.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Default capacity of each client's outbound mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default maximum size of a single inbound message, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;

/// Default time allowed to read the next pong from the peer.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Default interval between pings. Must stay below [`DEFAULT_PONG_WAIT`].
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(50);

/// Default time allowed to write a frame to the peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Default capacity of the hub's broadcast ingress channel.
pub const DEFAULT_BROADCAST_BUFFER: usize = 1024;

/// Errors produced by [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("ping period ({ping_period:?}) must be shorter than pong wait ({pong_wait:?})")]
    PingNotBeforeDeadline {
        ping_period: Duration,
        pong_wait: Duration,
    },
}

/// Settings owned by the hub event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of the broadcast ingress channel. Submitters wait for room;
    /// nothing is dropped at ingress.
    pub broadcast_buffer: usize,
    /// Whether the client that sent a message also receives it back.
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_buffer: DEFAULT_BROADCAST_BUFFER,
            echo_to_sender: true,
        }
    }
}

/// Settings shared by the inbound and outbound pumps of every client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub mailbox_capacity: usize,
    pub max_message_size: usize,
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: DEFAULT_PING_PERIOD,
            write_wait: DEFAULT_WRITE_WAIT,
        }
    }
}

impl ClientConfig {
    /// Builds the stream-level configuration enforcing the inbound size limit.
    ///
    /// Both the frame and the reassembled message are capped, so an oversized
    /// message fails the read instead of being buffered.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Top-level configuration assembled by the binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub hub: HubConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Checks the invariants the pumps rely on.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Zero`] if a capacity, size, or duration is zero.
    /// - [`ConfigError::PingNotBeforeDeadline`] if pings would not arrive
    ///   before the peer's read deadline expires.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("broadcast buffer", self.hub.broadcast_buffer),
            ("mailbox capacity", self.client.mailbox_capacity),
            ("max message size", self.client.max_message_size),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let durations = [
            ("pong wait", self.client.pong_wait),
            ("ping period", self.client.ping_period),
            ("write wait", self.client.write_wait),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }

        if self.client.ping_period >= self.client.pong_wait {
            return Err(ConfigError::PingNotBeforeDeadline {
                ping_period: self.client.ping_period,
                pong_wait: self.client.pong_wait,
            });
        }

        Ok(())
    }
}
