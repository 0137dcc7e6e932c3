//! # fanhub
//!
//! A WebSocket fan-out hub: every message a connected client sends is
//! broadcast to every connected client.
//!
//! A single [`Hub`](realtime::Hub) event loop owns membership and fan-out;
//! each connection runs a [`Client`](realtime::Client) pump pair with
//! heartbeats, read/write deadlines, and a bounded mailbox. Clients that
//! cannot keep up are disconnected instead of slowing everyone else down.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fanhub::config::Config;
//! use fanhub::realtime::Hub;
//! use fanhub::server::{AppState, Server, load_home_page};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let hub = Hub::spawn(&config.hub);
//!     let home_page = load_home_page(None).await?;
//!     let server = Server::bind("127.0.0.1:5000").await?;
//!     server.run(AppState::new(hub, config.client, home_page)).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod http;
pub mod realtime;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{Config, ConfigError};
pub use realtime::{Client, Hub, HubHandle};
pub use server::{AppState, Server, ServerError};
