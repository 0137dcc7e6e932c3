//! Async TCP front door using Tokio.
//!
//! Accepts TCP connections, answers plain HTTP/1.1 requests for the chat page,
//! and hands connections that upgrade at [`WS_PATH`] to a [`Client`] pump.
//! Plain HTTP connections are persistent (keep-alive) until the peer closes
//! them, sends `Connection: close`, or sends something unparseable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::http::{
    Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
    upgrade,
};
use crate::realtime::{Client, HubHandle};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read home page {path}: {source}")]
    HomePage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Path that performs the WebSocket upgrade.
pub const WS_PATH: &str = "/ws";

/// Built-in chat page served at `/` unless replaced at startup.
pub const DEFAULT_HOME_PAGE: &str = include_str!("../../static/home.html");

/// Largest request (head plus any body we must skip) we buffer before answering 413.
const MAX_REQUEST_SIZE: usize = 8 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 1024;

/// Everything a connection task needs, shared across tasks.
#[derive(Debug, Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub client: Arc<ClientConfig>,
    pub home_page: Bytes,
}

impl AppState {
    pub fn new(hub: HubHandle, client: ClientConfig, home_page: Bytes) -> Self {
        Self {
            hub,
            client: Arc::new(client),
            home_page,
        }
    }
}

/// Loads the page served at `/`: the file at `path`, or the built-in page.
///
/// # Errors
///
/// Returns [`ServerError::HomePage`] if `path` is given and cannot be read.
pub async fn load_home_page(path: Option<&Path>) -> Result<Bytes, ServerError> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|source| ServerError::HomePage {
                path: path.to_owned(),
                source,
            }),
        None => Ok(Bytes::from_static(DEFAULT_HOME_PAGE.as_bytes())),
    }
}

/// The hub's listening socket.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, one task per connection.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn run(self, state: AppState) {
        info!(address = %self.local_addr, "fanhub listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let state = state.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, state).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// What to do with the connection after answering a request.
enum Next {
    KeepAlive,
    Close,
    Upgrade,
}

/// Serves HTTP requests on one connection until it closes or upgrades.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: AppState,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let (request, head_len) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    return reject(&mut stream, peer_addr, StatusCode::PayloadTooLarge).await;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    return Ok(());
                }
                continue;
            }
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "unparseable request");
                return reject(&mut stream, peer_addr, StatusCode::BadRequest).await;
            }
        };

        // Bodies are never used, but must be consumed to reach the next request.
        // Content-Length is client-controlled, so the sum may overflow.
        let body_len = request.content_length().unwrap_or(0);
        let total = match head_len.checked_add(body_len) {
            Some(total) if total <= MAX_REQUEST_SIZE => total,
            _ => return reject(&mut stream, peer_addr, StatusCode::PayloadTooLarge).await,
        };
        while buf.len() < total {
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
        let _ = buf.split_to(total);

        let started = Instant::now();
        let (response, next) = route(&request, &state);
        let status = response.status();
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;
        info!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            status = status.as_u16(),
            elapsed = ?started.elapsed(),
            "request"
        );

        match next {
            Next::KeepAlive => {}
            Next::Close => return Ok(()),
            Next::Upgrade => {
                // Frames the peer sent right behind the handshake are already in `buf`.
                let ws = WebSocketStream::from_partially_read(
                    stream,
                    buf.to_vec(),
                    Role::Server,
                    Some(state.client.websocket_config()),
                )
                .await;
                Client::new(ws, peer_addr, state.hub, state.client).run().await;
                return Ok(());
            }
        }
    }
}

fn route(request: &Request, state: &AppState) -> (Response, Next) {
    let keep_alive = request.is_keep_alive();
    let next = if keep_alive { Next::KeepAlive } else { Next::Close };

    match request.path() {
        WS_PATH => match upgrade::accept(request) {
            Ok(response) => (response, Next::Upgrade),
            Err(e) => {
                debug!(error = %e, "upgrade refused");
                (e.into_response(), Next::Close)
            }
        },
        "/" if request.method() == &Method::Get => {
            let response = Response::new(StatusCode::Ok)
                .header("Content-Type", "text/html; charset=utf-8")
                .body_bytes(state.home_page.to_vec())
                .keep_alive(keep_alive);
            (response, next)
        }
        "/" => {
            let response = Response::new(StatusCode::MethodNotAllowed)
                .header("Allow", "GET")
                .body("Method not allowed")
                .keep_alive(keep_alive);
            (response, next)
        }
        _ => {
            let response = Response::new(StatusCode::NotFound)
                .body("Not found")
                .keep_alive(keep_alive);
            (response, next)
        }
    }
}

async fn reject(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    status: StatusCode,
) -> Result<(), std::io::Error> {
    warn!(peer = %peer_addr, status = status.as_u16(), "rejecting request");
    let response = Response::new(status)
        .body(status.canonical_reason())
        .keep_alive(false);
    stream.write_all(&response.into_bytes()).await?;
    stream.flush().await
}
