//! WebSocket opening handshake (RFC 6455 §4.2) on top of a parsed [`Request`].
//!
//! Validation covers the method, the `Connection`/`Upgrade` tokens, the
//! protocol version, the client key, and a same-origin check: browsers always
//! send `Origin`, and a page served from another host must not be able to
//! open a socket here. Requests without `Origin` (non-browser clients) pass.

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use super::{Method, Request, Response, StatusCode};

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Reasons an upgrade request is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("websocket upgrade requires GET, got {0}")]
    Method(String),

    #[error("missing `Connection: upgrade` or `Upgrade: websocket`")]
    NotUpgrade,

    #[error("unsupported websocket version {0:?}")]
    Version(Option<String>),

    #[error("missing Sec-WebSocket-Key")]
    MissingKey,

    #[error("origin {origin:?} not allowed for host {host:?}")]
    CrossOrigin { origin: String, host: Option<String> },
}

impl UpgradeError {
    /// Maps the refusal onto the response sent before closing the connection.
    pub fn into_response(self) -> Response {
        let status = match &self {
            Self::Method(_) => StatusCode::MethodNotAllowed,
            Self::Version(_) => StatusCode::UpgradeRequired,
            Self::CrossOrigin { .. } => StatusCode::Forbidden,
            Self::NotUpgrade | Self::MissingKey => StatusCode::BadRequest,
        };
        let response = Response::new(status)
            .body(self.to_string())
            .keep_alive(false);
        if status == StatusCode::UpgradeRequired {
            response.header("Sec-WebSocket-Version", WEBSOCKET_VERSION)
        } else {
            response
        }
    }
}

/// Validates an upgrade request and builds the `101 Switching Protocols` reply.
///
/// # Examples
///
/// ```
/// use fanhub::http::{request::Request, upgrade};
///
/// let raw = b"GET /ws HTTP/1.1\r\n\
///     Host: localhost:5000\r\n\
///     Connection: Upgrade\r\n\
///     Upgrade: websocket\r\n\
///     Sec-WebSocket-Version: 13\r\n\
///     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
/// let (request, _) = Request::parse(raw).unwrap();
/// let response = upgrade::accept(&request).unwrap();
/// assert_eq!(response.status().as_u16(), 101);
/// ```
///
/// # Errors
///
/// Returns an [`UpgradeError`] describing the first check that failed.
pub fn accept(request: &Request) -> Result<Response, UpgradeError> {
    if request.method() != &Method::Get {
        return Err(UpgradeError::Method(request.method().to_string()));
    }

    let headers = request.headers();
    if !headers.has_token("connection", "upgrade") || !headers.has_token("upgrade", "websocket") {
        return Err(UpgradeError::NotUpgrade);
    }

    match headers.get("sec-websocket-version").map(str::trim) {
        Some(WEBSOCKET_VERSION) => {}
        other => return Err(UpgradeError::Version(other.map(str::to_owned))),
    }

    let key = headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(UpgradeError::MissingKey)?;

    check_origin(request)?;

    Ok(Response::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Accept", derive_accept_key(key.as_bytes()))
        .upgrade())
}

fn check_origin(request: &Request) -> Result<(), UpgradeError> {
    let Some(origin) = request.headers().get("origin") else {
        return Ok(());
    };
    let host = request.headers().get("host").map(str::trim);

    match (origin_host(origin), host) {
        (Some(origin_host), Some(host)) if origin_host.eq_ignore_ascii_case(host) => Ok(()),
        _ => Err(UpgradeError::CrossOrigin {
            origin: origin.to_owned(),
            host: host.map(str::to_owned),
        }),
    }
}

/// Extracts `host[:port]` from a serialized origin such as `https://a.example:8080`.
fn origin_host(origin: &str) -> Option<&str> {
    let (_scheme, rest) = origin.trim().split_once("://")?;
    let host = rest.split('/').next()?;
    (!host.is_empty()).then_some(host)
}
