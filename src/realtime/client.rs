//! Client pump: bridges one WebSocket connection to the hub.
//!
//! A [`Client`] owns its stream for its whole lifetime and runs two loops:
//!
//! - **inbound** reads frames, normalizes text, and submits broadcasts. Pongs
//!   push the read deadline forward by `pong_wait`.
//! - **outbound** drains the mailbox into (batched) text frames and sends a
//!   ping every `ping_period`.
//!
//! Both loops share a [`CancellationToken`] acting as the connection's close
//! signal. Whichever loop exits first fires it, which wakes the other; the
//! token is idempotent so both may fire it. The inbound loop also unregisters
//! the client on every exit path, so the hub closes the mailbox exactly once.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hub::{self, ClientId, HubError, HubHandle, Mailbox};
use super::message::{Batch, normalize, normalize_bytes};
use crate::config::ClientConfig;

/// Reasons a pump stops with an error. Only ever logged; a broken connection
/// is terminal for its client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),

    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),

    #[error("no pong received within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ClientError {
    /// Returns `true` for the ordinary ways a peer goes away (closed socket,
    /// reset, close handshake already done), which are not worth a warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Read(e) | Self::Write(e) => match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
                tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
                tungstenite::Error::Io(io) => matches!(
                    io.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                ),
                _ => false,
            },
            _ => false,
        }
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// One connected peer.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fanhub::config::{ClientConfig, HubConfig};
/// use fanhub::realtime::{Client, Hub};
/// use tokio_tungstenite::WebSocketStream;
/// use tokio_tungstenite::tungstenite::protocol::Role;
///
/// # async fn demo(socket: tokio::net::TcpStream) {
/// let hub = Hub::spawn(&HubConfig::default());
/// let config = Arc::new(ClientConfig::default());
/// let peer = socket.peer_addr().unwrap();
/// let ws = WebSocketStream::from_raw_socket(socket, Role::Server, Some(config.websocket_config())).await;
/// Client::new(ws, peer, hub, config).run().await;
/// # }
/// ```
pub struct Client<S> {
    id: ClientId,
    peer: SocketAddr,
    ws: WebSocketStream<S>,
    hub: HubHandle,
    config: Arc<ClientConfig>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream. Nothing happens until [`run`](Self::run).
    pub fn new(
        ws: WebSocketStream<S>,
        peer: SocketAddr,
        hub: HubHandle,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            id: ClientId::next(),
            peer,
            ws,
            hub,
            config,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Registers with the hub, then pumps the connection until it closes.
    ///
    /// The outbound loop runs on its own task; the inbound loop runs on the
    /// caller's. Returns once both have exited.
    pub async fn run(self) {
        let Self {
            id,
            peer,
            ws,
            hub,
            config,
        } = self;

        let (mailbox_tx, mailbox) = hub::mailbox(config.mailbox_capacity);
        if let Err(e) = hub.register(id, mailbox_tx).await {
            warn!(client = %id, peer = %peer, error = %e, "registration failed");
            return;
        }
        info!(client = %id, peer = %peer, "client connected");

        let closed = CancellationToken::new();
        let (sink, source) = ws.split();

        let writer = tokio::spawn(write_pump(
            sink,
            mailbox,
            closed.clone(),
            Arc::clone(&config),
        ));
        let read_result = read_pump(source, id, hub, closed, &config).await;
        report(id, "inbound", read_result);

        match writer.await {
            Ok(write_result) => report(id, "outbound", write_result),
            Err(e) => warn!(client = %id, error = %e, "outbound pump panicked"),
        }
        info!(client = %id, peer = %peer, "client disconnected");
    }
}

fn report(id: ClientId, pump: &'static str, result: Result<(), ClientError>) {
    match result {
        Ok(()) => debug!(client = %id, pump, "pump finished"),
        Err(e) if e.is_disconnect() => debug!(client = %id, pump, error = %e, "peer went away"),
        Err(e) => warn!(client = %id, pump, error = %e, "pump failed"),
    }
}

/// Fires the close signal, and optionally unregisters, when a pump exits for
/// any reason, unwinding included.
struct Release {
    unregister: Option<(ClientId, HubHandle)>,
    closed: CancellationToken,
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Some((id, hub)) = &self.unregister {
            if hub.unregister(*id).is_err() {
                debug!(client = %id, "hub gone before unregister");
            }
        }
        self.closed.cancel();
    }
}

async fn read_pump<S>(
    mut source: WsSource<S>,
    id: ClientId,
    hub: HubHandle,
    closed: CancellationToken,
    config: &ClientConfig,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _release = Release {
        unregister: Some((id, hub.clone())),
        closed: closed.clone(),
    };
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => return Ok(()),
            next = time::timeout_at(deadline, source.next()) => next,
        };

        let message = match next {
            Err(_) => return Err(ClientError::ReadTimeout(config.pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(ClientError::Read(e)),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => hub.broadcast(id, normalize(text.as_str())).await?,
            Message::Binary(data) => hub.broadcast(id, normalize_bytes(&data)).await?,
            Message::Pong(_) => deadline = Instant::now() + config.pong_wait,
            // Keep reading: the stream ends once the close reply is flushed.
            Message::Close(frame) => log_close(id, frame.as_ref()),
            Message::Ping(_) | Message::Frame(_) => {}
        }
    }
}

fn log_close(id: ClientId, frame: Option<&CloseFrame>) {
    match frame {
        Some(frame) if !matches!(frame.code, CloseCode::Normal | CloseCode::Away) => info!(
            client = %id,
            code = u16::from(frame.code),
            reason = frame.reason.as_str(),
            "peer closed with unexpected code"
        ),
        _ => debug!(client = %id, "peer sent close"),
    }
}

async fn write_pump<S>(
    mut sink: WsSink<S>,
    mut mailbox: Mailbox,
    closed: CancellationToken,
    config: Arc<ClientConfig>,
) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _release = Release {
        unregister: None,
        closed: closed.clone(),
    };
    let wait = config.write_wait;
    let mut heartbeat = time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = closed.cancelled() => break Ok(()),
            next = mailbox.recv() => match next {
                Some(first) => {
                    let mut batch = Batch::new(&first);
                    while batch.len() < config.mailbox_capacity {
                        match mailbox.try_recv() {
                            Ok(payload) => batch.push(&payload),
                            Err(_) => break,
                        }
                    }
                    if let Err(e) = send(&mut sink, batch.into_message(), wait).await {
                        break Err(e);
                    }
                }
                // The hub closed the mailbox: say goodbye and stop.
                None => break send(&mut sink, Message::Close(None), wait).await,
            },
            _ = heartbeat.tick() => {
                if let Err(e) = send(&mut sink, Message::Ping(Default::default()), wait).await {
                    break Err(e);
                }
            }
        }
    };

    drop(heartbeat);
    let _ = time::timeout(wait, sink.close()).await;
    result
}

async fn send<S>(sink: &mut WsSink<S>, message: Message, wait: Duration) -> Result<(), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match time::timeout(wait, sink.send(message)).await {
        Ok(result) => result.map_err(ClientError::Write),
        Err(_) => Err(ClientError::WriteTimeout(wait)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;
    use crate::config::HubConfig;
    use crate::realtime::hub::Hub;
    use crate::realtime::message::Payload;

    type Peer = WebSocketStream<DuplexStream>;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            mailbox_capacity: 16,
            max_message_size: 512,
            pong_wait: Duration::from_millis(300),
            ping_period: Duration::from_millis(100),
            write_wait: Duration::from_millis(200),
        }
    }

    /// Connects an in-memory peer to a freshly spawned client pump.
    async fn connect(hub: &HubHandle, config: ClientConfig) -> (ClientId, Peer, JoinHandle<()>) {
        connect_with_buffer(hub, config, 64 * 1024).await
    }

    /// Like [`connect`], but the in-memory pipe holds at most `buffer` bytes
    /// in each direction.
    async fn connect_with_buffer(
        hub: &HubHandle,
        config: ClientConfig,
        buffer: usize,
    ) -> (ClientId, Peer, JoinHandle<()>) {
        let (server_io, peer_io) = tokio::io::duplex(buffer);
        let server = WebSocketStream::from_raw_socket(
            server_io,
            Role::Server,
            Some(config.websocket_config()),
        )
        .await;
        let peer = WebSocketStream::from_raw_socket(peer_io, Role::Client, None).await;

        let client = Client::new(
            server,
            "127.0.0.1:9".parse().unwrap(),
            hub.clone(),
            Arc::new(config),
        );
        let id = client.id();
        let task = tokio::spawn(client.run());
        (id, peer, task)
    }

    async fn wait_for_count(hub: &HubHandle, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while hub.client_count().await.unwrap() != expected {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("client count never reached {expected}"));
    }

    /// Reads text frames until `n` newline-separated messages have arrived.
    async fn read_lines(peer: &mut Peer, n: usize) -> Vec<String> {
        let mut lines = Vec::new();
        timeout(Duration::from_secs(2), async {
            while lines.len() < n {
                match peer.next().await {
                    Some(Ok(Message::Text(text))) => {
                        lines.extend(text.as_str().split('\n').map(str::to_owned));
                    }
                    Some(Ok(_)) => {}
                    other => panic!("stream ended early: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for messages");
        lines
    }

    #[tokio::test]
    async fn message_is_normalized_and_echoed() {
        let hub = Hub::spawn(&HubConfig::default());
        let (_id, mut peer, _task) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 1).await;

        peer.send(Message::text("hello\nworld  ")).await.unwrap();
        assert_eq!(read_lines(&mut peer, 1).await, vec!["hello world"]);
    }

    #[tokio::test]
    async fn broadcast_reaches_other_client() {
        let hub = Hub::spawn(&HubConfig::default());
        let (_a, mut peer_a, _ta) = connect(&hub, fast_config()).await;
        let (_b, mut peer_b, _tb) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 2).await;

        peer_a.send(Message::text("hi")).await.unwrap();
        assert_eq!(read_lines(&mut peer_b, 1).await, vec!["hi"]);
    }

    #[tokio::test]
    async fn mailbox_order_is_preserved_on_the_wire() {
        let hub = Hub::spawn(&HubConfig::default());
        let (_id, mut peer, _task) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 1).await;

        let origin = ClientId::next();
        for text in ["m1", "m2", "m3"] {
            hub.broadcast(origin, Payload::from(text)).await.unwrap();
        }
        assert_eq!(read_lines(&mut peer, 3).await, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn unregister_sends_close_frame() {
        let hub = Hub::spawn(&HubConfig::default());
        let (id, mut peer, task) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 1).await;

        hub.unregister(id).unwrap();

        let frame = timeout(Duration::from_secs(2), async {
            loop {
                match peer.next().await {
                    Some(Ok(Message::Close(_))) | None => break true,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(frame, "expected a close frame");
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_unregisters() {
        let hub = Hub::spawn(&HubConfig::default());
        let (_id, mut peer, task) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 1).await;

        peer.close(None).await.unwrap();
        // Drive the peer so the close handshake completes.
        tokio::spawn(async move { while peer.next().await.is_some() {} });

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        wait_for_count(&hub, 0).await;
    }

    #[tokio::test]
    async fn responsive_peer_stays_registered() {
        let hub = Hub::spawn(&HubConfig::default());
        let (_id, mut peer, _task) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 1).await;

        // Reading is what makes the peer answer pings with pongs.
        let pings = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&pings);
        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = peer.next().await {
                if message.is_ping() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        // Several pong_wait windows.
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(hub.client_count().await.unwrap(), 1);
        assert!(pings.load(Ordering::SeqCst) >= 3);
        reader.abort();
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_pong_wait() {
        let hub = Hub::spawn(&HubConfig::default());
        let (_id, _peer, task) = connect(&hub, fast_config()).await;
        wait_for_count(&hub, 1).await;

        // The peer never reads, so it never answers a ping.
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        wait_for_count(&hub, 0).await;
    }

    #[tokio::test]
    async fn stalled_write_drops_client_before_pong_wait() {
        let hub = Hub::spawn(&HubConfig::default());
        let config = ClientConfig {
            pong_wait: Duration::from_secs(5),
            ping_period: Duration::from_secs(4),
            write_wait: Duration::from_millis(200),
            ..fast_config()
        };
        // The peer is kept alive but never reads, so the 1 KiB pipe fills up.
        let (_id, _peer, task) = connect_with_buffer(&hub, config, 1024).await;
        wait_for_count(&hub, 1).await;

        let started = Instant::now();
        let origin = ClientId::next();
        for _ in 0..4 {
            hub.broadcast(origin, Payload::from("x".repeat(16 * 1024)))
                .await
                .unwrap();
        }

        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        wait_for_count(&hub, 0).await;
    }

    #[tokio::test]
    async fn oversized_frame_ends_only_that_connection() {
        let hub = Hub::spawn(&HubConfig::default());
        let config = ClientConfig {
            max_message_size: 32,
            ..fast_config()
        };
        let (_big, mut big_peer, big_task) = connect(&hub, config.clone()).await;
        let (_ok, mut ok_peer, _ok_task) = connect(&hub, config).await;
        wait_for_count(&hub, 2).await;

        big_peer.send(Message::text("x".repeat(64))).await.unwrap();
        timeout(Duration::from_secs(2), big_task).await.unwrap().unwrap();
        wait_for_count(&hub, 1).await;

        ok_peer.send(Message::text("still fine")).await.unwrap();
        assert_eq!(read_lines(&mut ok_peer, 1).await, vec!["still fine"]);
    }

    #[test]
    fn reset_counts_as_disconnect() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(ClientError::Read(tungstenite::Error::Io(reset)).is_disconnect());
        assert!(ClientError::Write(tungstenite::Error::ConnectionClosed).is_disconnect());
        assert!(!ClientError::ReadTimeout(Duration::from_secs(1)).is_disconnect());
        assert!(!ClientError::Hub(HubError::Closed).is_disconnect());
    }
}
