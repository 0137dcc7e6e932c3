//! The hub: single owner of client membership and broadcast fan-out.
//!
//! All membership changes and deliveries happen inside one sequential event
//! loop ([`Hub::run`]), so the membership map needs no lock. Clients talk to
//! the loop exclusively through a cloneable [`HubHandle`], which feeds four
//! independent channels:
//!
//! | Channel     | Capacity  | Purpose                                       |
//! |-------------|-----------|-----------------------------------------------|
//! | register    | unbounded | add a client, acknowledged through a oneshot  |
//! | unregister  | unbounded | remove a client and close its mailbox         |
//! | broadcast   | bounded   | fan a payload out to every member             |
//! | stats       | unbounded | read-only membership queries                  |
//!
//! Delivery to each mailbox is a non-blocking `try_send`. A member whose
//! mailbox is full is dropped on the spot so one slow consumer never stalls
//! the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::message::Payload;
use crate::config::HubConfig;

/// Errors returned by [`HubHandle`] submissions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub event loop is no longer running")]
    Closed,
}

/// Process-unique identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocates the next unused id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The producer side of a client's outbound mailbox, held only by the hub.
pub type MailboxSender = mpsc::Sender<Payload>;

/// The consumer side of a client's outbound mailbox, held by its outbound pump.
pub type Mailbox = mpsc::Receiver<Payload>;

/// Creates a mailbox pair with the given capacity.
pub fn mailbox(capacity: usize) -> (MailboxSender, Mailbox) {
    mpsc::channel(capacity)
}

struct Registration {
    id: ClientId,
    mailbox: MailboxSender,
    ack: oneshot::Sender<()>,
}

struct Broadcast {
    origin: ClientId,
    payload: Payload,
}

enum StatsQuery {
    ClientCount(oneshot::Sender<usize>),
}

/// Cloneable submission surface of a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    register_tx: mpsc::UnboundedSender<Registration>,
    unregister_tx: mpsc::UnboundedSender<ClientId>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    stats_tx: mpsc::UnboundedSender<StatsQuery>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

impl fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("origin", &self.origin)
            .field("len", &self.payload.as_str().len())
            .finish()
    }
}

impl fmt::Debug for StatsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatsQuery::ClientCount")
    }
}

impl HubHandle {
    /// Adds a client to the membership set and waits until the hub has done so.
    ///
    /// Registering an id that is already a member leaves the existing mailbox
    /// in place; the new sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn register(&self, id: ClientId, mailbox: MailboxSender) -> Result<(), HubError> {
        let (ack, acked) = oneshot::channel();
        self.register_tx
            .send(Registration { id, mailbox, ack })
            .map_err(|_| HubError::Closed)?;
        acked.await.map_err(|_| HubError::Closed)
    }

    /// Removes a client and closes its mailbox. Unknown ids are ignored.
    ///
    /// Never blocks, so it is safe to call from `Drop`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.unregister_tx.send(id).map_err(|_| HubError::Closed)
    }

    /// Submits a payload for fan-out. Waits for ingress capacity rather than
    /// dropping the message.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn broadcast(&self, origin: ClientId, payload: Payload) -> Result<(), HubError> {
        self.broadcast_tx
            .send(Broadcast { origin, payload })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Returns the number of currently registered clients.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub loop has stopped.
    pub async fn client_count(&self) -> Result<usize, HubError> {
        let (reply, count) = oneshot::channel();
        self.stats_tx
            .send(StatsQuery::ClientCount(reply))
            .map_err(|_| HubError::Closed)?;
        count.await.map_err(|_| HubError::Closed)
    }
}

/// The hub event loop state. Create with [`Hub::new`], then drive [`Hub::run`]
/// on its own task (or use [`Hub::spawn`]).
pub struct Hub {
    clients: HashMap<ClientId, MailboxSender>,
    echo_to_sender: bool,
    register_rx: mpsc::UnboundedReceiver<Registration>,
    unregister_rx: mpsc::UnboundedReceiver<ClientId>,
    broadcast_rx: mpsc::Receiver<Broadcast>,
    stats_rx: mpsc::UnboundedReceiver<StatsQuery>,
}

impl Hub {
    /// Creates a hub and the handle used to reach it.
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_buffer.max(1));
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();

        let hub = Self {
            clients: HashMap::new(),
            echo_to_sender: config.echo_to_sender,
            register_rx,
            unregister_rx,
            broadcast_rx,
            stats_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            stats_tx,
        };
        (hub, handle)
    }

    /// Creates a hub, spawns its loop on the current runtime, and returns the handle.
    pub fn spawn(config: &HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    /// Processes events one at a time until every handle has been dropped.
    pub async fn run(mut self) {
        info!(echo_to_sender = self.echo_to_sender, "hub started");

        loop {
            tokio::select! {
                Some(registration) = self.register_rx.recv() => self.on_register(registration),
                Some(id) = self.unregister_rx.recv() => self.on_unregister(id),
                Some(broadcast) = self.broadcast_rx.recv() => self.on_broadcast(broadcast),
                Some(query) = self.stats_rx.recv() => self.on_stats(query),
                else => break,
            }
        }

        info!(clients = self.clients.len(), "hub stopped");
    }

    fn on_register(&mut self, registration: Registration) {
        let Registration { id, mailbox, ack } = registration;
        if self.clients.contains_key(&id) {
            warn!(client = %id, "duplicate registration ignored");
        } else {
            self.clients.insert(id, mailbox);
            debug!(client = %id, clients = self.clients.len(), "client registered");
        }
        // The registering pump may already be gone; nothing to do then.
        let _ = ack.send(());
    }

    fn on_unregister(&mut self, id: ClientId) {
        // Dropping the sender closes the mailbox.
        if self.clients.remove(&id).is_some() {
            debug!(client = %id, clients = self.clients.len(), "client unregistered");
        }
    }

    fn on_broadcast(&mut self, broadcast: Broadcast) {
        let Broadcast { origin, payload } = broadcast;
        let echo = self.echo_to_sender;

        self.clients.retain(|&id, mailbox| {
            if !echo && id == origin {
                return true;
            }
            match mailbox.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(client = %id, "mailbox full, dropping slow client");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "mailbox receiver gone, dropping client");
                    false
                }
            }
        });
    }

    fn on_stats(&self, query: StatsQuery) {
        match query {
            StatsQuery::ClientCount(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }
}
