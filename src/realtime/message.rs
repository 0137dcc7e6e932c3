//! Message payloads: inbound normalization and outbound batching.

use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

/// A broadcast payload. Cheap to clone, so fan-out shares one buffer.
pub type Payload = Utf8Bytes;

/// Separator placed between messages coalesced into a single outbound frame.
pub const BATCH_SEPARATOR: char = '\n';

/// Normalizes inbound text before it reaches the hub.
///
/// Line breaks (`\n` or `\r\n`) become a single space and surrounding
/// whitespace is trimmed.
///
/// # Examples
///
/// ```
/// use fanhub::realtime::message::normalize;
///
/// assert_eq!(normalize("hello\nworld  ").as_str(), "hello world");
/// assert_eq!(normalize("  spaced out \r\n").as_str(), "spaced out");
/// ```
pub fn normalize(text: &str) -> Payload {
    let joined = text.lines().collect::<Vec<_>>().join(" ");
    Payload::from(joined.trim())
}

/// Converts an inbound binary frame into a payload, replacing invalid UTF-8.
pub fn normalize_bytes(data: &[u8]) -> Payload {
    normalize(&String::from_utf8_lossy(data))
}

/// Accumulates mailbox messages into one outbound text frame.
///
/// Messages keep their arrival order and are joined by [`BATCH_SEPARATOR`].
#[derive(Debug, Default)]
pub struct Batch {
    buf: String,
    count: usize,
}

impl Batch {
    /// Starts a batch with its first message.
    pub fn new(first: &Payload) -> Self {
        let mut batch = Self {
            buf: String::with_capacity(first.as_str().len()),
            count: 0,
        };
        batch.push(first);
        batch
    }

    /// Appends a message after the ones already in the batch.
    pub fn push(&mut self, payload: &Payload) {
        if self.count > 0 {
            self.buf.push(BATCH_SEPARATOR);
        }
        self.buf.push_str(payload.as_str());
        self.count += 1;
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Consumes the batch, producing the text frame to write.
    pub fn into_message(self) -> Message {
        Message::text(self.buf)
    }
}
