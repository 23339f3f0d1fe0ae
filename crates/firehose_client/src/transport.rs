//! Transport layer abstraction for the firehose stream.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{FirehoseError, FirehoseResult};

/// A message read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    /// A binary message: one firehose frame.
    Binary(Bytes),
    /// A text message. The firehose never sends these.
    Text(String),
    /// The peer started the close handshake.
    Close,
}

/// A frame transport handles network communication with the relay.
///
/// This trait abstracts the network layer so the connection state machine
/// can run over WebSocket or a scripted mock in tests.
#[async_trait]
pub trait FrameTransport: Send {
    /// Opens the connection.
    async fn connect(&mut self, url: &str) -> FirehoseResult<()>;

    /// Waits for the next message. `Ok(None)` means the stream ended.
    async fn next_message(&mut self) -> FirehoseResult<Option<TransportMessage>>;

    /// Performs the close handshake. Closing twice is not an error.
    async fn close(&mut self) -> FirehoseResult<()>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;
}

enum MockEvent {
    Message(TransportMessage),
    Error { message: String, retryable: bool },
}

#[derive(Default)]
struct MockState {
    connected: AtomicBool,
    close_calls: AtomicUsize,
    connect_error: Mutex<Option<String>>,
    connected_urls: Mutex<Vec<String>>,
}

/// A mock transport for testing.
///
/// Messages are fed through the paired [`MockHandle`]. While the handle is
/// alive and nothing is queued, `next_message` waits, like an idle relay.
/// Dropping the handle ends the stream.
pub struct MockTransport {
    state: Arc<MockState>,
    rx: mpsc::UnboundedReceiver<MockEvent>,
}

/// Feeds messages into a [`MockTransport`] and observes it.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
    tx: mpsc::UnboundedSender<MockEvent>,
}

impl MockTransport {
    /// Creates a new mock transport and its handle.
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(MockState::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::clone(&state),
                rx,
            },
            MockHandle { state, tx },
        )
    }
}

impl MockHandle {
    fn push(&self, event: MockEvent) {
        // The transport may already be gone; tests treat that as a no-op.
        let _ = self.tx.send(event);
    }

    /// Queues a binary message.
    pub fn send_binary(&self, bytes: impl Into<Bytes>) {
        self.push(MockEvent::Message(TransportMessage::Binary(bytes.into())));
    }

    /// Queues a text message.
    pub fn send_text(&self, text: impl Into<String>) {
        self.push(MockEvent::Message(TransportMessage::Text(text.into())));
    }

    /// Queues a close from the peer.
    pub fn send_close(&self) {
        self.push(MockEvent::Message(TransportMessage::Close));
    }

    /// Queues a transport failure.
    pub fn send_error(&self, message: impl Into<String>, retryable: bool) {
        self.push(MockEvent::Error {
            message: message.into(),
            retryable,
        });
    }

    /// Makes the next `connect` fail with `message`.
    pub fn fail_connect(&self, message: impl Into<String>) {
        *self.state.connect_error.lock() = Some(message.into());
    }

    /// URLs passed to `connect`, in order.
    pub fn connected_urls(&self) -> Vec<String> {
        self.state.connected_urls.lock().clone()
    }

    /// Number of `close` calls.
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Checks if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn connect(&mut self, url: &str) -> FirehoseResult<()> {
        if let Some(message) = self.state.connect_error.lock().take() {
            return Err(FirehoseError::transport_retryable(message));
        }
        self.state.connected_urls.lock().push(url.to_string());
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_message(&mut self) -> FirehoseResult<Option<TransportMessage>> {
        if !self.is_connected() {
            return Err(FirehoseError::NotConnected);
        }
        match self.rx.recv().await {
            Some(MockEvent::Message(message)) => Ok(Some(message)),
            Some(MockEvent::Error { message, retryable }) => Err(FirehoseError::Transport {
                message,
                retryable,
            }),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> FirehoseResult<()> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}
