//! Connection state machine and receive loop.
//!
//! ```text
//! Disconnected → Connecting → Connected → Receiving → Closing → Disconnected
//!                     │                       │
//!                     └──────── Failed ◄──────┘
//!                                  │
//!                                  └──► Disconnected
//! ```
//!
//! One message is read at a time. Errors scoped to a message are reported
//! and the loop moves on; transport errors end the session.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use firehose_protocol::Cursor;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{DispatchMode, FirehoseConfig};
use crate::dispatch::{DispatchOutcome, Dispatcher, Prepared};
use crate::error::{FirehoseError, FirehoseResult};
use crate::transport::{FrameTransport, TransportMessage};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session is running.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport is open.
    Connected,
    /// Reading messages.
    Receiving,
    /// Performing the close handshake.
    Closing,
    /// The session failed; about to return to `Disconnected`.
    Failed,
}

impl ConnectionState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    /// Returns true if a session can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

/// Statistics about the stream.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Sessions started.
    pub sessions: u64,
    /// Binary messages received.
    pub frames_received: u64,
    /// Text messages received and ignored.
    pub text_messages: u64,
    /// Frames that produced no events.
    pub frames_skipped: u64,
    /// Error frames sent by the relay.
    pub error_frames: u64,
    /// Events handed to the handler successfully.
    pub events_dispatched: u64,
    /// Messages that failed to decode.
    pub decode_errors: u64,
    /// Handler or cursor store failures.
    pub handler_errors: u64,
    /// Blocks dropped for failing verification.
    pub integrity_failures: u64,
    /// Last cursor recorded.
    pub last_cursor: Option<Cursor>,
    /// When the current session connected.
    pub connected_at: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// A firehose subscription over a [`FrameTransport`].
///
/// Methods take `&self`; share the connection through an `Arc` to call
/// [`StreamConnection::stop`] while [`StreamConnection::start`] runs.
pub struct StreamConnection<T: FrameTransport> {
    config: FirehoseConfig,
    transport: AsyncMutex<T>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConnectionState>,
    stop: watch::Sender<bool>,
}

impl<T: FrameTransport> StreamConnection<T> {
    /// Creates a connection. Nothing happens until [`StreamConnection::start`].
    pub fn new(config: FirehoseConfig, transport: T, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            transport: AsyncMutex::new(transport),
            dispatcher: Arc::new(dispatcher),
            state: watch::Sender::new(ConnectionState::Disconnected),
            stop: watch::Sender::new(false),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watches state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> ConnectionStats {
        self.dispatcher.stats()
    }

    /// The dispatcher frames are handed to.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(?state, "connection state");
        self.state.send_replace(state);
    }

    /// Returns to `Disconnected`, clearing any pending stop request.
    fn finish_session(&self) {
        self.state.send_modify(|state| {
            self.stop.send_replace(false);
            *state = ConnectionState::Disconnected;
        });
        debug!(state = ?ConnectionState::Disconnected, "connection state");
    }

    /// Connects and runs the receive loop until the stream closes, fails or
    /// [`StreamConnection::stop`] is called.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if a session is already running; the
    /// transport error if connecting or reading fails. Either way the error
    /// callback has seen it and the state is `Disconnected` again.
    pub async fn start(&self) -> FirehoseResult<()> {
        let mut from = ConnectionState::Disconnected;
        let started = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_start() {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(FirehoseError::InvalidStateTransition {
                from: format!("{from:?}"),
                to: format!("{:?}", ConnectionState::Connecting),
            });
        }

        let mut transport = self.transport.lock().await;
        let mut stop = self.stop.subscribe();
        let stop = &mut stop;
        let url = self.config.endpoint_url();
        info!(%url, "connecting to firehose");

        let connected = tokio::select! {
            biased;
            _ = stop_requested(stop) => None,
            result = transport.connect(&url) => Some(result),
        };
        match connected {
            None => {
                info!("stopped while connecting");
                let _ = transport.close().await;
                self.finish_session();
                return Ok(());
            }
            Some(Err(err)) => {
                error!(%err, "firehose connection failed");
                self.fail(&err);
                return Err(err);
            }
            Some(Ok(())) => {}
        }

        self.set_state(ConnectionState::Connected);
        info!("connected to firehose");
        self.dispatcher.record(|stats| {
            stats.sessions += 1;
            stats.connected_at = Some(Instant::now());
        });

        let result = self.receive_loop(&mut *transport, stop).await;
        match result {
            Ok(()) => {
                self.finish_session();
                Ok(())
            }
            Err(err) => {
                error!(%err, "firehose session failed");
                let _ = transport.close().await;
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn fail(&self, err: &FirehoseError) {
        self.set_state(ConnectionState::Failed);
        self.dispatcher.report(err);
        self.finish_session();
    }

    /// Stops the session and waits until it is `Disconnected`.
    ///
    /// Idempotent: stopping a connection that is not running does nothing.
    /// In-flight handlers finish; only the network side is cancelled.
    pub async fn stop(&self) -> FirehoseResult<()> {
        let mut requested = false;
        self.state.send_if_modified(|state| {
            if state.is_active() {
                self.stop.send_replace(true);
                requested = true;
            }
            false
        });
        if !requested {
            debug!("stop requested while disconnected");
            return Ok(());
        }

        info!("stopping firehose connection");
        let mut state = self.state.subscribe();
        state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .map_err(|_| FirehoseError::NotConnected)?;
        Ok(())
    }

    async fn receive_loop(
        &self,
        transport: &mut T,
        stop: &mut watch::Receiver<bool>,
    ) -> FirehoseResult<()> {
        self.set_state(ConnectionState::Receiving);
        let in_flight = match self.config.dispatch_mode {
            DispatchMode::Inline => None,
            DispatchMode::Spawned { max_in_flight } => {
                Some(Arc::new(Semaphore::new(max_in_flight.max(1))))
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(stop) => None,
                message = self.next_message(transport) => Some(message),
            };

            let message = match next {
                None => {
                    info!("stop requested, closing");
                    self.set_state(ConnectionState::Closing);
                    return transport.close().await;
                }
                Some(message) => message?,
            };

            match message {
                None => {
                    info!("firehose stream ended");
                    return Ok(());
                }
                Some(TransportMessage::Close) => {
                    info!("firehose closed by server");
                    self.set_state(ConnectionState::Closing);
                    return transport.close().await;
                }
                Some(TransportMessage::Text(text)) => {
                    debug!(len = text.len(), "ignoring text message");
                    self.dispatcher.record(|stats| stats.text_messages += 1);
                }
                Some(TransportMessage::Binary(bytes)) => {
                    self.dispatcher.record(|stats| stats.frames_received += 1);
                    match &in_flight {
                        None => self.dispatch_inline(&bytes).await,
                        Some(semaphore) => self.dispatch_spawned(semaphore, bytes).await?,
                    }
                }
            }
        }
    }

    async fn next_message(&self, transport: &mut T) -> FirehoseResult<Option<TransportMessage>> {
        match self.config.idle_timeout {
            None => transport.next_message().await,
            Some(idle) => match tokio::time::timeout(idle, transport.next_message()).await {
                Ok(message) => message,
                Err(_) => {
                    warn!(?idle, "no message within idle timeout");
                    Err(FirehoseError::Timeout)
                }
            },
        }
    }

    async fn dispatch_inline(&self, bytes: &[u8]) {
        match self.dispatcher.dispatch_frame(bytes).await {
            Ok(outcome) => log_outcome(&outcome),
            Err(err) => {
                warn!(%err, "message failed");
                self.dispatcher.report(&err);
            }
        }
    }

    async fn dispatch_spawned(&self, semaphore: &Arc<Semaphore>, bytes: Bytes) -> FirehoseResult<()> {
        let permit = Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FirehoseError::transport_fatal("dispatch semaphore closed"))?;

        // Decoding stays on the loop so repositories are queued in arrival order.
        let dispatch = match self.dispatcher.prepare(&bytes).await {
            Ok(Prepared::Ready(dispatch)) => dispatch,
            Ok(Prepared::Skipped(reason)) => {
                debug!(?reason, "frame skipped");
                return Ok(());
            }
            Err(err) => {
                warn!(%err, "message failed");
                self.dispatcher.report(&err);
                return Ok(());
            }
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let _permit = permit;
            match dispatcher.run(dispatch).await {
                Ok(outcome) => log_outcome(&outcome),
                Err(err) => {
                    warn!(%err, "message failed");
                    dispatcher.report(&err);
                }
            }
        });
        Ok(())
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // The sender lives as long as the connection.
    let _ = stop.wait_for(|requested| *requested).await;
}

fn log_outcome(outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Dispatched {
            repo,
            cursor,
            events,
        } => debug!(%repo, %cursor, events, "frame dispatched"),
        DispatchOutcome::Skipped(reason) => debug!(?reason, "frame skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EventHandler;
    use crate::error::BoxError;
    use crate::serializer::NoopCursorStore;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use firehose_protocol::FirehoseEvent;

    struct Ignore;

    #[async_trait]
    impl EventHandler for Ignore {
        async fn handle_event(&self, _event: FirehoseEvent) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn connection(config: FirehoseConfig) -> (Arc<StreamConnection<MockTransport>>, crate::transport::MockHandle) {
        let (transport, handle) = MockTransport::new();
        let dispatcher = Dispatcher::new(&config, Arc::new(Ignore), Arc::new(NoopCursorStore));
        (
            Arc::new(StreamConnection::new(config, transport, dispatcher)),
            handle,
        )
    }

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Disconnected.can_start());
        assert!(!ConnectionState::Receiving.can_start());
        assert!(ConnectionState::Closing.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
    }

    #[tokio::test]
    async fn stop_when_never_started_is_noop() {
        let (connection, _handle) = connection(FirehoseConfig::default());
        connection.stop().await.unwrap();
        connection.stop().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn server_close_ends_session_cleanly() {
        let (connection, handle) = connection(FirehoseConfig::default());
        handle.send_text("ignored");
        handle.send_close();

        connection.start().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(handle.close_calls(), 1);
        assert_eq!(connection.stats().text_messages, 1);
        assert_eq!(connection.stats().sessions, 1);
    }

    #[tokio::test]
    async fn connect_failure_reports_and_disconnects() {
        let (connection, handle) = connection(FirehoseConfig::default());
        handle.fail_connect("connection refused");

        let err = connection.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.stats().last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn transport_error_fails_session() {
        let (connection, handle) = connection(FirehoseConfig::default());
        handle.send_error("reset by peer", true);

        let mut states = connection.subscribe_state();
        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, FirehoseError::Transport { .. }));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (connection, handle) = connection(FirehoseConfig::default());
        let running = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.start().await })
        };

        let mut states = connection.subscribe_state();
        states
            .wait_for(|state| *state == ConnectionState::Receiving)
            .await
            .unwrap();

        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, FirehoseError::InvalidStateTransition { .. }));

        connection.stop().await.unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(handle.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fails_session() {
        let config = FirehoseConfig::default().with_idle_timeout(std::time::Duration::from_secs(30));
        let (connection, _handle) = connection(config);

        let err = connection.start().await.unwrap_err();
        assert!(matches!(err, FirehoseError::Timeout));
        assert!(err.is_retryable());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
