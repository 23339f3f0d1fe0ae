//! # Firehose Client
//!
//! Streaming client for a relay's repository event firehose.
//!
//! This crate provides:
//! - Connection state machine (disconnected → connecting → receiving → closing)
//! - WebSocket transport and a scripted mock transport
//! - Frame dispatch with collection filters and category exclusions
//! - Per-repository serialization of event handling
//! - Cursor persistence after successful handling
//!
//! ## Architecture
//!
//! The receive loop reads one binary message at a time and hands it to the
//! [`Dispatcher`]. The dispatcher decodes the frame, translates it into
//! [`firehose_protocol::FirehoseEvent`]s and runs the application's
//! [`EventHandler`] inside the repository's critical section. After the
//! handler succeeds, the message's cursor is written to the [`CursorStore`].
//!
//! ## Key Invariants
//!
//! - Events for one repository are handled one at a time, in arrival order
//! - Distinct repositories are handled concurrently in spawned mode
//! - A bad message is reported and skipped; the stream keeps going
//! - The cursor only advances after the handler succeeds
//! - Stopping is idempotent and leaves the connection `Disconnected`
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use firehose_client::{
//!     BoxError, Dispatcher, EventHandler, FirehoseConfig, NoopCursorStore, StreamConnection,
//!     WebSocketTransport,
//! };
//! use firehose_protocol::FirehoseEvent;
//!
//! struct Print;
//!
//! #[async_trait]
//! impl EventHandler for Print {
//!     async fn handle_event(&self, event: FirehoseEvent) -> Result<(), BoxError> {
//!         println!("{} {}", event.kind(), event.repo());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> firehose_client::FirehoseResult<()> {
//! let config = FirehoseConfig::default().with_collection("app.bsky.feed.post");
//! let transport = WebSocketTransport::new(config.max_frame_size, config.connect_timeout);
//! let dispatcher = Dispatcher::new(&config, Arc::new(Print), Arc::new(NoopCursorStore));
//! let connection = StreamConnection::new(config, transport, dispatcher);
//! connection.start().await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod dispatch;
mod error;
mod serializer;
mod transport;
mod websocket;

pub use config::{DispatchMode, FirehoseConfig, DEFAULT_SERVICE_URL};
pub use connection::{ConnectionState, ConnectionStats, StreamConnection};
pub use dispatch::{
    DispatchOutcome, Dispatcher, ErrorCallback, EventHandler, Prepared, PreparedDispatch,
    SkipReason,
};
pub use error::{BoxError, FirehoseError, FirehoseResult};
pub use serializer::{CursorStore, MemoryCursorStore, NoopCursorStore, RepoSerializer, RepoTicket};
pub use transport::{FrameTransport, MockHandle, MockTransport, TransportMessage};
pub use websocket::WebSocketTransport;
