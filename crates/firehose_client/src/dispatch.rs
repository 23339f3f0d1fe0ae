//! From binary frame to handled event.
//!
//! The dispatcher decodes a frame, drops what the configuration excludes,
//! reports integrity failures, and runs the application's handler inside
//! the repository's critical section.

use std::sync::Arc;

use async_trait::async_trait;
use firehose_protocol::{
    translate_message, ContentId, Cursor, ErrorFrame, FirehoseEvent, FrameDecoder, RepoKey,
    StreamMessage, OP_ERROR,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::FirehoseConfig;
use crate::connection::ConnectionStats;
use crate::error::{BoxError, FirehoseError, FirehoseResult};
use crate::serializer::{CursorStore, RepoSerializer, RepoTicket};

/// Callback for errors that do not stop the stream.
pub type ErrorCallback = Arc<dyn Fn(&FirehoseError) + Send + Sync>;

/// Application logic invoked once per decoded event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Returning an error keeps the cursor in place.
    async fn handle_event(&self, event: FirehoseEvent) -> Result<(), BoxError>;
}

/// Why a frame produced no events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Header `op` was neither a message nor an error.
    NotAMessage,
    /// An `op = -1` error frame.
    ErrorFrame,
    /// An `#info` message.
    Info,
    /// A message kind this client does not interpret.
    UnknownKind,
    /// The message category is excluded by configuration.
    Excluded,
    /// No operation passed the collection filter.
    Filtered,
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Events were handled and the cursor advanced.
    Dispatched {
        /// Repository the events belong to.
        repo: RepoKey,
        /// Cursor recorded after handling.
        cursor: Cursor,
        /// Number of events handled.
        events: usize,
    },
    /// The frame was skipped without error.
    Skipped(SkipReason),
}

/// A decoded frame queued on its repository, waiting to run.
#[derive(Debug)]
pub struct PreparedDispatch {
    ticket: RepoTicket,
    cursor: Cursor,
    events: Vec<FirehoseEvent>,
}

impl PreparedDispatch {
    /// Repository the events belong to.
    pub fn repo(&self) -> &RepoKey {
        self.ticket.repo()
    }

    /// Events that will be handed to the handler, in order.
    pub fn events(&self) -> &[FirehoseEvent] {
        &self.events
    }
}

/// Outcome of the decode half of dispatch.
#[derive(Debug)]
pub enum Prepared {
    /// Nothing to run.
    Skipped(SkipReason),
    /// Ready to run with [`Dispatcher::run`].
    Ready(PreparedDispatch),
}

/// Decodes frames and delivers their events.
pub struct Dispatcher {
    config: FirehoseConfig,
    decoder: FrameDecoder,
    serializer: RepoSerializer,
    handler: Arc<dyn EventHandler>,
    on_error: Option<ErrorCallback>,
    stats: RwLock<ConnectionStats>,
}

impl Dispatcher {
    /// Creates a dispatcher applying `config`'s filters.
    pub fn new(
        config: &FirehoseConfig,
        handler: Arc<dyn EventHandler>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            config: config.clone(),
            decoder: FrameDecoder::with_max_frame_size(config.max_frame_size),
            serializer: RepoSerializer::new(cursor_store),
            handler,
            on_error: None,
            stats: RwLock::new(ConnectionStats::default()),
        }
    }

    /// Sets the callback for connection and per-message errors.
    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&FirehoseError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// The per-repository serializer.
    pub fn serializer(&self) -> &RepoSerializer {
        &self.serializer
    }

    /// Gets the current stats.
    pub fn stats(&self) -> ConnectionStats {
        self.stats.read().clone()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut ConnectionStats)) {
        update(&mut self.stats.write());
    }

    /// Counts `err` and passes it to the error callback.
    pub fn report(&self, err: &FirehoseError) {
        self.record(|stats| {
            match err {
                FirehoseError::Decode(_) => stats.decode_errors += 1,
                FirehoseError::BlockIntegrity(_) => stats.integrity_failures += 1,
                FirehoseError::Handler(_) | FirehoseError::Cursor(_) => stats.handler_errors += 1,
                _ => {}
            }
            stats.last_error = Some(err.to_string());
        });
        if let Some(callback) = &self.on_error {
            callback(err);
        }
    }

    /// Decodes and handles one binary message.
    ///
    /// # Errors
    ///
    /// `Decode` when the frame is malformed, `Handler` or `Cursor` when
    /// handling fails. Skipped frames are `Ok`.
    pub async fn dispatch_frame(&self, bytes: &[u8]) -> FirehoseResult<DispatchOutcome> {
        match self.prepare(bytes).await? {
            Prepared::Skipped(reason) => Ok(DispatchOutcome::Skipped(reason)),
            Prepared::Ready(dispatch) => self.run(dispatch).await,
        }
    }

    /// Decodes a message and queues it on its repository.
    ///
    /// Calling this in arrival order fixes the handling order for each
    /// repository, whichever task later calls [`Dispatcher::run`].
    pub async fn prepare(&self, bytes: &[u8]) -> FirehoseResult<Prepared> {
        let frame = self.decoder.decode(bytes)?;

        if !FrameDecoder::verify_header(&frame.header) {
            let reason = if frame.header.op == OP_ERROR {
                match ErrorFrame::from_payload(&frame.payload) {
                    Ok(body) => warn!(
                        error = %body.error,
                        detail = body.message.as_deref().unwrap_or_default(),
                        "relay sent error frame"
                    ),
                    Err(err) => warn!(%err, "relay sent unreadable error frame"),
                }
                self.record(|stats| stats.error_frames += 1);
                SkipReason::ErrorFrame
            } else {
                debug!(op = frame.header.op, "skipping frame with unknown op");
                SkipReason::NotAMessage
            };
            return Ok(self.skip(reason));
        }

        // Excluded categories are dropped before their payload is decoded.
        if let Some(kind) = frame.header.kind.as_deref() {
            if self.config.excludes_kind(kind) {
                return Ok(self.skip(SkipReason::Excluded));
            }
        }

        match translate_message(&frame)? {
            StreamMessage::Commit(mut commit) => {
                for failure in &commit.blocks.integrity_failures {
                    warn!(repo = %commit.repo, seq = commit.seq, %failure, "dropping unverified block");
                    self.report(&FirehoseError::BlockIntegrity(failure.clone()));
                }
                if commit.blocks.has_trailing_data() {
                    warn!(
                        repo = %commit.repo,
                        seq = commit.seq,
                        trailing_bytes = commit.blocks.trailing_bytes,
                        "block archive has trailing data"
                    );
                }

                commit
                    .ops
                    .retain(|op| self.config.wants_collection(op.collection()));
                if commit.ops.is_empty() {
                    return Ok(self.skip(SkipReason::Filtered));
                }

                for op in &commit.ops {
                    debug!(
                        seq = commit.seq,
                        cid = %op.identifier.as_ref().map(ContentId::encode).unwrap_or_default(),
                        uri = %op.uri(&commit.repo),
                        "{}",
                        op.log_label()
                    );
                }

                let events = commit
                    .op_events()
                    .into_iter()
                    .map(FirehoseEvent::Commit)
                    .collect();
                Ok(self.ready(&commit.repo, commit.cursor(), events).await)
            }
            StreamMessage::Identity(identity) => {
                debug!(did = %identity.did, seq = identity.seq, "identity event");
                let repo = identity.did.clone();
                let cursor = Cursor::from_seq(identity.seq);
                Ok(self
                    .ready(&repo, cursor, vec![FirehoseEvent::Identity(identity)])
                    .await)
            }
            StreamMessage::Account(account) => {
                debug!(did = %account.did, seq = account.seq, active = account.active, "account event");
                let repo = account.did.clone();
                let cursor = Cursor::from_seq(account.seq);
                Ok(self
                    .ready(&repo, cursor, vec![FirehoseEvent::Account(account)])
                    .await)
            }
            StreamMessage::Info(message) => {
                info!(
                    name = %message.name,
                    detail = message.message.as_deref().unwrap_or_default(),
                    "relay info"
                );
                Ok(self.skip(SkipReason::Info))
            }
            StreamMessage::Unknown(kind) => {
                debug!(%kind, "skipping unknown message kind");
                Ok(self.skip(SkipReason::UnknownKind))
            }
        }
    }

    /// Runs a prepared dispatch: handler calls in order, then one cursor update.
    pub async fn run(&self, dispatch: PreparedDispatch) -> FirehoseResult<DispatchOutcome> {
        let PreparedDispatch {
            ticket,
            cursor,
            events,
        } = dispatch;
        let repo = ticket.repo().clone();
        let count = events.len();
        let handler = &self.handler;

        self.serializer
            .process_reserved(ticket, cursor.clone(), || async move {
                for event in events {
                    handler.handle_event(event).await?;
                }
                Ok(())
            })
            .await?;

        debug!(repo = %repo, cursor = %cursor, events = count, "cursor advanced");
        self.record(|stats| {
            stats.events_dispatched += count as u64;
            stats.last_cursor = Some(cursor.clone());
        });
        Ok(DispatchOutcome::Dispatched {
            repo,
            cursor,
            events: count,
        })
    }

    fn skip(&self, reason: SkipReason) -> Prepared {
        self.record(|stats| stats.frames_skipped += 1);
        Prepared::Skipped(reason)
    }

    async fn ready(&self, repo: &RepoKey, cursor: Cursor, events: Vec<FirehoseEvent>) -> Prepared {
        let ticket = self.serializer.reserve(repo).await;
        Prepared::Ready(PreparedDispatch {
            ticket,
            cursor,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::MemoryCursorStore;
    use firehose_protocol::{Action, ProtocolError};
    use firehose_testkit::{
        account_frame, commit_frame, error_frame, identity_frame, malformed_frame,
        sample_commit_frame, FrameBuilder, SAMPLE_PATH, SAMPLE_REPO,
    };
    use firehose_codec::Value;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<FirehoseEvent>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: FirehoseEvent) -> Result<(), BoxError> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        recorder: Arc<Recorder>,
        store: Arc<MemoryCursorStore>,
        errors: Arc<AtomicUsize>,
    }

    fn fixture(config: FirehoseConfig) -> Fixture {
        let recorder = Arc::new(Recorder::default());
        let store = Arc::new(MemoryCursorStore::new());
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let dispatcher = Dispatcher::new(&config, recorder.clone(), store.clone())
            .with_error_callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        Fixture {
            dispatcher,
            recorder,
            store,
            errors,
        }
    }

    #[tokio::test]
    async fn sample_commit_is_delivered() {
        let f = fixture(FirehoseConfig::default());
        let sample = sample_commit_frame();

        let outcome = f.dispatcher.dispatch_frame(&sample.bytes).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                repo: RepoKey::from(SAMPLE_REPO),
                cursor: Cursor::from_seq(sample.seq),
                events: 1,
            }
        );

        let events = f.recorder.events.lock().clone();
        match &events[..] {
            [FirehoseEvent::Commit(op)] => {
                assert_eq!(op.action, Action::Create);
                assert_eq!(op.path, SAMPLE_PATH);
                assert_eq!(op.identifier.as_ref().map(ContentId::encode), Some(sample.cid.encode()));
                assert_eq!(op.record.as_deref(), Some(sample.record.as_slice()));
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert_eq!(
            f.store.get(&RepoKey::from(SAMPLE_REPO)),
            Some(Cursor::from_seq(sample.seq))
        );
        assert_eq!(f.errors.load(Ordering::SeqCst), 0);
        assert_eq!(f.dispatcher.stats().events_dispatched, 1);
    }

    #[tokio::test]
    async fn error_frame_is_skipped_silently() {
        let f = fixture(FirehoseConfig::default());
        let outcome = f
            .dispatcher
            .dispatch_frame(&error_frame("FutureCursor", "Cursor in the future."))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::ErrorFrame));
        assert!(f.recorder.events.lock().is_empty());
        assert_eq!(f.errors.load(Ordering::SeqCst), 0);
        assert_eq!(f.dispatcher.stats().error_frames, 1);
    }

    #[tokio::test]
    async fn unknown_op_is_skipped() {
        let f = fixture(FirehoseConfig::default());
        let header = firehose_codec::Value::text_map([("op", firehose_codec::Value::Integer(2))]);
        let bytes = FrameBuilder::message("#commit").header(header).build();

        let outcome = f.dispatcher.dispatch_frame(&bytes).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::NotAMessage));
    }

    #[tokio::test]
    async fn malformed_frame_is_a_decode_error() {
        let f = fixture(FirehoseConfig::default());
        let err = f.dispatcher.dispatch_frame(&malformed_frame()).await.unwrap_err();
        assert!(matches!(err, FirehoseError::Decode(ProtocolError::MalformedCbor { .. })));
        assert!(f.recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn all_ops_share_one_cursor_update() {
        let f = fixture(FirehoseConfig::default());
        let bytes = commit_frame(
            "did:plc:abc",
            9,
            &[
                ("create", "app.bsky.feed.post/1"),
                ("create", "app.bsky.feed.like/2"),
                ("delete", "app.bsky.feed.post/0"),
            ],
        );

        let outcome = f.dispatcher.dispatch_frame(&bytes).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { events: 3, .. }));

        let paths: Vec<_> = f
            .recorder
            .events
            .lock()
            .iter()
            .map(|event| match event {
                FirehoseEvent::Commit(op) => op.path.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            paths,
            vec!["app.bsky.feed.post/1", "app.bsky.feed.like/2", "app.bsky.feed.post/0"]
        );
        assert_eq!(f.store.updates().len(), 1);
    }

    #[tokio::test]
    async fn collection_filter_drops_ops() {
        let f = fixture(FirehoseConfig::default().with_collection("app.bsky.feed.post"));

        let bytes = commit_frame(
            "did:plc:abc",
            1,
            &[("create", "app.bsky.feed.like/1"), ("create", "app.bsky.feed.post/2")],
        );
        let outcome = f.dispatcher.dispatch_frame(&bytes).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { events: 1, .. }));

        let only_likes = commit_frame("did:plc:abc", 2, &[("create", "app.bsky.feed.like/3")]);
        let outcome = f.dispatcher.dispatch_frame(&only_likes).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Filtered));

        // The filtered commit does not advance the cursor.
        assert_eq!(f.store.latest(), Some(Cursor::from_seq(1)));
    }

    #[tokio::test]
    async fn exclusions_skip_categories() {
        let config = FirehoseConfig::default()
            .with_exclude_commit(true)
            .with_exclude_identity(true)
            .with_exclude_account(true);
        let f = fixture(config);

        for bytes in [
            sample_commit_frame().bytes,
            identity_frame("did:plc:abc", 3, "alice.test"),
            account_frame("did:plc:abc", 4, false),
        ] {
            let outcome = f.dispatcher.dispatch_frame(&bytes).await.unwrap();
            assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Excluded));
        }
        assert!(f.recorder.events.lock().is_empty());
        assert_eq!(f.dispatcher.stats().frames_skipped, 3);
    }

    #[tokio::test]
    async fn excluded_payloads_are_not_decoded() {
        let f = fixture(FirehoseConfig::default().with_exclude_commit(true));
        let broken = FrameBuilder::message("#commit")
            .payload(Value::text_map([
                ("repo", Value::from(SAMPLE_REPO)),
                ("blocks", Value::Bytes(vec![0xff, 0xff])),
            ]))
            .build();

        let outcome = f.dispatcher.dispatch_frame(&broken).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::Excluded));
        assert_eq!(f.errors.load(Ordering::SeqCst), 0);
        assert_eq!(f.dispatcher.stats().decode_errors, 0);

        // The same frame is a decode error once commits are wanted.
        let f = fixture(FirehoseConfig::default());
        assert!(f.dispatcher.dispatch_frame(&broken).await.is_err());
    }

    #[tokio::test]
    async fn identity_and_account_are_delivered() {
        let f = fixture(FirehoseConfig::default());
        f.dispatcher
            .dispatch_frame(&identity_frame("did:plc:abc", 3, "alice.test"))
            .await
            .unwrap();
        f.dispatcher
            .dispatch_frame(&account_frame("did:plc:abc", 4, true))
            .await
            .unwrap();

        let kinds: Vec<_> = f.recorder.events.lock().iter().map(FirehoseEvent::kind).collect();
        assert_eq!(kinds, vec!["identity", "account"]);
        assert_eq!(f.store.latest(), Some(Cursor::from_seq(4)));
    }

    #[tokio::test]
    async fn integrity_failure_is_reported_and_event_still_delivered() {
        use firehose_testkit::{commit_payload, op_value, post_record, CarWriter, encode_value};
        use firehose_protocol::Codec;

        let f = fixture(FirehoseConfig::default());
        let record = encode_value(&post_record("real"));
        let cid = ContentId::for_block(Codec::DagCbor, &record);
        let mut car = CarWriter::new();
        car.add_section(cid.clone(), encode_value(&post_record("forged")));
        let bytes = FrameBuilder::message("#commit")
            .payload(commit_payload(
                "did:plc:abc",
                5,
                vec![op_value("create", "app.bsky.feed.post/1", Some(&cid))],
                car.finish(),
            ))
            .build();

        let outcome = f.dispatcher.dispatch_frame(&bytes).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { events: 1, .. }));
        assert_eq!(f.errors.load(Ordering::SeqCst), 1);
        assert_eq!(f.dispatcher.stats().integrity_failures, 1);

        match &f.recorder.events.lock()[..] {
            [FirehoseEvent::Commit(op)] => assert_eq!(op.record, None),
            other => panic!("unexpected events {other:?}"),
        };
    }

    #[tokio::test]
    async fn handler_failure_keeps_cursor() {
        struct Failing;

        #[async_trait]
        impl EventHandler for Failing {
            async fn handle_event(&self, _event: FirehoseEvent) -> Result<(), BoxError> {
                Err("index unavailable".into())
            }
        }

        let store = Arc::new(MemoryCursorStore::new());
        let dispatcher = Dispatcher::new(&FirehoseConfig::default(), Arc::new(Failing), store.clone());
        let err = dispatcher
            .dispatch_frame(&sample_commit_frame().bytes)
            .await
            .unwrap_err();

        assert!(matches!(err, FirehoseError::Handler(_)));
        assert!(store.updates().is_empty());
    }
}
