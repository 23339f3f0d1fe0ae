//! Configuration for the firehose client.

use std::collections::BTreeSet;
use std::time::Duration;

use firehose_protocol::{DEFAULT_MAX_FRAME_SIZE, KIND_ACCOUNT, KIND_COMMIT, KIND_IDENTITY};

/// Default relay endpoint.
pub const DEFAULT_SERVICE_URL: &str = "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos";

/// How the receive loop hands frames to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Await each dispatch before reading the next message.
    #[default]
    Inline,
    /// Run handlers on Tokio tasks, at most `max_in_flight` at a time.
    ///
    /// Frames are still decoded and queued on their repository in arrival
    /// order, so per-repository ordering holds.
    Spawned {
        /// Upper bound on concurrently running dispatches.
        max_in_flight: usize,
    },
}

/// Configuration for a firehose subscription.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// WebSocket endpoint of the relay.
    pub service_url: String,
    /// Sequence number to resume from.
    pub cursor: Option<i64>,
    /// Collections to deliver. Empty means all.
    pub filter_collections: BTreeSet<String>,
    /// Skip `#commit` messages.
    pub exclude_commit: bool,
    /// Skip `#identity` messages.
    pub exclude_identity: bool,
    /// Skip `#account` messages.
    pub exclude_account: bool,
    /// Dispatch mode.
    pub dispatch_mode: DispatchMode,
    /// Fail the session when no message arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// Largest accepted binary message.
    pub max_frame_size: usize,
}

impl FirehoseConfig {
    /// Creates a configuration for `service_url`.
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            cursor: None,
            filter_collections: BTreeSet::new(),
            exclude_commit: false,
            exclude_identity: false,
            exclude_account: false,
            dispatch_mode: DispatchMode::Inline,
            idle_timeout: None,
            connect_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Sets the sequence number to resume from.
    ///
    /// A stored [`Cursor`](firehose_protocol::Cursor) converts with
    /// [`Cursor::seq`](firehose_protocol::Cursor::seq); relays only accept
    /// numeric positions.
    pub fn with_cursor(mut self, seq: i64) -> Self {
        self.cursor = Some(seq);
        self
    }

    /// Adds a collection to the delivery filter.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.filter_collections.insert(collection.into());
        self
    }

    /// Sets whether `#commit` messages are skipped.
    pub fn with_exclude_commit(mut self, exclude: bool) -> Self {
        self.exclude_commit = exclude;
        self
    }

    /// Sets whether `#identity` messages are skipped.
    pub fn with_exclude_identity(mut self, exclude: bool) -> Self {
        self.exclude_identity = exclude;
        self
    }

    /// Sets whether `#account` messages are skipped.
    pub fn with_exclude_account(mut self, exclude: bool) -> Self {
        self.exclude_account = exclude;
        self
    }

    /// Sets the dispatch mode.
    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the maximum message size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Whether operations on `collection` pass the filter.
    pub fn wants_collection(&self, collection: &str) -> bool {
        self.filter_collections.is_empty() || self.filter_collections.contains(collection)
    }

    /// Whether messages whose header `t` is `kind` are excluded.
    pub fn excludes_kind(&self, kind: &str) -> bool {
        match kind {
            KIND_COMMIT => self.exclude_commit,
            KIND_IDENTITY => self.exclude_identity,
            KIND_ACCOUNT => self.exclude_account,
            _ => false,
        }
    }

    /// The URL to connect to, carrying the resume cursor when one is set.
    pub fn endpoint_url(&self) -> String {
        match self.cursor {
            None => self.service_url.clone(),
            Some(seq) => {
                let separator = if self.service_url.contains('?') { '&' } else { '?' };
                format!("{}{}cursor={}", self.service_url, separator, seq)
            }
        }
    }
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_URL)
    }
}
