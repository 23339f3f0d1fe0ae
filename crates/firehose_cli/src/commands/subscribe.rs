//! Subscribe command implementation.

use async_trait::async_trait;
use firehose_client::{
    BoxError, CursorStore, Dispatcher, EventHandler, FirehoseConfig, FirehoseError,
    StreamConnection, WebSocketTransport,
};
use firehose_protocol::{Cursor, FirehoseEvent, RepoKey};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

/// Options for the subscribe command.
#[derive(Debug, Clone)]
pub struct SubscribeArgs {
    /// Relay endpoint.
    pub service: String,
    /// Sequence number to resume from.
    pub cursor: Option<i64>,
    /// Collections to deliver.
    pub collections: Vec<String>,
    /// Skip commits.
    pub exclude_commit: bool,
    /// Skip identity changes.
    pub exclude_identity: bool,
    /// Skip account changes.
    pub exclude_account: bool,
    /// Stop after this many events.
    pub limit: Option<usize>,
    /// Output format (text, json).
    pub format: String,
}

impl SubscribeArgs {
    fn config(&self) -> FirehoseConfig {
        let mut config = FirehoseConfig::new(self.service.clone())
            .with_exclude_commit(self.exclude_commit)
            .with_exclude_identity(self.exclude_identity)
            .with_exclude_account(self.exclude_account);
        if let Some(seq) = self.cursor {
            config = config.with_cursor(seq);
        }
        for collection in &self.collections {
            config = config.with_collection(collection.clone());
        }
        config
    }
}

/// Prints one line per event and signals when the limit is reached.
struct PrintHandler {
    json: bool,
    limit: Option<usize>,
    printed: AtomicUsize,
    done: Arc<Notify>,
}

#[async_trait]
impl EventHandler for PrintHandler {
    async fn handle_event(&self, event: FirehoseEvent) -> Result<(), BoxError> {
        if self.limit.is_some_and(|limit| self.printed.load(Ordering::SeqCst) >= limit) {
            return Ok(());
        }
        let line = if self.json {
            event_json(&event).to_string()
        } else {
            event_text(&event)
        };
        println!("{line}");

        let printed = self.printed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit.is_some_and(|limit| printed >= limit) {
            self.done.notify_one();
        }
        Ok(())
    }
}

/// Logs each cursor update.
struct LogCursorStore;

#[async_trait]
impl CursorStore for LogCursorStore {
    async fn update_cursor(&self, repo: &RepoKey, cursor: &Cursor) -> Result<(), BoxError> {
        info!(%repo, %cursor, "cursor updated");
        Ok(())
    }
}

fn event_text(event: &FirehoseEvent) -> String {
    match event {
        FirehoseEvent::Commit(op) => format!(
            "{} {:<6} {} {}",
            op.seq,
            op.action.as_str().to_uppercase(),
            op.uri(),
            op.identifier
                .as_ref()
                .map(|cid| cid.encode())
                .unwrap_or_else(|| "-".to_string())
        ),
        FirehoseEvent::Identity(identity) => format!(
            "{} IDENTITY {} {}",
            identity.seq,
            identity.did,
            identity.handle.as_deref().unwrap_or("-")
        ),
        FirehoseEvent::Account(account) => format!(
            "{} ACCOUNT {} active={} {}",
            account.seq,
            account.did,
            account.active,
            account.status.as_deref().unwrap_or("")
        ),
    }
}

fn event_json(event: &FirehoseEvent) -> serde_json::Value {
    match event {
        FirehoseEvent::Commit(op) => json!({
            "kind": "commit",
            "seq": op.seq,
            "repo": op.repo.as_str(),
            "action": op.action.as_str(),
            "path": op.path,
            "uri": op.uri(),
            "cid": op.identifier.as_ref().map(|cid| cid.encode()),
            "record_size": op.record.as_ref().map(Vec::len),
        }),
        FirehoseEvent::Identity(identity) => json!({
            "kind": "identity",
            "seq": identity.seq,
            "repo": identity.did.as_str(),
            "handle": identity.handle,
            "time": identity.time,
        }),
        FirehoseEvent::Account(account) => json!({
            "kind": "account",
            "seq": account.seq,
            "repo": account.did.as_str(),
            "active": account.active,
            "status": account.status,
            "time": account.time,
        }),
    }
}

/// Runs the subscribe command until the stream ends, the limit is reached or
/// Ctrl-C is pressed.
pub async fn run(args: SubscribeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config();
    let done = Arc::new(Notify::new());
    let handler = Arc::new(PrintHandler {
        json: args.format == "json",
        limit: args.limit,
        printed: AtomicUsize::new(0),
        done: Arc::clone(&done),
    });

    let transport = WebSocketTransport::new(config.max_frame_size, config.connect_timeout);
    let dispatcher = Dispatcher::new(&config, handler, Arc::new(LogCursorStore))
        .with_error_callback(|err: &FirehoseError| error!(%err, "firehose error"));
    let connection = Arc::new(StreamConnection::new(config, transport, dispatcher));

    let mut running = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.start().await })
    };

    let finished = tokio::select! {
        joined = &mut running => Some(joined),
        _ = done.notified() => {
            info!("event limit reached");
            None
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            None
        }
    };
    let result = match finished {
        Some(joined) => joined?,
        None => stop(&connection, running).await,
    };

    let stats = connection.stats();
    info!(
        frames = stats.frames_received,
        events = stats.events_dispatched,
        skipped = stats.frames_skipped,
        errors = stats.decode_errors + stats.handler_errors + stats.integrity_failures,
        last_cursor = %stats.last_cursor.map(|cursor| cursor.to_string()).unwrap_or_default(),
        "subscription finished"
    );
    result.map_err(Into::into)
}

async fn stop(
    connection: &StreamConnection<WebSocketTransport>,
    running: tokio::task::JoinHandle<Result<(), FirehoseError>>,
) -> Result<(), FirehoseError> {
    connection.stop().await?;
    match running.await {
        Ok(result) => result,
        Err(err) => Err(FirehoseError::transport_fatal(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_protocol::{Action, ContentId, Codec, RepoOpEvent};

    fn args() -> SubscribeArgs {
        SubscribeArgs {
            service: "wss://relay.test/xrpc/com.atproto.sync.subscribeRepos".into(),
            cursor: Some(42),
            collections: vec!["app.bsky.feed.post".into()],
            exclude_commit: false,
            exclude_identity: true,
            exclude_account: false,
            limit: Some(1),
            format: "text".into(),
        }
    }

    #[test]
    fn args_build_config() {
        let config = args().config();
        assert!(config.endpoint_url().ends_with("?cursor=42"));
        assert!(config.wants_collection("app.bsky.feed.post"));
        assert!(!config.wants_collection("app.bsky.feed.like"));
        assert!(config.exclude_identity);
    }

    #[test]
    fn commit_output() {
        let cid = ContentId::for_block(Codec::Raw, b"hello world");
        let event = FirehoseEvent::Commit(RepoOpEvent {
            action: Action::Create,
            path: "app.bsky.feed.post/xyz".into(),
            identifier: Some(cid.clone()),
            repo: RepoKey::from("did:plc:abc"),
            seq: 7,
            record: Some(b"hello world".to_vec()),
        });

        let text = event_text(&event);
        assert!(text.starts_with("7 CREATE"));
        assert!(text.contains("at://did:plc:abc/app.bsky.feed.post/xyz"));
        assert!(text.ends_with(&cid.encode()));

        let json = event_json(&event);
        assert_eq!(json["action"], "create");
        assert_eq!(json["record_size"], 11);
    }

    #[tokio::test]
    async fn handler_signals_limit() {
        let done = Arc::new(Notify::new());
        let handler = PrintHandler {
            json: true,
            limit: Some(1),
            printed: AtomicUsize::new(0),
            done: Arc::clone(&done),
        };
        let event = FirehoseEvent::Identity(firehose_protocol::IdentityEvent {
            did: RepoKey::from("did:plc:abc"),
            seq: 1,
            time: None,
            handle: Some("alice.test".into()),
        });

        handler.handle_event(event.clone()).await.unwrap();
        handler.handle_event(event).await.unwrap();
        assert_eq!(handler.printed.load(Ordering::SeqCst), 1);
        // The stored permit completes immediately.
        done.notified().await;
    }
}
