//! Translation of decoded payloads into repository events.

use std::fmt;

use crate::car::{extract_blocks, CarArchive};
use crate::content_id::ContentId;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;
use firehose_codec::Value;

/// Header kind of a repository commit.
pub const KIND_COMMIT: &str = "#commit";
/// Header kind of an identity change.
pub const KIND_IDENTITY: &str = "#identity";
/// Header kind of an account status change.
pub const KIND_ACCOUNT: &str = "#account";
/// Header kind of an informational message.
pub const KIND_INFO: &str = "#info";

/// Identifies a repository (a DID). Events for the same key are ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoKey(String);

impl RepoKey {
    /// Wrap a repository identifier.
    pub fn new(did: impl Into<String>) -> Self {
        Self(did.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RepoKey {
    fn from(did: &str) -> Self {
        Self::new(did)
    }
}

impl From<String> for RepoKey {
    fn from(did: String) -> Self {
        Self(did)
    }
}

/// Opaque stream position, handed to the cursor store after processing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a cursor string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Cursor for a frame sequence number.
    pub fn from_seq(seq: i64) -> Self {
        Self(seq.to_string())
    }

    /// The cursor as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The sequence number, when the cursor is numeric.
    pub fn seq(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of change an operation applies to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// A new record.
    Create,
    /// A replaced record.
    Update,
    /// A removed record.
    Delete,
}

impl Action {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Parse a wire name.
    pub fn parse(action: &str) -> ProtocolResult<Self> {
        match action {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(ProtocolError::InvalidAction {
                action: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record change inside a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// What happened to the record.
    pub action: Action,
    /// `collection/rkey` path of the record.
    pub path: String,
    /// CID of the new record. `None` for deletes.
    pub identifier: Option<ContentId>,
}

impl Operation {
    /// Parse one element of a commit's `ops` list.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        if value.as_map().is_none() {
            return Err(ProtocolError::invalid_field("ops", "array of maps"));
        }

        let action = value
            .get("action")
            .ok_or_else(|| ProtocolError::missing_field("action"))?
            .as_text()
            .ok_or_else(|| ProtocolError::invalid_field("action", "text"))
            .and_then(Action::parse)?;
        let path = value
            .get("path")
            .ok_or_else(|| ProtocolError::missing_field("path"))?
            .as_text()
            .ok_or_else(|| ProtocolError::invalid_field("path", "text"))?
            .to_string();

        let identifier = match value.get("cid") {
            None | Some(Value::Null) => None,
            Some(Value::Link(bytes) | Value::Bytes(bytes)) => {
                Some(ContentId::from_link_bytes(bytes)?)
            }
            Some(_) => return Err(ProtocolError::invalid_field("cid", "link or bytes")),
        };
        if identifier.is_none() && action != Action::Delete {
            return Err(ProtocolError::missing_field("cid"));
        }

        Ok(Self {
            action,
            path,
            identifier,
        })
    }

    /// Collection NSID: the path up to the first `/`.
    pub fn collection(&self) -> &str {
        self.path.split('/').next().unwrap_or_default()
    }

    /// Record key: the path after the first `/`.
    pub fn record_key(&self) -> Option<&str> {
        self.path.split_once('/').map(|(_, rkey)| rkey)
    }

    /// `CREATE app.bsky.feed.post` style label for logs.
    pub fn log_label(&self) -> String {
        format!(
            "{} {}",
            self.action.as_str().to_uppercase(),
            self.collection()
        )
    }

    /// `at://` URI of the record within `repo`.
    pub fn uri(&self, repo: &RepoKey) -> String {
        format!("at://{}/{}", repo, self.path)
    }
}

/// Repository key and first operation of a commit payload.
///
/// # Errors
///
/// `MissingOperation` when `ops` is absent or empty, `MissingField` when
/// `repo` is absent.
pub fn translate(payload: &Value) -> ProtocolResult<(RepoKey, Operation)> {
    let (repo, ops) = translate_ops(payload)?;
    let first = ops
        .into_iter()
        .next()
        .ok_or(ProtocolError::MissingOperation)?;
    Ok((repo, first))
}

/// Repository key and every operation of a commit payload, in order.
pub fn translate_ops(payload: &Value) -> ProtocolResult<(RepoKey, Vec<Operation>)> {
    let ops = match payload.get("ops") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingOperation),
        Some(ops) => ops
            .as_array()
            .ok_or_else(|| ProtocolError::invalid_field("ops", "array"))?,
    };
    if ops.is_empty() {
        return Err(ProtocolError::MissingOperation);
    }

    let repo = required_text(payload, "repo")?;
    let ops = ops
        .iter()
        .map(Operation::from_value)
        .collect::<ProtocolResult<Vec<_>>>()?;

    Ok((RepoKey::new(repo), ops))
}

/// A decoded `#commit` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    /// Repository the commit belongs to.
    pub repo: RepoKey,
    /// Stream sequence number.
    pub seq: i64,
    /// Repository revision.
    pub rev: Option<String>,
    /// Relay timestamp.
    pub time: Option<String>,
    /// Record operations, in order.
    pub ops: Vec<Operation>,
    /// Verified record blocks.
    pub blocks: CarArchive,
}

impl CommitEvent {
    /// Decode a commit payload, extracting and verifying its blocks.
    pub fn from_payload(payload: &Value) -> ProtocolResult<Self> {
        let (repo, ops) = translate_ops(payload)?;
        let seq = required_integer(payload, "seq")?;
        let blocks = match payload.get("blocks").and_then(Value::as_bytes) {
            Some(bytes) if !bytes.is_empty() => extract_blocks(bytes)?,
            _ => CarArchive::default(),
        };

        Ok(Self {
            repo,
            seq,
            rev: optional_text(payload, "rev"),
            time: optional_text(payload, "time"),
            ops,
            blocks,
        })
    }

    /// One deliverable event per operation, with its record bytes attached.
    pub fn op_events(&self) -> Vec<RepoOpEvent> {
        self.ops
            .iter()
            .map(|op| RepoOpEvent {
                action: op.action,
                path: op.path.clone(),
                identifier: op.identifier.clone(),
                repo: self.repo.clone(),
                seq: self.seq,
                record: op
                    .identifier
                    .as_ref()
                    .and_then(|cid| self.blocks.get(cid))
                    .map(<[u8]>::to_vec),
            })
            .collect()
    }

    /// Stream position after this commit.
    pub fn cursor(&self) -> Cursor {
        Cursor::from_seq(self.seq)
    }
}

/// A decoded `#identity` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityEvent {
    /// Account DID.
    pub did: RepoKey,
    /// Stream sequence number.
    pub seq: i64,
    /// Relay timestamp.
    pub time: Option<String>,
    /// Current handle, if the relay sent one.
    pub handle: Option<String>,
}

impl IdentityEvent {
    /// Decode an identity payload.
    pub fn from_payload(payload: &Value) -> ProtocolResult<Self> {
        Ok(Self {
            did: RepoKey::new(required_text(payload, "did")?),
            seq: required_integer(payload, "seq")?,
            time: optional_text(payload, "time"),
            handle: optional_text(payload, "handle"),
        })
    }
}

/// A decoded `#account` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEvent {
    /// Account DID.
    pub did: RepoKey,
    /// Stream sequence number.
    pub seq: i64,
    /// Relay timestamp.
    pub time: Option<String>,
    /// Whether the account is active.
    pub active: bool,
    /// Reason for inactivity, e.g. `takendown`.
    pub status: Option<String>,
}

impl AccountEvent {
    /// Decode an account payload.
    pub fn from_payload(payload: &Value) -> ProtocolResult<Self> {
        let active = payload
            .get("active")
            .ok_or_else(|| ProtocolError::missing_field("active"))?
            .as_bool()
            .ok_or_else(|| ProtocolError::invalid_field("active", "bool"))?;
        Ok(Self {
            did: RepoKey::new(required_text(payload, "did")?),
            seq: required_integer(payload, "seq")?,
            time: optional_text(payload, "time"),
            active,
            status: optional_text(payload, "status"),
        })
    }
}

/// A decoded `#info` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoMessage {
    /// Info name, e.g. `OutdatedCursor`.
    pub name: String,
    /// Optional detail.
    pub message: Option<String>,
}

impl InfoMessage {
    /// Decode an info payload.
    pub fn from_payload(payload: &Value) -> ProtocolResult<Self> {
        Ok(Self {
            name: required_text(payload, "name")?,
            message: optional_text(payload, "message"),
        })
    }
}

/// Any message frame, interpreted by its header kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// `#commit`
    Commit(CommitEvent),
    /// `#identity`
    Identity(IdentityEvent),
    /// `#account`
    Account(AccountEvent),
    /// `#info`
    Info(InfoMessage),
    /// Any other kind, carried by name.
    Unknown(String),
}

impl StreamMessage {
    /// Interpret a message frame. Call only after the header verified.
    pub fn from_frame(frame: &Frame) -> ProtocolResult<Self> {
        let kind = frame.header.kind.as_deref().unwrap_or_default();
        let message = match kind {
            KIND_COMMIT => StreamMessage::Commit(CommitEvent::from_payload(&frame.payload)?),
            KIND_IDENTITY => StreamMessage::Identity(IdentityEvent::from_payload(&frame.payload)?),
            KIND_ACCOUNT => StreamMessage::Account(AccountEvent::from_payload(&frame.payload)?),
            KIND_INFO => StreamMessage::Info(InfoMessage::from_payload(&frame.payload)?),
            other => StreamMessage::Unknown(other.to_string()),
        };
        Ok(message)
    }

    /// Stream position carried by the message.
    pub fn cursor(&self) -> Option<Cursor> {
        match self {
            StreamMessage::Commit(event) => Some(event.cursor()),
            StreamMessage::Identity(event) => Some(Cursor::from_seq(event.seq)),
            StreamMessage::Account(event) => Some(Cursor::from_seq(event.seq)),
            StreamMessage::Info(_) | StreamMessage::Unknown(_) => None,
        }
    }

    /// Repository the message is ordered under.
    pub fn repo(&self) -> Option<&RepoKey> {
        match self {
            StreamMessage::Commit(event) => Some(&event.repo),
            StreamMessage::Identity(event) => Some(&event.did),
            StreamMessage::Account(event) => Some(&event.did),
            StreamMessage::Info(_) | StreamMessage::Unknown(_) => None,
        }
    }
}

/// Interpret a verified message frame.
pub fn translate_message(frame: &Frame) -> ProtocolResult<StreamMessage> {
    StreamMessage::from_frame(frame)
}

/// A single record operation, ready for application logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOpEvent {
    /// What happened to the record.
    pub action: Action,
    /// `collection/rkey` path of the record.
    pub path: String,
    /// CID of the new record. `None` for deletes.
    pub identifier: Option<ContentId>,
    /// Repository the record lives in.
    pub repo: RepoKey,
    /// Sequence number of the enclosing commit.
    pub seq: i64,
    /// Verified record bytes, when the archive carried them.
    pub record: Option<Vec<u8>>,
}

impl RepoOpEvent {
    /// Collection NSID: the path up to the first `/`.
    pub fn collection(&self) -> &str {
        self.path.split('/').next().unwrap_or_default()
    }

    /// `at://` URI of the record.
    pub fn uri(&self) -> String {
        format!("at://{}/{}", self.repo, self.path)
    }
}

/// An event delivered to the application's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirehoseEvent {
    /// One operation of a commit.
    Commit(RepoOpEvent),
    /// Identity change.
    Identity(IdentityEvent),
    /// Account status change.
    Account(AccountEvent),
}

impl FirehoseEvent {
    /// Repository the event belongs to.
    pub fn repo(&self) -> &RepoKey {
        match self {
            FirehoseEvent::Commit(event) => &event.repo,
            FirehoseEvent::Identity(event) => &event.did,
            FirehoseEvent::Account(event) => &event.did,
        }
    }

    /// Sequence number of the message that produced the event.
    pub fn seq(&self) -> i64 {
        match self {
            FirehoseEvent::Commit(event) => event.seq,
            FirehoseEvent::Identity(event) => event.seq,
            FirehoseEvent::Account(event) => event.seq,
        }
    }

    /// Short name of the event category.
    pub fn kind(&self) -> &'static str {
        match self {
            FirehoseEvent::Commit(_) => "commit",
            FirehoseEvent::Identity(_) => "identity",
            FirehoseEvent::Account(_) => "account",
        }
    }
}

fn required_text(payload: &Value, field: &str) -> ProtocolResult<String> {
    payload
        .get(field)
        .ok_or_else(|| ProtocolError::missing_field(field))?
        .as_text()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::invalid_field(field, "text"))
}

fn required_integer(payload: &Value, field: &str) -> ProtocolResult<i64> {
    payload
        .get(field)
        .ok_or_else(|| ProtocolError::missing_field(field))?
        .as_integer()
        .ok_or_else(|| ProtocolError::invalid_field(field, "integer"))
}

fn optional_text(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_text).map(str::to_string)
}
