//! Frame and archive fixtures.
//!
//! Builders for the binary messages a relay would send, so tests can feed
//! realistic frames through the decoder and the client without a network.

use std::fs;
use std::path::{Path, PathBuf};

use firehose_codec::{to_canonical_cbor, CanonicalEncoder, Value};
use firehose_protocol::{
    encode_varint, header_value, Codec, ContentId, KIND_ACCOUNT, KIND_COMMIT, KIND_IDENTITY,
    OP_ERROR, OP_MESSAGE,
};
use tempfile::TempDir;

/// Repository used by the sample fixtures.
pub const SAMPLE_REPO: &str = "did:plc:ewvi7nxzyoun6zhxrhs64oiz";

/// Record path used by [`sample_commit_frame`].
pub const SAMPLE_PATH: &str = "app.bsky.feed.post/xyz";

/// Encode a value as DAG-CBOR.
pub fn encode_value(value: &Value) -> Vec<u8> {
    to_canonical_cbor(value).expect("fixture values are always encodable")
}

/// Builds CARv1 archives.
#[derive(Debug, Default, Clone)]
pub struct CarWriter {
    roots: Vec<ContentId>,
    sections: Vec<(ContentId, Vec<u8>)>,
}

impl CarWriter {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name `cid` as a root.
    pub fn with_root(mut self, cid: ContentId) -> Self {
        self.roots.push(cid);
        self
    }

    /// Add a block, returning the CID it is stored under.
    pub fn add_block(&mut self, codec: Codec, block: Vec<u8>) -> ContentId {
        let cid = ContentId::for_block(codec, &block);
        self.sections.push((cid.clone(), block));
        cid
    }

    /// Add a DAG-CBOR record, returning its CID.
    pub fn add_record(&mut self, record: &Value) -> ContentId {
        self.add_block(Codec::DagCbor, encode_value(record))
    }

    /// Add a section whose CID is taken as given, even if it does not match.
    pub fn add_section(&mut self, cid: ContentId, block: Vec<u8>) {
        self.sections.push((cid, block));
    }

    /// Serialize the archive.
    pub fn finish(&self) -> Vec<u8> {
        let header = encode_value(&header_value(&self.roots));
        let mut buf = Vec::new();
        encode_varint(&mut buf, header.len() as u64);
        buf.extend_from_slice(&header);

        for (cid, block) in &self.sections {
            let cid_bytes = cid.to_bytes();
            encode_varint(&mut buf, (cid_bytes.len() + block.len()) as u64);
            buf.extend_from_slice(&cid_bytes);
            buf.extend_from_slice(block);
        }
        buf
    }
}

/// Builds binary frames: a header value followed by a payload value.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    header: Value,
    payload: Value,
}

impl FrameBuilder {
    /// A message frame of the given kind (`#commit`, ...).
    pub fn message(kind: &str) -> Self {
        Self {
            header: Value::text_map([("op", Value::Integer(OP_MESSAGE)), ("t", Value::from(kind))]),
            payload: Value::Map(Vec::new()),
        }
    }

    /// An error frame.
    pub fn error(error: &str, message: &str) -> Self {
        Self {
            header: Value::text_map([("op", Value::Integer(OP_ERROR))]),
            payload: Value::text_map([
                ("error", Value::from(error)),
                ("message", Value::from(message)),
            ]),
        }
    }

    /// Replace the header.
    pub fn header(mut self, header: Value) -> Self {
        self.header = header;
        self
    }

    /// Replace the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize header and payload back to back.
    pub fn build(&self) -> Vec<u8> {
        let mut encoder = CanonicalEncoder::new();
        encoder
            .encode(&self.header)
            .expect("fixture header is encodable");
        encoder
            .encode(&self.payload)
            .expect("fixture payload is encodable");
        encoder.into_bytes()
    }
}

/// A post record.
pub fn post_record(text: &str) -> Value {
    Value::text_map([
        ("$type", Value::from("app.bsky.feed.post")),
        ("createdAt", Value::from("2024-11-01T12:00:00.000Z")),
        ("text", Value::from(text)),
    ])
}

/// One element of a commit's `ops` list.
pub fn op_value(action: &str, path: &str, cid: Option<&ContentId>) -> Value {
    Value::text_map([
        ("action", Value::from(action)),
        ("path", Value::from(path)),
        (
            "cid",
            cid.map_or(Value::Null, |cid| Value::Link(cid.to_link_bytes())),
        ),
    ])
}

/// A commit payload.
pub fn commit_payload(repo: &str, seq: i64, ops: Vec<Value>, blocks: Vec<u8>) -> Value {
    Value::text_map([
        ("blobs", Value::Array(Vec::new())),
        ("blocks", Value::Bytes(blocks)),
        ("ops", Value::Array(ops)),
        ("rebase", Value::Bool(false)),
        ("repo", Value::from(repo)),
        ("rev", Value::from(format!("3l{seq:011}"))),
        ("seq", Value::Integer(seq)),
        ("time", Value::from("2024-11-01T12:00:00.000Z")),
        ("tooBig", Value::Bool(false)),
    ])
}

/// A `#commit` frame whose archive holds a record for every create and
/// update. `ops` are `(action, path)` pairs.
pub fn commit_frame(repo: &str, seq: i64, ops: &[(&str, &str)]) -> Vec<u8> {
    let mut car = CarWriter::new();
    let commit_root = car.add_record(&Value::text_map([
        ("did", Value::from(repo)),
        ("version", Value::Integer(3)),
    ]));

    let op_values = ops
        .iter()
        .map(|&(action, path)| {
            if action == "delete" {
                op_value(action, path, None)
            } else {
                let cid = car.add_record(&post_record(path));
                op_value(action, path, Some(&cid))
            }
        })
        .collect();

    let blocks = car.with_root(commit_root).finish();
    FrameBuilder::message(KIND_COMMIT)
        .payload(commit_payload(repo, seq, op_values, blocks))
        .build()
}

/// A `#commit` frame for a single create.
pub fn create_frame(repo: &str, seq: i64, path: &str) -> Vec<u8> {
    commit_frame(repo, seq, &[("create", path)])
}

/// An `#identity` frame.
pub fn identity_frame(did: &str, seq: i64, handle: &str) -> Vec<u8> {
    FrameBuilder::message(KIND_IDENTITY)
        .payload(Value::text_map([
            ("did", Value::from(did)),
            ("handle", Value::from(handle)),
            ("seq", Value::Integer(seq)),
            ("time", Value::from("2024-11-01T12:00:00.000Z")),
        ]))
        .build()
}

/// An `#account` frame.
pub fn account_frame(did: &str, seq: i64, active: bool) -> Vec<u8> {
    let mut fields = vec![
        ("active", Value::Bool(active)),
        ("did", Value::from(did)),
        ("seq", Value::Integer(seq)),
        ("time", Value::from("2024-11-01T12:00:00.000Z")),
    ];
    if !active {
        fields.push(("status", Value::from("deactivated")));
    }
    FrameBuilder::message(KIND_ACCOUNT)
        .payload(Value::text_map(fields))
        .build()
}

/// An `op = -1` frame.
pub fn error_frame(error: &str, message: &str) -> Vec<u8> {
    FrameBuilder::error(error, message).build()
}

/// Bytes that do not decode as a frame.
pub fn malformed_frame() -> Vec<u8> {
    vec![0xa2, 0x62, b'o', b'p', 0x01, 0xff, 0xff]
}

/// The reference commit: one `create` of [`SAMPLE_PATH`] in [`SAMPLE_REPO`].
#[derive(Debug, Clone)]
pub struct SampleCommit {
    /// The binary frame.
    pub bytes: Vec<u8>,
    /// CID of the created record.
    pub cid: ContentId,
    /// The record block.
    pub record: Vec<u8>,
    /// Sequence number.
    pub seq: i64,
}

/// Build the reference commit frame.
pub fn sample_commit_frame() -> SampleCommit {
    let seq = 1_000_001;
    let record = encode_value(&post_record("hello firehose"));
    let mut car = CarWriter::new();
    let cid = car.add_block(Codec::DagCbor, record.clone());
    let blocks = car.with_root(cid.clone()).finish();

    let bytes = FrameBuilder::message(KIND_COMMIT)
        .payload(commit_payload(
            SAMPLE_REPO,
            seq,
            vec![op_value("create", SAMPLE_PATH, Some(&cid))],
            blocks,
        ))
        .build();

    SampleCommit {
        bytes,
        cid,
        record,
        seq,
    }
}

/// A frame written to a temporary file, removed on drop.
pub struct FrameFile {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl FrameFile {
    /// Write `bytes` to `frame.bin` in a fresh temporary directory.
    pub fn write(bytes: &[u8]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("frame.bin");
        fs::write(&path, bytes).expect("Failed to write frame file");
        Self {
            path,
            _temp_dir: temp_dir,
        }
    }

    /// Path of the written file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_protocol::{decode_frame, extract_blocks, translate, verify_header, StreamMessage};

    #[test]
    fn sample_commit_decodes() {
        let sample = sample_commit_frame();
        let frame = decode_frame(&sample.bytes).unwrap();
        assert!(verify_header(&frame.header));

        let (repo, op) = translate(&frame.payload).unwrap();
        assert_eq!(repo.as_str(), SAMPLE_REPO);
        assert_eq!(op.path, SAMPLE_PATH);
        assert_eq!(op.identifier, Some(sample.cid.clone()));

        let blocks = frame.payload.get("blocks").and_then(Value::as_bytes).unwrap();
        let archive = extract_blocks(blocks).unwrap();
        assert_eq!(archive.get(&sample.cid), Some(sample.record.as_slice()));
    }

    #[test]
    fn commit_frame_covers_every_op() {
        let bytes = commit_frame(
            "did:plc:abc",
            5,
            &[
                ("create", "app.bsky.feed.post/1"),
                ("update", "app.bsky.actor.profile/self"),
                ("delete", "app.bsky.feed.like/2"),
            ],
        );
        let frame = decode_frame(&bytes).unwrap();
        match StreamMessage::from_frame(&frame).unwrap() {
            StreamMessage::Commit(commit) => {
                assert_eq!(commit.ops.len(), 3);
                let events = commit.op_events();
                assert!(events[0].record.is_some());
                assert!(events[1].record.is_some());
                assert!(events[2].record.is_none());
                // Commit block plus two records.
                assert_eq!(commit.blocks.len(), 3);
                assert_eq!(commit.blocks.roots.len(), 1);
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_does_not_verify() {
        let frame = decode_frame(&error_frame("ConsumerTooSlow", "slow down")).unwrap();
        assert!(!verify_header(&frame.header));
    }

    #[test]
    fn malformed_frame_fails() {
        assert!(decode_frame(&malformed_frame()).is_err());
    }

    #[test]
    fn mismatched_section_is_kept_verbatim() {
        let mut car = CarWriter::new();
        let cid = ContentId::for_block(Codec::Raw, b"original");
        car.add_section(cid.clone(), b"tampered".to_vec());
        let archive = extract_blocks(&car.finish()).unwrap();
        assert!(archive.is_empty());
        assert_eq!(archive.integrity_failures[0].declared, cid);
    }

    #[test]
    fn frame_file_roundtrip() {
        let sample = sample_commit_frame();
        let file = FrameFile::write(&sample.bytes);
        assert_eq!(std::fs::read(file.path()).unwrap(), sample.bytes);
    }
}
