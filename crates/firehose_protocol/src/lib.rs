//! # Firehose Protocol
//!
//! Wire types and decoders for the repository firehose.
//!
//! This crate provides:
//! - `ContentId` for content identifiers (binary and base32 text forms)
//! - `FrameDecoder` for splitting messages into header and payload
//! - `BlockExtractor` for CAR archives with per-block hash verification
//! - Event translation from payloads into repository operations
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! ## Message layout
//!
//! ```text
//! binary message = header (DAG-CBOR map) || payload (DAG-CBOR map)
//! header         = {op: 1, t: "#commit"}      or {op: -1} for errors
//! commit payload = {repo, seq, rev, time, ops: [...], blocks: CAR bytes}
//! ```
//!
//! ## Key Invariants
//!
//! - Frames whose header `op` is not `1` are skipped, never interpreted
//! - Every extracted block hashes to the CID it is stored under
//! - Decoding never panics on hostile input

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod car;
mod content_id;
mod error;
mod event;
mod frame;
mod reader;

pub use car::{extract_blocks, header_value, BlockExtractor, CarArchive, CAR_VERSION};
pub use content_id::{Codec, ContentId, HashCode, MULTIBASE_BASE32_PREFIX};
pub use error::{BlockIntegrityError, ProtocolError, ProtocolResult};
pub use event::{
    translate, translate_message, translate_ops, AccountEvent, Action, CommitEvent, Cursor,
    FirehoseEvent, IdentityEvent, InfoMessage, Operation, RepoKey, RepoOpEvent, StreamMessage,
    KIND_ACCOUNT, KIND_COMMIT, KIND_IDENTITY, KIND_INFO,
};
pub use frame::{
    decode_frame, verify_header, ErrorFrame, Frame, FrameDecoder, FrameHeader,
    DEFAULT_MAX_FRAME_SIZE, OP_ERROR, OP_MESSAGE,
};
pub use reader::{encode_varint, ByteReader};
