//! Error types for the protocol crate.

use crate::content_id::ContentId;
use firehose_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding a single firehose message.
///
/// Every variant is scoped to one message: callers report it and move on
/// to the next frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Bytes do not parse as DAG-CBOR, or parse to the wrong shape.
    #[error("malformed CBOR: {message}")]
    MalformedCbor {
        /// Description of the failure.
        message: String,
    },

    /// A required header or payload key is absent.
    #[error("missing field: {field}")]
    MissingField {
        /// Name of the missing key.
        field: String,
    },

    /// A key is present but holds the wrong type.
    #[error("invalid field {field}: expected {expected}")]
    InvalidField {
        /// Name of the key.
        field: String,
        /// What the key should have held.
        expected: &'static str,
    },

    /// Fewer bytes remain than a length prefix or digest requires.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    TruncatedInput {
        /// Bytes required.
        needed: usize,
        /// Bytes remaining.
        available: usize,
    },

    /// Unrecognised multicodec content type.
    #[error("unknown codec 0x{code:x}")]
    UnknownCodec {
        /// The codec code read from the input.
        code: u64,
    },

    /// Unrecognised multihash function.
    #[error("unknown hash function 0x{code:x}")]
    UnknownHashFunction {
        /// The hash code read from the input.
        code: u64,
    },

    /// CID version other than 1.
    #[error("unsupported CID version {version}")]
    UnsupportedVersion {
        /// The version read from the input.
        version: u64,
    },

    /// Declared digest length disagrees with the hash function.
    #[error("digest length mismatch: hash function produces {expected} bytes, declared {declared}")]
    DigestLengthMismatch {
        /// Length the hash function produces.
        expected: usize,
        /// Length declared in the multihash.
        declared: u64,
    },

    /// Structurally invalid CID (binary or text form).
    #[error("invalid CID: {message}")]
    InvalidCid {
        /// Description of the failure.
        message: String,
    },

    /// Varint is truncated, overlong or overflows 64 bits.
    #[error("invalid varint: {message}")]
    InvalidVarint {
        /// Description of the failure.
        message: String,
    },

    /// Commit payload has no operations.
    #[error("commit payload has no operations")]
    MissingOperation,

    /// Operation action is not create, update or delete.
    #[error("invalid operation action: {action}")]
    InvalidAction {
        /// The action string received.
        action: String,
    },

    /// Message exceeds the configured maximum frame size.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Size of the received message.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl ProtocolError {
    /// Create a malformed CBOR error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedCbor {
            message: message.into(),
        }
    }

    /// Create a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, expected: &'static str) -> Self {
        Self::InvalidField {
            field: field.into(),
            expected,
        }
    }

    /// Create an invalid CID error.
    pub fn invalid_cid(message: impl Into<String>) -> Self {
        Self::InvalidCid {
            message: message.into(),
        }
    }
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        Self::malformed(err.to_string())
    }
}

/// A block whose bytes do not hash to the CID it was stored under.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("block integrity failure: declared {declared}, computed {computed}")]
pub struct BlockIntegrityError {
    /// CID the archive stored the block under.
    pub declared: ContentId,
    /// CID computed from the block bytes.
    pub computed: ContentId,
}
