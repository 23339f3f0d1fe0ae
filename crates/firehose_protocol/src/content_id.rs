//! Content identifiers (CIDv1).
//!
//! Parsing and formatting go through the `cid` crate. On top of it,
//! [`ContentId`] narrows the accepted space to what the firehose carries:
//! version 1, DAG-CBOR or raw content, SHA-256 digests.
//!
//! The text form is the multibase `b` prefix followed by lowercase unpadded
//! base32 (`bafyrei...` for DAG-CBOR blocks).

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use cid::multibase::Base;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

use crate::error::{ProtocolError, ProtocolResult};

/// Multibase prefix of the base32-lower text form.
pub const MULTIBASE_BASE32_PREFIX: char = 'b';

/// Multibase "identity" prefix carried inside DAG-CBOR links.
const MULTIBASE_IDENTITY: u8 = 0x00;

/// Content type of the addressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Codec {
    /// DAG-CBOR (0x71): records and commit nodes.
    DagCbor,
    /// Raw bytes (0x55): blobs.
    Raw,
}

impl Codec {
    /// Multicodec code.
    pub fn code(&self) -> u64 {
        match self {
            Codec::DagCbor => 0x71,
            Codec::Raw => 0x55,
        }
    }

    /// Look up a codec by multicodec code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x71 => Some(Codec::DagCbor),
            0x55 => Some(Codec::Raw),
            _ => None,
        }
    }

    /// Multicodec table name.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::DagCbor => "dag-cbor",
            Codec::Raw => "raw",
        }
    }
}

/// Hash function of a multihash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashCode {
    /// SHA-256 (0x12), 32-byte digests.
    Sha2_256,
}

impl HashCode {
    /// Multihash function code.
    pub fn code(&self) -> u64 {
        match self {
            HashCode::Sha2_256 => 0x12,
        }
    }

    /// Look up a hash function by multihash code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x12 => Some(HashCode::Sha2_256),
            _ => None,
        }
    }

    /// Digest size in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashCode::Sha2_256 => 32,
        }
    }

    /// Multihash table name.
    pub fn name(&self) -> &'static str {
        match self {
            HashCode::Sha2_256 => "sha2-256",
        }
    }

    fn table_code(self) -> Code {
        match self {
            HashCode::Sha2_256 => Code::Sha2_256,
        }
    }
}

/// A version 1 content identifier with a known codec and hash function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId {
    cid: Cid,
    codec: Codec,
    hash: HashCode,
}

impl ContentId {
    /// The only CID version the firehose carries.
    pub const VERSION: u64 = 1;

    /// Compute the CID of `block` under `codec` and `hash`.
    pub fn compute(codec: Codec, hash: HashCode, block: &[u8]) -> Self {
        let multihash = hash.table_code().digest(block);
        Self {
            cid: Cid::new_v1(codec.code(), multihash),
            codec,
            hash,
        }
    }

    /// Compute the SHA-256 CID of `block` under `codec`.
    pub fn for_block(codec: Codec, block: &[u8]) -> Self {
        Self::compute(codec, HashCode::Sha2_256, block)
    }

    /// Decode the binary form. The input must hold exactly one CID.
    ///
    /// # Errors
    ///
    /// `TruncatedInput` when the digest is shorter than declared,
    /// `UnknownCodec`/`UnknownHashFunction` for unrecognised codes, and
    /// `InvalidCid` when bytes follow the digest.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (cid, consumed) = Self::read_prefix(bytes)?;
        if consumed != bytes.len() {
            return Err(ProtocolError::invalid_cid(format!(
                "{} trailing bytes after digest",
                bytes.len() - consumed
            )));
        }
        Ok(cid)
    }

    /// Read the CID at the start of `bytes`, returning it with the number of
    /// bytes it occupies.
    pub fn read_prefix(bytes: &[u8]) -> ProtocolResult<(Self, usize)> {
        let mut cursor = Cursor::new(bytes);
        let cid = match Cid::read_bytes(&mut cursor) {
            Ok(cid) => cid,
            Err(err) => return Err(explain(bytes, &err)),
        };
        let consumed = usize::try_from(cursor.position())
            .map_err(|_| ProtocolError::invalid_cid("CID longer than the input"))?;

        let content_id = Self::try_from(cid)?;
        if bytes.get(..consumed) != Some(cid.to_bytes().as_slice()) {
            return Err(ProtocolError::invalid_cid("non-minimal varint in CID"));
        }
        Ok((content_id, consumed))
    }

    /// Decode the payload of a DAG-CBOR link (tag 42).
    ///
    /// Links carry a leading `0x00` multibase identity byte; it is stripped
    /// when present, so bare binary CIDs are accepted too.
    pub fn from_link_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        match bytes.split_first() {
            Some((&MULTIBASE_IDENTITY, rest)) => Self::decode(rest),
            _ => Self::decode(bytes),
        }
    }

    /// Binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.cid.to_bytes()
    }

    /// Binary form with the `0x00` prefix used inside DAG-CBOR links.
    pub fn to_link_bytes(&self) -> Vec<u8> {
        let mut buf = vec![MULTIBASE_IDENTITY];
        buf.extend_from_slice(&self.cid.to_bytes());
        buf
    }

    /// Canonical text form: `b` + lowercase unpadded base32.
    pub fn encode(&self) -> String {
        // Version 1 CIDs display in base32-lower.
        self.cid.to_string()
    }

    /// Parse the canonical text form produced by [`ContentId::encode`].
    ///
    /// Other multibases, and base32 text that does not re-encode to itself,
    /// are rejected.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        if !text.starts_with(MULTIBASE_BASE32_PREFIX) {
            return Err(ProtocolError::invalid_cid(
                "expected base32 multibase prefix 'b'",
            ));
        }
        let cid = Cid::try_from(text).map_err(|err| ProtocolError::invalid_cid(err.to_string()))?;
        let content_id = Self::try_from(cid)?;
        match cid.to_string_of_base(Base::Base32Lower) {
            Ok(canonical) if canonical == text => Ok(content_id),
            _ => Err(ProtocolError::invalid_cid("not canonical base32-lower text")),
        }
    }

    /// Check that `block` hashes to this CID's digest.
    pub fn verify(&self, block: &[u8]) -> bool {
        self.hash.table_code().digest(block) == *self.cid.hash()
    }

    /// CID version.
    pub fn version(&self) -> u64 {
        u64::from(self.cid.version())
    }

    /// Content codec.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Hash function of the multihash.
    pub fn hash_code(&self) -> HashCode {
        self.hash
    }

    /// Raw digest bytes.
    pub fn digest(&self) -> &[u8] {
        self.cid.hash().digest()
    }

    /// The underlying multiformats CID.
    pub fn as_cid(&self) -> &Cid {
        &self.cid
    }
}

impl TryFrom<Cid> for ContentId {
    type Error = ProtocolError;

    fn try_from(cid: Cid) -> Result<Self, Self::Error> {
        let version = u64::from(cid.version());
        if version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion { version });
        }
        let codec = Codec::from_code(cid.codec())
            .ok_or(ProtocolError::UnknownCodec { code: cid.codec() })?;
        let multihash = cid.hash();
        let hash = HashCode::from_code(multihash.code()).ok_or(
            ProtocolError::UnknownHashFunction {
                code: multihash.code(),
            },
        )?;
        if usize::from(multihash.size()) != hash.digest_len() {
            return Err(ProtocolError::DigestLengthMismatch {
                expected: hash.digest_len(),
                declared: u64::from(multihash.size()),
            });
        }
        Ok(Self { cid, codec, hash })
    }
}

impl From<ContentId> for Cid {
    fn from(id: ContentId) -> Self {
        id.cid
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.cid, f)
    }
}

impl FromStr for ContentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Turn a failed binary read into the most specific error.
///
/// The `cid` crate folds every multihash failure into one parsing error, so
/// the prefix is walked again to tell a bad code from a short digest.
fn explain(bytes: &[u8], err: &cid::Error) -> ProtocolError {
    let mut rest = bytes;
    let mut fields = [0u64; 4];
    for field in &mut fields {
        match unsigned_varint::decode::u64(rest) {
            Ok((value, tail)) => {
                *field = value;
                rest = tail;
            }
            Err(varint) => {
                return ProtocolError::InvalidVarint {
                    message: varint.to_string(),
                }
            }
        }
    }

    let [version, codec, hash, declared] = fields;
    if version != ContentId::VERSION {
        return ProtocolError::UnsupportedVersion { version };
    }
    if Codec::from_code(codec).is_none() {
        return ProtocolError::UnknownCodec { code: codec };
    }
    let Some(hash) = HashCode::from_code(hash) else {
        return ProtocolError::UnknownHashFunction { code: hash };
    };
    if declared != hash.digest_len() as u64 {
        return ProtocolError::DigestLengthMismatch {
            expected: hash.digest_len(),
            declared,
        };
    }
    if rest.len() < hash.digest_len() {
        return ProtocolError::TruncatedInput {
            needed: hash.digest_len(),
            available: rest.len(),
        };
    }
    ProtocolError::invalid_cid(err.to_string())
}
