//! CARv1 block archives.
//!
//! Commit payloads embed their records as a CAR archive in `blocks`:
//!
//! ```text
//! varint(header_len) | header (DAG-CBOR {version: 1, roots: [link]})
//! varint(section_len) | CID | block bytes      (repeated)
//! ```
//!
//! Every block is hashed and compared with the CID it was stored under.
//! Mismatched blocks are dropped and reported on the archive. A tail that
//! does not parse as a section is padding and is counted as trailing data.

use std::collections::BTreeMap;

use crate::content_id::ContentId;
use crate::error::{BlockIntegrityError, ProtocolError, ProtocolResult};
use crate::reader::ByteReader;
use firehose_codec::{CanonicalDecoder, Value};

/// The only CAR version accepted.
pub const CAR_VERSION: i64 = 1;

/// A parsed and verified block archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarArchive {
    /// Root CIDs named by the header.
    pub roots: Vec<ContentId>,
    /// Verified blocks keyed by CID.
    pub blocks: BTreeMap<ContentId, Vec<u8>>,
    /// Blocks that failed verification, in archive order.
    pub integrity_failures: Vec<BlockIntegrityError>,
    /// Bytes at the end that did not form a complete section.
    pub trailing_bytes: usize,
}

impl CarArchive {
    /// Look up a verified block.
    pub fn get(&self, cid: &ContentId) -> Option<&[u8]> {
        self.blocks.get(cid).map(Vec::as_slice)
    }

    /// Number of verified blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when no block survived verification.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// True when the archive ended with an incomplete section.
    pub fn has_trailing_data(&self) -> bool {
        self.trailing_bytes > 0
    }

    /// True when at least one block failed verification.
    pub fn has_integrity_failures(&self) -> bool {
        !self.integrity_failures.is_empty()
    }
}

/// Parses CAR archives and verifies each block against its CID.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockExtractor;

impl BlockExtractor {
    /// Parse `bytes` as a CARv1 archive.
    ///
    /// # Errors
    ///
    /// Fails when the header is unreadable, or when a section's CID names a
    /// codec or hash function this client does not know. Hash mismatches are
    /// recorded on the returned archive; so is a tail that does not parse as
    /// a section, whatever its content.
    pub fn extract(bytes: &[u8]) -> ProtocolResult<CarArchive> {
        let mut reader = ByteReader::new(bytes);
        let roots = read_header(&mut reader)?;

        let mut archive = CarArchive {
            roots,
            ..CarArchive::default()
        };

        while !reader.is_empty() {
            let section_start = reader.position();
            let section = match reader.read_length() {
                Ok(len) if len > 0 && len <= reader.remaining() => reader.read_bytes(len)?,
                _ => {
                    archive.trailing_bytes = bytes.len() - section_start;
                    break;
                }
            };

            let (declared, cid_len) = match ContentId::read_prefix(section) {
                Ok(read) => read,
                Err(
                    err @ (ProtocolError::UnknownCodec { .. }
                    | ProtocolError::UnknownHashFunction { .. }),
                ) => return Err(err),
                Err(_) => {
                    archive.trailing_bytes = bytes.len() - section_start;
                    break;
                }
            };
            let block = section.get(cid_len..).unwrap_or_default();

            if declared.verify(block) {
                archive.blocks.insert(declared, block.to_vec());
            } else {
                let computed = ContentId::compute(declared.codec(), declared.hash_code(), block);
                archive
                    .integrity_failures
                    .push(BlockIntegrityError { declared, computed });
            }
        }

        Ok(archive)
    }
}

/// Parse a CAR archive with [`BlockExtractor`].
pub fn extract_blocks(bytes: &[u8]) -> ProtocolResult<CarArchive> {
    BlockExtractor::extract(bytes)
}

fn read_header(reader: &mut ByteReader<'_>) -> ProtocolResult<Vec<ContentId>> {
    let header_len = reader.read_length()?;
    let header_bytes = reader.read_bytes(header_len)?;

    let mut decoder = CanonicalDecoder::new(header_bytes);
    let header = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(ProtocolError::malformed("CAR header has trailing bytes"));
    }
    if header.as_map().is_none() {
        return Err(ProtocolError::malformed("CAR header is not a map"));
    }

    let version = header
        .get("version")
        .ok_or_else(|| ProtocolError::missing_field("version"))?
        .as_integer()
        .ok_or_else(|| ProtocolError::invalid_field("version", "integer"))?;
    if version != CAR_VERSION {
        let version = u64::try_from(version)
            .map_err(|_| ProtocolError::invalid_field("version", "non-negative integer"))?;
        return Err(ProtocolError::UnsupportedVersion { version });
    }

    header
        .get("roots")
        .ok_or_else(|| ProtocolError::missing_field("roots"))?
        .as_array()
        .ok_or_else(|| ProtocolError::invalid_field("roots", "array of links"))?
        .iter()
        .map(|root| {
            root.as_link()
                .ok_or_else(|| ProtocolError::invalid_field("roots", "array of links"))
                .and_then(ContentId::from_link_bytes)
        })
        .collect()
}

/// Encode a CAR header value for `roots`.
pub fn header_value(roots: &[ContentId]) -> Value {
    Value::text_map([
        (
            "roots",
            Value::Array(
                roots
                    .iter()
                    .map(|cid| Value::Link(cid.to_link_bytes()))
                    .collect(),
            ),
        ),
        ("version", Value::Integer(CAR_VERSION)),
    ])
}
