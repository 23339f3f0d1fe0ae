//! Strict DAG-CBOR decoder.
//!
//! Anything a canonical encoder would not have produced is rejected:
//! over-long heads, indefinite lengths, floats, tags other than 42, non-text
//! or out-of-order map keys.

use std::cmp::Ordering;

use crate::error::{CodecError, CodecResult};
use crate::head::{argument_width, width_floor, Major, INDEFINITE};
use crate::value::{key_order, Value};

/// CBOR tag number for content links.
pub const LINK_TAG: u64 = 42;

/// Upper bound on array and map lengths claimed by the input.
const MAX_ITEMS: u64 = 1 << 20;

/// Upper bound on byte and text string lengths claimed by the input.
const MAX_STRING_LEN: u64 = 64 << 20;

/// Containers nested deeper than this are rejected.
const MAX_NESTING: usize = 128;

/// Decode the first item in `bytes`.
///
/// Anything after it is ignored; use [`CanonicalDecoder`] to walk a
/// sequence of items.
///
/// # Errors
///
/// Any [`CodecError`] describing why the bytes are not DAG-CBOR.
pub fn from_cbor(bytes: &[u8]) -> CodecResult<Value> {
    CanonicalDecoder::new(bytes).decode()
}

/// Reads DAG-CBOR items one after another from a byte slice.
#[derive(Debug, Clone)]
pub struct CanonicalDecoder<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> CanonicalDecoder<'a> {
    /// A decoder positioned at the start of `input`.
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    /// Reads the next item.
    pub fn decode(&mut self) -> CodecResult<Value> {
        self.item(0)
    }

    /// True once every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Bytes read so far.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// The unread tail of the input.
    pub fn remaining(&self) -> &'a [u8] {
        self.input.get(self.offset..).unwrap_or_default()
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let bytes = self
            .remaining()
            .get(..len)
            .ok_or(CodecError::UnexpectedEof)?;
        self.offset += len;
        Ok(bytes)
    }

    fn argument(&mut self, info: u8) -> CodecResult<u64> {
        if info < 24 {
            return Ok(u64::from(info));
        }
        if info == INDEFINITE {
            return Err(CodecError::IndefiniteLengthForbidden);
        }
        let width = argument_width(info)
            .ok_or_else(|| CodecError::invalid_structure("reserved additional info"))?;
        let arg = self
            .take(width)?
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        if arg < width_floor(width) {
            return Err(CodecError::invalid_structure(
                "non-canonical: argument fits a shorter head",
            ));
        }
        Ok(arg)
    }

    fn length(&mut self, info: u8, limit: u64) -> CodecResult<usize> {
        let claimed = self.argument(info)?;
        if claimed > limit {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed: limit,
            });
        }
        usize::try_from(claimed).map_err(|_| CodecError::IntegerOverflow)
    }

    fn item(&mut self, depth: usize) -> CodecResult<Value> {
        if depth > MAX_NESTING {
            return Err(CodecError::invalid_structure("nesting too deep"));
        }

        let initial = self.take(1)?[0];
        let info = initial & 0x1f;
        match Major::of(initial) {
            Major::Unsigned => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            Major::Negative => {
                let n = self.argument(info)?;
                // -1 - n, computed without overflow for n up to i64::MAX.
                i64::try_from(n)
                    .map(|n| Value::Integer(!n))
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            Major::Bytes => Ok(Value::Bytes(self.byte_string(info)?.to_vec())),
            Major::Text => Ok(Value::Text(self.text(info)?.to_owned())),
            Major::Array => {
                let len = self.length(info, MAX_ITEMS)?;
                let mut items = Vec::with_capacity(len.min(self.remaining().len()));
                for _ in 0..len {
                    items.push(self.item(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            Major::Map => self.map(info, depth),
            Major::Tag => self.link(info),
            Major::Simple => simple(info),
        }
    }

    fn byte_string(&mut self, info: u8) -> CodecResult<&'a [u8]> {
        let len = self.length(info, MAX_STRING_LEN)?;
        self.take(len)
    }

    fn text(&mut self, info: u8) -> CodecResult<&'a str> {
        let bytes = self.byte_string(info)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    fn map(&mut self, info: u8, depth: usize) -> CodecResult<Value> {
        let len = self.length(info, MAX_ITEMS)?;
        let mut entries: Vec<(Value, Value)> =
            Vec::with_capacity(len.min(self.remaining().len() / 2));
        let mut previous: Option<&'a str> = None;

        for _ in 0..len {
            let initial = *self.remaining().first().ok_or(CodecError::UnexpectedEof)?;
            if Major::of(initial) != Major::Text {
                return Err(CodecError::invalid_structure("map keys must be text"));
            }
            self.offset += 1;
            let key = self.text(initial & 0x1f)?;

            if let Some(previous) = previous {
                if key_order(previous, key) != Ordering::Less {
                    return Err(CodecError::invalid_structure(
                        "non-canonical: map keys out of order or repeated",
                    ));
                }
            }
            previous = Some(key);

            let value = self.item(depth + 1)?;
            entries.push((Value::Text(key.to_owned()), value));
        }
        Ok(Value::Map(entries))
    }

    fn link(&mut self, info: u8) -> CodecResult<Value> {
        let tag = self.argument(info)?;
        if tag != LINK_TAG {
            return Err(CodecError::unsupported_type(format!("tag {tag}")));
        }
        let initial = self.take(1)?[0];
        if Major::of(initial) != Major::Bytes {
            return Err(CodecError::invalid_structure(
                "tag 42 must wrap a byte string",
            ));
        }
        Ok(Value::Link(self.byte_string(initial & 0x1f)?.to_vec()))
    }
}

fn simple(info: u8) -> CodecResult<Value> {
    match info {
        20 => Ok(Value::Bool(false)),
        21 => Ok(Value::Bool(true)),
        22 => Ok(Value::Null),
        25..=27 => Err(CodecError::FloatForbidden),
        INDEFINITE => Err(CodecError::invalid_structure("unexpected break")),
        other => Err(CodecError::unsupported_type(format!("simple value {other}"))),
    }
}
