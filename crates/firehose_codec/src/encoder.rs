//! DAG-CBOR encoder.

use crate::decoder::LINK_TAG;
use crate::error::{CodecError, CodecResult};
use crate::head::{write_head, Major};
use crate::value::{key_order, Value};

/// Encode `value` as DAG-CBOR.
///
/// Map entries are written in key order whatever order the value holds
/// them in, so any map built by hand encodes canonically.
///
/// # Errors
///
/// `EncodingFailed` for a map with a non-text key or a repeated key.
pub fn to_canonical_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = CanonicalEncoder::new();
    encoder.encode(value)?;
    Ok(encoder.into_bytes())
}

/// Writes DAG-CBOR items into a growing buffer.
///
/// Successive calls append, which is how a frame's header and payload end
/// up back to back in one message.
#[derive(Debug, Default)]
pub struct CanonicalEncoder {
    out: Vec<u8>,
}

impl CanonicalEncoder {
    /// An empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one item.
    pub fn encode(&mut self, value: &Value) -> CodecResult<()> {
        match value {
            Value::Null => self.out.push(0xf6),
            Value::Bool(false) => self.out.push(0xf4),
            Value::Bool(true) => self.out.push(0xf5),
            #[allow(clippy::cast_sign_loss)]
            Value::Integer(n) if *n >= 0 => write_head(&mut self.out, Major::Unsigned, *n as u64),
            #[allow(clippy::cast_sign_loss)]
            Value::Integer(n) => write_head(&mut self.out, Major::Negative, !*n as u64),
            Value::Bytes(bytes) => self.string(Major::Bytes, bytes),
            Value::Text(text) => self.string(Major::Text, text.as_bytes()),
            Value::Array(items) => {
                write_head(&mut self.out, Major::Array, items.len() as u64);
                items.iter().try_for_each(|item| self.encode(item))?;
            }
            Value::Map(entries) => self.map(entries)?,
            Value::Link(bytes) => {
                write_head(&mut self.out, Major::Tag, LINK_TAG);
                self.string(Major::Bytes, bytes);
            }
        }
        Ok(())
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }

    /// Finishes encoding.
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    fn string(&mut self, major: Major, bytes: &[u8]) {
        write_head(&mut self.out, major, bytes.len() as u64);
        self.out.extend_from_slice(bytes);
    }

    fn map(&mut self, entries: &[(Value, Value)]) -> CodecResult<()> {
        let mut keyed = entries
            .iter()
            .map(|(key, value)| match key {
                Value::Text(text) => Ok((text.as_str(), value)),
                other => Err(CodecError::encoding_failed(format!(
                    "map keys must be text, found {}",
                    other.kind()
                ))),
            })
            .collect::<CodecResult<Vec<_>>>()?;
        keyed.sort_by(|a, b| key_order(a.0, b.0));
        if let Some(pair) = keyed.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(CodecError::encoding_failed(format!(
                "duplicate map key {:?}",
                pair[0].0
            )));
        }

        write_head(&mut self.out, Major::Map, keyed.len() as u64);
        for (key, value) in keyed {
            self.string(Major::Text, key.as_bytes());
            self.encode(value)?;
        }
        Ok(())
    }
}
