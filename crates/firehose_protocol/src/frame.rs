//! Firehose frames: a DAG-CBOR header followed by a DAG-CBOR payload.

use crate::error::{ProtocolError, ProtocolResult};
use firehose_codec::{CanonicalDecoder, Value};

/// Header `op` of a regular message frame.
pub const OP_MESSAGE: i64 = 1;

/// Header `op` of an error frame.
pub const OP_ERROR: i64 = -1;

/// Default upper bound on a single binary message.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation code: `1` for messages, `-1` for errors.
    pub op: i64,
    /// Message type (`t`), e.g. `#commit`. Absent on error frames.
    pub kind: Option<String>,
}

impl FrameHeader {
    /// Interpret a decoded header value.
    pub fn from_value(value: &Value) -> ProtocolResult<Self> {
        if value.as_map().is_none() {
            return Err(ProtocolError::malformed("frame header is not a map"));
        }
        let op = value
            .get("op")
            .ok_or_else(|| ProtocolError::missing_field("op"))?
            .as_integer()
            .ok_or_else(|| ProtocolError::invalid_field("op", "integer"))?;
        let kind = value.get("t").and_then(Value::as_text).map(str::to_string);

        Ok(Self { op, kind })
    }

    /// True for regular message frames.
    pub fn is_message(&self) -> bool {
        self.op == OP_MESSAGE
    }
}

/// A header/payload pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Frame payload (always a map).
    pub payload: Value,
}

/// Body of an error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Error name, e.g. `FutureCursor`.
    pub error: String,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

impl ErrorFrame {
    /// Interpret the payload of an `op = -1` frame.
    pub fn from_payload(payload: &Value) -> ProtocolResult<Self> {
        let error = payload
            .get("error")
            .and_then(Value::as_text)
            .ok_or_else(|| ProtocolError::missing_field("error"))?
            .to_string();
        let message = payload
            .get("message")
            .and_then(Value::as_text)
            .map(str::to_string);
        Ok(Self { error, message })
    }
}

/// Splits binary messages into header and payload.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder rejecting messages larger than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one binary message.
    ///
    /// Exactly two values are read; anything after the payload is ignored.
    ///
    /// # Errors
    ///
    /// `MalformedCbor` when either value fails to parse, is missing, or is
    /// not a map; `MissingField` when the header has no `op`.
    pub fn decode(&self, bytes: &[u8]) -> ProtocolResult<Frame> {
        if bytes.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }

        let mut decoder = CanonicalDecoder::new(bytes);
        let header = decoder.decode()?;
        if decoder.is_empty() {
            return Err(ProtocolError::malformed("frame has a header but no payload"));
        }
        let payload = decoder.decode()?;

        let header = FrameHeader::from_value(&header)?;
        if payload.as_map().is_none() {
            return Err(ProtocolError::malformed("frame payload is not a map"));
        }

        Ok(Frame { header, payload })
    }

    /// Whether a frame should be interpreted at all.
    ///
    /// Error and unknown-op frames return `false`; skipping them is the
    /// expected outcome, not a failure.
    pub fn verify_header(header: &FrameHeader) -> bool {
        header.is_message()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a frame with the default decoder.
pub fn decode_frame(bytes: &[u8]) -> ProtocolResult<Frame> {
    FrameDecoder::new().decode(bytes)
}

/// Free-function form of [`FrameDecoder::verify_header`].
pub fn verify_header(header: &FrameHeader) -> bool {
    FrameDecoder::verify_header(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_codec::CanonicalEncoder;

    fn encode(values: &[Value]) -> Vec<u8> {
        let mut encoder = CanonicalEncoder::new();
        for value in values {
            encoder.encode(value).unwrap();
        }
        encoder.into_bytes()
    }

    fn commit_header() -> Value {
        Value::text_map([("op", Value::Integer(1)), ("t", Value::from("#commit"))])
    }

    #[test]
    fn decodes_header_and_payload() {
        let payload = Value::text_map([("repo", Value::from("did:plc:abc"))]);
        let frame = decode_frame(&encode(&[commit_header(), payload.clone()])).unwrap();

        assert_eq!(frame.header.op, OP_MESSAGE);
        assert_eq!(frame.header.kind.as_deref(), Some("#commit"));
        assert!(verify_header(&frame.header));
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn error_frame_fails_verification() {
        let header = Value::text_map([("op", Value::Integer(OP_ERROR))]);
        let payload = Value::text_map([
            ("error", Value::from("FutureCursor")),
            ("message", Value::from("Cursor in the future.")),
        ]);
        let frame = decode_frame(&encode(&[header, payload])).unwrap();

        assert!(!verify_header(&frame.header));
        let body = ErrorFrame::from_payload(&frame.payload).unwrap();
        assert_eq!(body.error, "FutureCursor");
        assert_eq!(body.message.as_deref(), Some("Cursor in the future."));
    }

    #[test]
    fn trailing_values_are_ignored() {
        let payload = Value::text_map([("seq", Value::Integer(7))]);
        let bytes = encode(&[commit_header(), payload.clone(), Value::from("future")]);
        assert_eq!(decode_frame(&bytes).unwrap().payload, payload);
    }

    #[test]
    fn single_value_is_malformed() {
        let bytes = encode(&[commit_header()]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::MalformedCbor { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_frame(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::MalformedCbor { .. })
        ));
        assert!(matches!(
            decode_frame(&[]),
            Err(ProtocolError::MalformedCbor { .. })
        ));
    }

    #[test]
    fn header_without_op_is_missing_field() {
        let header = Value::text_map([("t", Value::from("#commit"))]);
        let bytes = encode(&[header, Value::Map(Vec::new())]);
        assert_eq!(
            decode_frame(&bytes),
            Err(ProtocolError::missing_field("op"))
        );
    }

    #[test]
    fn non_map_payload_is_malformed() {
        let bytes = encode(&[commit_header(), Value::Integer(3)]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::MalformedCbor { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let bytes = encode(&[commit_header(), Value::Map(Vec::new())]);
        let decoder = FrameDecoder::with_max_frame_size(4);
        assert!(matches!(
            decoder.decode(&bytes),
            Err(ProtocolError::FrameTooLarge { max: 4, .. })
        ));
    }
}
