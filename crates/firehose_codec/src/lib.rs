//! DAG-CBOR for the repository firehose.
//!
//! Frame headers, frame payloads, commit records and CAR headers all use the
//! IPLD DAG-CBOR profile. Encoding is deterministic and decoding is strict:
//! map keys are text sorted by [`key_order`], every head is as short as
//! possible, and the only tag is 42 (a content link). Floats and
//! indefinite lengths are rejected.
//!
//! ```
//! use firehose_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let header = Value::text_map([("op", Value::Integer(1)), ("t", Value::from("#commit"))]);
//! let bytes = to_canonical_cbor(&header).unwrap();
//! assert_eq!(from_cbor(&bytes).unwrap().get("op"), Some(&Value::Integer(1)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod head;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder, LINK_TAG};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use value::{key_order, Value};
