//! Fuzz targets for the decode path.
//!
//! Each target must return normally for any input; a panic is a bug.
//! They are plain functions so they can be driven by cargo-fuzz or by the
//! proptest loops below.

use firehose_codec::from_cbor;
use firehose_protocol::{
    decode_frame, extract_blocks, verify_header, ContentId, StreamMessage,
};

/// Fuzz target for frame decoding and translation.
pub fn fuzz_frame_decode(data: &[u8]) {
    if let Ok(frame) = decode_frame(data) {
        if verify_header(&frame.header) {
            let _ = StreamMessage::from_frame(&frame);
        }
    }
}

/// Fuzz target for CAR extraction.
///
/// Any blocks that come back must hash to their CIDs.
pub fn fuzz_car_extract(data: &[u8]) {
    if let Ok(archive) = extract_blocks(data) {
        for (cid, block) in &archive.blocks {
            assert!(cid.verify(block), "unverified block {cid} returned");
        }
        assert!(archive.trailing_bytes <= data.len());
    }
}

/// Fuzz target for binary CIDs.
///
/// A CID that decodes must re-encode to the same bytes and survive the text
/// round trip.
pub fn fuzz_cid_decode(data: &[u8]) {
    if let Ok(cid) = ContentId::decode(data) {
        assert_eq!(cid.to_bytes(), data, "binary CID did not round trip");
        let text = cid.encode();
        assert_eq!(ContentId::parse(&text).ok(), Some(cid));
    }
}

/// Fuzz target for CID text parsing.
pub fn fuzz_cid_parse(data: &[u8]) {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(cid) = ContentId::parse(text) {
            assert_eq!(cid.encode(), text, "text CID did not round trip");
        }
    }
}

/// Fuzz target for raw DAG-CBOR decoding.
pub fn fuzz_cbor_decode(data: &[u8]) {
    let _ = from_cbor(data);
}
