//! Benchmark workloads.

use firehose_codec::Value;
use firehose_protocol::{Codec, ContentId};
use firehose_testkit::{commit_payload, op_value, post_record, CarWriter, FrameBuilder};

/// A `#commit` frame with `ops` creates, each carrying a record of about
/// `text_len` bytes.
pub fn commit_with_ops(ops: usize, text_len: usize) -> Vec<u8> {
    let mut car = CarWriter::new();
    let text = "x".repeat(text_len);
    let op_values = (0..ops)
        .map(|i| {
            let cid = car.add_record(&post_record(&format!("{text}{i}")));
            op_value("create", &format!("app.bsky.feed.post/{i:08}"), Some(&cid))
        })
        .collect();
    FrameBuilder::message("#commit")
        .payload(commit_payload("did:plc:bench", 1, op_values, car.finish()))
        .build()
}

/// A block archive holding `count` raw blocks of `size` bytes.
pub fn archive(count: usize, size: usize) -> Vec<u8> {
    let mut car = CarWriter::new();
    for i in 0..count {
        let block: Vec<u8> = (0..size).map(|j| (i + j) as u8).collect();
        car.add_block(Codec::Raw, block);
    }
    car.finish()
}

/// Deterministic blocks of `size` bytes with their CIDs.
pub fn blocks(count: usize, size: usize) -> Vec<(ContentId, Vec<u8>)> {
    (0..count)
        .map(|i| {
            let block: Vec<u8> = (0..size).map(|j| (i * 31 + j) as u8).collect();
            (ContentId::for_block(Codec::DagCbor, &block), block)
        })
        .collect()
}

/// A payload map shaped like a relay `#identity` message.
pub fn identity_payload() -> Value {
    Value::text_map([
        ("did", Value::from("did:plc:bench")),
        ("handle", Value::from("bench.test")),
        ("seq", Value::Integer(1)),
        ("time", Value::from("2024-11-01T12:00:00.000Z")),
    ])
}
