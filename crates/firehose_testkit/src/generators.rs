//! Property-based test generators using proptest.
//!
//! Strategies produce values that satisfy the protocol's invariants, so
//! properties can be stated over valid inputs.

use firehose_protocol::{Codec, ContentId};
use proptest::prelude::*;

use crate::fixtures::commit_frame;

/// Strategy for block contents.
pub fn block_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for a supported content codec.
pub fn codec_strategy() -> impl Strategy<Value = Codec> {
    prop_oneof![Just(Codec::DagCbor), Just(Codec::Raw)]
}

/// Strategy for a block together with the CID computed over it.
pub fn cid_and_block_strategy() -> impl Strategy<Value = (ContentId, Vec<u8>)> {
    (codec_strategy(), block_strategy())
        .prop_map(|(codec, block)| (ContentId::for_block(codec, &block), block))
}

/// Strategy for content identifiers.
pub fn content_id_strategy() -> impl Strategy<Value = ContentId> {
    cid_and_block_strategy().prop_map(|(cid, _)| cid)
}

/// Strategy for `did:plc` repository identifiers.
pub fn did_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("did:plc:[a-z2-7]{24}").expect("Invalid regex")
}

/// Strategy for collection NSIDs.
pub fn collection_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("app.bsky.feed.post".to_string()),
        Just("app.bsky.feed.like".to_string()),
        Just("app.bsky.feed.repost".to_string()),
        Just("app.bsky.graph.follow".to_string()),
        Just("app.bsky.actor.profile".to_string()),
    ]
}

/// Strategy for `(action, path)` operation pairs.
pub fn op_strategy() -> impl Strategy<Value = (String, String)> {
    (
        prop_oneof![Just("create"), Just("update"), Just("delete")],
        collection_strategy(),
        prop::string::string_regex("[a-z2-7]{13}").expect("Invalid regex"),
    )
        .prop_map(|(action, collection, rkey)| (action.to_string(), format!("{collection}/{rkey}")))
}

/// A generated commit frame and what it was built from.
#[derive(Debug, Clone)]
pub struct GeneratedCommit {
    /// Repository identifier.
    pub repo: String,
    /// Sequence number.
    pub seq: i64,
    /// `(action, path)` pairs, in order.
    pub ops: Vec<(String, String)>,
    /// Encoded frame.
    pub bytes: Vec<u8>,
}

/// Strategy for well-formed commit frames with 1 to 8 operations.
pub fn commit_frame_strategy() -> impl Strategy<Value = GeneratedCommit> {
    (
        did_strategy(),
        0i64..i64::from(u32::MAX),
        prop::collection::vec(op_strategy(), 1..8),
    )
        .prop_map(|(repo, seq, ops)| {
            let pairs: Vec<(&str, &str)> = ops
                .iter()
                .map(|(action, path)| (action.as_str(), path.as_str()))
                .collect();
            let bytes = commit_frame(&repo, seq, &pairs);
            GeneratedCommit {
                repo,
                seq,
                ops,
                bytes,
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_protocol::{decode_frame, StreamMessage};

    proptest! {
        #[test]
        fn generated_cids_verify((cid, block) in cid_and_block_strategy()) {
            prop_assert!(cid.verify(&block));
        }

        #[test]
        fn generated_commits_decode(commit in commit_frame_strategy()) {
            let frame = decode_frame(&commit.bytes).unwrap();
            match StreamMessage::from_frame(&frame).unwrap() {
                StreamMessage::Commit(event) => {
                    prop_assert_eq!(event.repo.as_str(), commit.repo.as_str());
                    prop_assert_eq!(event.seq, commit.seq);
                    prop_assert_eq!(event.ops.len(), commit.ops.len());
                    prop_assert!(event.blocks.integrity_failures.is_empty());
                    for (op, (action, path)) in event.ops.iter().zip(&commit.ops) {
                        prop_assert_eq!(op.action.as_str(), action.as_str());
                        prop_assert_eq!(&op.path, path);
                    }
                }
                other => prop_assert!(false, "expected commit, got {:?}", other),
            }
        }
    }
}
