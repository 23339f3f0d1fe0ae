//! Content identifier test vectors.
//!
//! Known-good pairs of block bytes and CID text, shareable as JSON with
//! other firehose implementations.

use serde::{Deserialize, Serialize};

/// A CID test vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Codec name (`dag-cbor` or `raw`).
    pub codec: String,
    /// Block bytes (hex-encoded).
    pub block_hex: String,
    /// Binary CID (hex-encoded).
    pub cid_hex: String,
    /// Canonical text form.
    pub cid_text: String,
}

/// Vectors computed with an independent SHA-256 and base32 implementation.
pub fn cid_vectors() -> Vec<CidVector> {
    vec![
        CidVector {
            id: "dag_cbor_empty_map".into(),
            description: "DAG-CBOR empty map".into(),
            codec: "dag-cbor".into(),
            block_hex: "a0".into(),
            cid_hex: "01711220c19a797fa1fd590cd2e5b42d1cf5f246e29b91684e2f87404b81dc345c7a56a0"
                .into(),
            cid_text: "bafyreigbtj4x7ip5legnfznufuopl4sg4knzc2cof6duas4b3q2fy6swua".into(),
        },
        CidVector {
            id: "raw_hello_world".into(),
            description: "raw block 'hello world'".into(),
            codec: "raw".into(),
            block_hex: "68656c6c6f20776f726c64".into(),
            cid_hex: "01551220b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
                .into(),
            cid_text: "bafkreifzjut3te2nhyekklss27nh3k72ysco7y32koao5eei66wof36n5e".into(),
        },
        CidVector {
            id: "raw_empty".into(),
            description: "raw empty block".into(),
            codec: "raw".into(),
            block_hex: "".into(),
            cid_hex: "01551220e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .into(),
            cid_text: "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku".into(),
        },
    ]
}

/// All vectors as pretty-printed JSON.
pub fn cid_vectors_json() -> String {
    serde_json::to_string_pretty(&cid_vectors()).expect("Failed to serialize vectors")
}

/// Encodes bytes as lowercase hexadecimal.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decodes hexadecimal string to bytes.
pub fn hex_decode(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("Invalid hex"))
        .collect()
}
