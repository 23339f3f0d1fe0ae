//! Cid command implementation.

use firehose_protocol::ContentId;
use serde::Serialize;

/// Parsed parts of a CID.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CidInfo {
    /// Canonical text form.
    pub cid: String,
    /// CID version.
    pub version: u64,
    /// Content codec name.
    pub codec: String,
    /// Content codec code.
    pub codec_code: u64,
    /// Multihash function name.
    pub hash: String,
    /// Digest, hex-encoded.
    pub digest: String,
}

/// Parses `text` into its parts.
pub fn inspect(text: &str) -> Result<CidInfo, Box<dyn std::error::Error>> {
    let cid = ContentId::parse(text.trim())?;
    Ok(CidInfo {
        cid: cid.encode(),
        version: cid.version(),
        codec: cid.codec().name().to_string(),
        codec_code: cid.codec().code(),
        hash: cid.hash_code().name().to_string(),
        digest: hex(cid.digest()),
    })
}

/// Runs the cid command.
pub fn run(text: &str) -> Result<(), Box<dyn std::error::Error>> {
    let info = inspect(text)?;
    println!("CID:     {}", info.cid);
    println!("Version: {}", info.version);
    println!("Codec:   {} (0x{:02x})", info.codec, info.codec_code);
    println!("Hash:    {}", info.hash);
    println!("Digest:  {}", info.digest);
    Ok(())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_dag_cbor_cid() {
        let info = inspect("bafyreigbtj4x7ip5legnfznufuopl4sg4knzc2cof6duas4b3q2fy6swua").unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.codec, "dag-cbor");
        assert_eq!(info.codec_code, 0x71);
        assert_eq!(info.hash, "sha2-256");
        assert_eq!(
            info.digest,
            "c19a797fa1fd590cd2e5b42d1cf5f246e29b91684e2f87404b81dc345c7a56a0"
        );
    }

    #[test]
    fn inspect_rejects_garbage() {
        assert!(inspect("not-a-cid").is_err());
    }
}
