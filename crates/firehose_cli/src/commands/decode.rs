//! Decode command implementation.

use firehose_protocol::{
    translate_message, ErrorFrame, FrameDecoder, StreamMessage, OP_ERROR,
};
use serde::Serialize;
use std::path::Path;

use super::cid::hex;

/// Decoded view of one frame.
#[derive(Debug, Serialize)]
pub struct DecodeResult {
    /// Size of the frame in bytes.
    pub size: usize,
    /// Header `op`.
    pub op: i64,
    /// Header `t`, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Error frame body, for `op = -1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Interpreted message, for message frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageInfo>,
}

/// The interpreted body of a message frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageInfo {
    /// A commit.
    Commit {
        /// Repository DID.
        repo: String,
        /// Sequence number.
        seq: i64,
        /// Repository revision.
        #[serde(skip_serializing_if = "Option::is_none")]
        rev: Option<String>,
        /// Record operations.
        ops: Vec<OpInfo>,
        /// Archive roots.
        roots: Vec<String>,
        /// Number of verified blocks.
        blocks: usize,
        /// Blocks dropped because their bytes did not match their CID.
        integrity_failures: Vec<String>,
        /// Bytes after the last readable section.
        trailing_bytes: usize,
    },
    /// An identity change.
    Identity {
        /// Account DID.
        did: String,
        /// Sequence number.
        seq: i64,
        /// Handle, when sent.
        #[serde(skip_serializing_if = "Option::is_none")]
        handle: Option<String>,
    },
    /// An account status change.
    Account {
        /// Account DID.
        did: String,
        /// Sequence number.
        seq: i64,
        /// Whether the account is active.
        active: bool,
        /// Status, when inactive.
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    /// An informational message.
    Info {
        /// Info name.
        name: String,
        /// Detail text.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A kind this tool does not interpret.
    Unknown {
        /// Header `t`.
        kind: String,
    },
}

/// One operation of a commit.
#[derive(Debug, Serialize)]
pub struct OpInfo {
    /// `create`, `update` or `delete`.
    pub action: String,
    /// Record path.
    pub path: String,
    /// Record CID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Whether the archive carried the record block.
    pub record_present: bool,
    /// Record block, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
}

/// Decodes `bytes` into a printable view.
pub fn inspect(bytes: &[u8]) -> Result<DecodeResult, Box<dyn std::error::Error>> {
    let frame = FrameDecoder::new().decode(bytes)?;
    let mut result = DecodeResult {
        size: bytes.len(),
        op: frame.header.op,
        kind: frame.header.kind.clone(),
        error: None,
        message: None,
    };

    if frame.header.op == OP_ERROR {
        let body = ErrorFrame::from_payload(&frame.payload)?;
        result.error = Some(match body.message {
            Some(message) => format!("{}: {}", body.error, message),
            None => body.error,
        });
        return Ok(result);
    }
    if !FrameDecoder::verify_header(&frame.header) {
        return Ok(result);
    }

    result.message = Some(match translate_message(&frame)? {
        StreamMessage::Commit(commit) => {
            let ops = commit
                .op_events()
                .into_iter()
                .map(|op| OpInfo {
                    action: op.action.to_string(),
                    path: op.path,
                    cid: op.identifier.map(|cid| cid.encode()),
                    record_present: op.record.is_some(),
                    record: op.record.as_deref().map(hex),
                })
                .collect();
            MessageInfo::Commit {
                repo: commit.repo.to_string(),
                seq: commit.seq,
                rev: commit.rev,
                ops,
                roots: commit.blocks.roots.iter().map(|cid| cid.encode()).collect(),
                blocks: commit.blocks.len(),
                integrity_failures: commit
                    .blocks
                    .integrity_failures
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                trailing_bytes: commit.blocks.trailing_bytes,
            }
        }
        StreamMessage::Identity(identity) => MessageInfo::Identity {
            did: identity.did.to_string(),
            seq: identity.seq,
            handle: identity.handle,
        },
        StreamMessage::Account(account) => MessageInfo::Account {
            did: account.did.to_string(),
            seq: account.seq,
            active: account.active,
            status: account.status,
        },
        StreamMessage::Info(info) => MessageInfo::Info {
            name: info.name,
            message: info.message,
        },
        StreamMessage::Unknown(kind) => MessageInfo::Unknown { kind },
    });
    Ok(result)
}

/// Runs the decode command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    let result = inspect(&bytes)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &DecodeResult) {
    println!("Frame: {} bytes", result.size);
    println!("Header: op={} t={}", result.op, result.kind.as_deref().unwrap_or("-"));

    if let Some(error) = &result.error {
        println!("Error frame: {error}");
    }

    match &result.message {
        None => {}
        Some(MessageInfo::Commit {
            repo,
            seq,
            rev,
            ops,
            roots,
            blocks,
            integrity_failures,
            trailing_bytes,
        }) => {
            println!("Commit: {repo} seq={seq} rev={}", rev.as_deref().unwrap_or("-"));
            println!("Roots: {}", roots.join(", "));
            println!("Blocks: {blocks} verified");
            for op in ops {
                println!(
                    "  {:<6} {} {} {}",
                    op.action.to_uppercase(),
                    op.path,
                    op.cid.as_deref().unwrap_or("-"),
                    if op.record_present { "record" } else { "no record" }
                );
            }
            for failure in integrity_failures {
                println!("  FAILED {failure}");
            }
            if *trailing_bytes > 0 {
                println!("Trailing: {trailing_bytes} bytes");
            }
        }
        Some(MessageInfo::Identity { did, seq, handle }) => {
            println!("Identity: {did} seq={seq} handle={}", handle.as_deref().unwrap_or("-"));
        }
        Some(MessageInfo::Account {
            did,
            seq,
            active,
            status,
        }) => {
            println!(
                "Account: {did} seq={seq} active={active} status={}",
                status.as_deref().unwrap_or("-")
            );
        }
        Some(MessageInfo::Info { name, message }) => {
            println!("Info: {name} {}", message.as_deref().unwrap_or(""));
        }
        Some(MessageInfo::Unknown { kind }) => {
            println!("Unknown message kind {kind}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_testkit::{error_frame, identity_frame, malformed_frame, sample_commit_frame, FrameFile};

    #[test]
    fn decodes_sample_commit() {
        let sample = sample_commit_frame();
        let result = inspect(&sample.bytes).unwrap();
        assert_eq!(result.op, 1);
        assert_eq!(result.kind.as_deref(), Some("#commit"));

        match result.message {
            Some(MessageInfo::Commit {
                ops,
                roots,
                blocks,
                integrity_failures,
                ..
            }) => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].action, "create");
                assert_eq!(ops[0].cid.as_deref(), Some(sample.cid.encode().as_str()));
                assert!(ops[0].record_present);
                assert_eq!(roots, vec![sample.cid.encode()]);
                assert_eq!(blocks, 1);
                assert!(integrity_failures.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn decodes_error_frame() {
        let result = inspect(&error_frame("FutureCursor", "Cursor in the future.")).unwrap();
        assert_eq!(result.op, -1);
        assert_eq!(result.error.as_deref(), Some("FutureCursor: Cursor in the future."));
        assert!(result.message.is_none());
    }

    #[test]
    fn json_output_is_tagged() {
        let result = inspect(&identity_frame("did:plc:abc", 3, "alice.test")).unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["message"]["type"], "identity");
        assert_eq!(json["message"]["handle"], "alice.test");
    }

    #[test]
    fn run_reads_frame_file() {
        let file = FrameFile::write(&sample_commit_frame().bytes);
        run(file.path(), "json").unwrap();

        let bad = FrameFile::write(&malformed_frame());
        assert!(run(bad.path(), "text").is_err());
    }
}
