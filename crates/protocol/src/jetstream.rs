//! Jetstream frame decoding.
//!
//! Jetstream re-encodes the relay firehose as one JSON object per websocket
//! text frame. `time_us` is the stream position: it is what the consumer
//! persists as its cursor and hands back on reconnect.

use crate::{Did, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub did: Did,
    pub sequence: u64,
    /// Raw collection NSID; may be outside the recognized namespace.
    pub collection: String,
    pub rkey: String,
    pub operation: CommitOperation,
    pub cid: Option<String>,
    pub record: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Commit(CommitEvent),
    /// `identity` / `account` frames, or commit kinds we do not act on.
    /// Carried only so the cursor can move past them.
    Other { sequence: u64, kind: String },
}

impl StreamEvent {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        match self {
            StreamEvent::Commit(commit) => commit.sequence,
            StreamEvent::Other { sequence, .. } => *sequence,
        }
    }
}

#[derive(Deserialize)]
struct WireFrame {
    did: Did,
    time_us: u64,
    kind: String,
    #[serde(default)]
    commit: Option<WireCommit>,
}

#[derive(Deserialize)]
struct WireCommit {
    operation: String,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    cid: Option<String>,
}

pub fn decode_frame(text: &str) -> Result<StreamEvent> {
    let frame: WireFrame = serde_json::from_str(text)?;
    if frame.kind != "commit" {
        return Ok(StreamEvent::Other {
            sequence: frame.time_us,
            kind: frame.kind,
        });
    }
    let Some(commit) = frame.commit else {
        return Ok(StreamEvent::Other {
            sequence: frame.time_us,
            kind: "commit-without-body".to_string(),
        });
    };

    let operation = match commit.operation.as_str() {
        "create" => CommitOperation::Create,
        "update" => CommitOperation::Update,
        "delete" => CommitOperation::Delete,
        other => {
            return Ok(StreamEvent::Other {
                sequence: frame.time_us,
                kind: format!("commit:{other}"),
            })
        }
    };

    Ok(StreamEvent::Commit(CommitEvent {
        did: frame.did,
        sequence: frame.time_us,
        collection: commit.collection,
        rkey: commit.rkey,
        operation,
        cid: commit.cid,
        record: commit.record,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_create_commit() {
        let text = json!({
            "did": "did:plc:alice",
            "time_us": 1_725_911_162_329_308u64,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vutsw2b",
                "operation": "create",
                "collection": "social.arabica.alpha.bean",
                "rkey": "3l3qo2vuowo2b",
                "record": { "$type": "social.arabica.alpha.bean", "name": "Gesha" },
                "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
            }
        })
        .to_string();

        let StreamEvent::Commit(commit) = decode_frame(&text).unwrap() else {
            panic!("expected commit");
        };
        assert_eq!(commit.did.as_str(), "did:plc:alice");
        assert_eq!(commit.sequence, 1_725_911_162_329_308);
        assert_eq!(commit.operation, CommitOperation::Create);
        assert_eq!(commit.collection, "social.arabica.alpha.bean");
        assert_eq!(commit.record.unwrap()["name"], "Gesha");
    }

    #[test]
    fn delete_has_no_record() {
        let text = r#"{"did":"did:plc:alice","time_us":7,"kind":"commit","commit":{"rev":"x","operation":"delete","collection":"social.arabica.alpha.roaster","rkey":"abc"}}"#;
        let StreamEvent::Commit(commit) = decode_frame(text).unwrap() else {
            panic!("expected commit");
        };
        assert_eq!(commit.operation, CommitOperation::Delete);
        assert_eq!(commit.record, None);
        assert_eq!(commit.cid, None);
    }

    #[test]
    fn identity_frames_only_carry_position() {
        let text = r#"{"did":"did:plc:alice","time_us":99,"kind":"identity","identity":{"did":"did:plc:alice","handle":"alice.test","seq":1,"time":"2024-09-09T19:46:02.102Z"}}"#;
        let event = decode_frame(text).unwrap();
        assert_eq!(event.sequence(), 99);
        assert!(matches!(event, StreamEvent::Other { ref kind, .. } if kind == "identity"));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_frame("{not json").is_err());
        assert!(decode_frame(r#"{"did":"bad","time_us":1,"kind":"commit"}"#).is_err());
    }
}
