use crate::{Collection, Did, ProtocolError, RecordBody, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_RKEY_LEN: usize = 512;

/// One ingested record as stored by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub did: Did,
    pub collection: Collection,
    pub rkey: String,
    /// Content hash (CID) supplied by the source.
    pub cid: String,
    pub payload: Value,
    /// Stream position the record was last written at. Backfilled rows carry 0.
    pub sequence: u64,
    pub indexed_at_ms: u64,
}

impl IndexedRecord {
    #[must_use]
    pub fn uri(&self) -> String {
        at_uri(&self.did, self.collection, &self.rkey)
    }

    pub fn body(&self) -> Result<RecordBody> {
        RecordBody::decode(self.collection, &self.payload)
    }
}

/// Write request accepted by the index `upsert`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub did: Did,
    pub collection: Collection,
    pub rkey: String,
    pub cid: String,
    pub payload: Value,
    pub sequence: u64,
}

impl RecordWrite {
    #[must_use]
    pub fn into_record(self, indexed_at_ms: u64) -> IndexedRecord {
        IndexedRecord {
            did: self.did,
            collection: self.collection,
            rkey: self.rkey,
            cid: self.cid,
            payload: self.payload,
            sequence: self.sequence,
            indexed_at_ms,
        }
    }
}

/// Record keys: 1..=512 chars of `[A-Za-z0-9._:~-]`, never `.` or `..`.
pub fn validate_rkey(rkey: &str) -> Result<()> {
    let valid = !rkey.is_empty()
        && rkey.len() <= MAX_RKEY_LEN
        && rkey != "."
        && rkey != ".."
        && rkey
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '~' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidRecordKey(rkey.to_string()))
    }
}

#[must_use]
pub fn at_uri(did: &Did, collection: Collection, rkey: &str) -> String {
    format!("at://{}/{}/{}", did, collection.nsid(), rkey)
}

/// Splits `at://<did>/<nsid>/<rkey>`. The collection is returned raw since
/// references may point outside the recognized namespace.
#[must_use]
pub fn parse_at_uri(uri: &str) -> Option<(Did, String, String)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let did = Did::parse(parts.next()?).ok()?;
    let nsid = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    Some((did, nsid.to_string(), rkey.to_string()))
}
