//! Write-ordering rules shared by every index backend.
//!
//! Per (identity, collection, rkey) the highest sequence wins. Deletes leave a
//! tombstone at the highest sequence seen for the key, so a replayed older
//! create cannot bring a deleted record back.

use serde::Serialize;

/// Effect of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same sequence and content hash as the stored row.
    Unchanged,
    /// Older than the stored row or the tombstone; nothing written.
    Stale,
}

impl UpsertOutcome {
    #[must_use]
    pub fn wrote(self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

/// Stored state of the key an upsert targets.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Existing<'a> {
    Row { sequence: u64, cid: &'a str },
    Tombstone { sequence: u64 },
    Absent,
}

pub(crate) fn resolve_upsert(existing: Existing<'_>, sequence: u64, cid: &str) -> UpsertOutcome {
    match existing {
        Existing::Row {
            sequence: stored, ..
        } if sequence < stored => UpsertOutcome::Stale,
        Existing::Row {
            sequence: stored,
            cid: stored_cid,
        } if sequence == stored && cid == stored_cid => UpsertOutcome::Unchanged,
        Existing::Row { .. } => UpsertOutcome::Updated,
        Existing::Tombstone { sequence: deleted } if sequence <= deleted => UpsertOutcome::Stale,
        Existing::Tombstone { .. } | Existing::Absent => UpsertOutcome::Inserted,
    }
}

/// Sequence a tombstone should carry after a delete.
pub(crate) fn tombstone_sequence(
    delete_sequence: u64,
    row_sequence: Option<u64>,
    prior_tombstone: Option<u64>,
) -> u64 {
    delete_sequence
        .max(row_sequence.unwrap_or(0))
        .max(prior_tombstone.unwrap_or(0))
}
