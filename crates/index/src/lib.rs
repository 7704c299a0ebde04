//! # Arabica Index
//!
//! Single source of truth for everything the indexer has ingested.
//!
//! ```text
//! Firehose consumer ──┐
//!                     ├──> RecordIndex ──> suggestion engine (read)
//! Backfill ───────────┘          └──────> feed cache (read)
//! ```
//!
//! [`RecordIndex`] is the capability every other crate programs against.
//! [`SqliteIndex`] is the durable store; [`MemoryIndex`] keeps the same
//! semantics in memory and doubles as the test fake.

mod error;
mod memory;
mod merge;
mod sqlite;
mod stats;

pub use error::{IndexError, Result};
pub use memory::MemoryIndex;
pub use merge::UpsertOutcome;
pub use sqlite::SqliteIndex;
pub use stats::IndexStats;

use arabica_protocol::{Collection, Did, IndexedRecord, ProfileCacheEntry, RecordWrite};
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait RecordIndex: Send + Sync {
    /// Insert or replace a record. The payload is decoded for its collection
    /// first; a payload that does not decode is rejected with
    /// [`IndexError::Malformed`] and nothing is written. Any decodable write,
    /// even a stale one, records the owning identity as known.
    async fn upsert(&self, write: RecordWrite) -> Result<UpsertOutcome>;

    /// Remove a record unconditionally and leave a tombstone at `sequence`
    /// (or the stored row's sequence, whichever is higher). Returns whether a
    /// live row was removed.
    async fn delete(
        &self,
        did: &Did,
        collection: Collection,
        rkey: &str,
        sequence: u64,
    ) -> Result<bool>;

    async fn list_by_collection(&self, collection: Collection) -> Result<Vec<IndexedRecord>>;

    /// Newest first by sequence; ties broken by indexed wall clock.
    async fn recent_across_all(&self, limit: usize) -> Result<Vec<IndexedRecord>>;

    async fn known_identities(&self) -> Result<BTreeSet<Did>>;

    async fn is_known(&self, did: &Did) -> Result<bool>;

    /// Cached profile, or `None` when absent or expired.
    async fn get_profile(&self, did: &Did) -> Result<Option<ProfileCacheEntry>>;

    async fn put_profile(&self, entry: ProfileCacheEntry) -> Result<()>;

    /// Drop expired profile rows. Returns how many were removed.
    async fn prune_profiles(&self, now_ms: u64) -> Result<usize>;

    async fn save_cursor(&self, sequence: u64) -> Result<()>;

    /// Last saved stream position; 0 when nothing was ever saved.
    async fn load_cursor(&self) -> Result<u64>;

    /// Remove every record and tombstone of an identity. The identity stays known.
    async fn purge_identity(&self, did: &Did) -> Result<usize>;

    async fn stats(&self) -> Result<IndexStats>;
}
