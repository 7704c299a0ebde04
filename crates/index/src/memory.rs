use crate::merge::{resolve_upsert, tombstone_sequence, Existing, UpsertOutcome};
use crate::{IndexError, IndexStats, RecordIndex, Result};
use arabica_protocol::{
    unix_ms_now, Collection, Did, IndexedRecord, ProfileCacheEntry, RecordBody, RecordWrite,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type Key = (Did, Collection, String);

#[derive(Default)]
struct State {
    records: HashMap<Key, IndexedRecord>,
    tombstones: HashMap<Key, u64>,
    known: BTreeSet<Did>,
    profiles: HashMap<Did, ProfileCacheEntry>,
    cursor: u64,
}

/// In-process index with the same ordering and tombstone rules as
/// [`crate::SqliteIndex`]. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`IndexError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IndexError::unavailable(op, "storage offline"));
        }
        Ok(())
    }

    fn read(&self, op: &str) -> Result<RwLockReadGuard<'_, State>> {
        self.check(op)?;
        self.state
            .read()
            .map_err(|_| IndexError::unavailable(op, "state lock poisoned"))
    }

    fn write(&self, op: &str) -> Result<RwLockWriteGuard<'_, State>> {
        self.check(op)?;
        self.state
            .write()
            .map_err(|_| IndexError::unavailable(op, "state lock poisoned"))
    }
}

fn sort_oldest_first(records: &mut [IndexedRecord]) {
    records.sort_by(|a, b| {
        a.sequence
            .cmp(&b.sequence)
            .then(a.indexed_at_ms.cmp(&b.indexed_at_ms))
            .then_with(|| a.did.cmp(&b.did))
            .then_with(|| a.rkey.cmp(&b.rkey))
    });
}

#[async_trait]
impl RecordIndex for MemoryIndex {
    async fn upsert(&self, write: RecordWrite) -> Result<UpsertOutcome> {
        RecordBody::decode(write.collection, &write.payload)?;
        let mut state = self.write("upsert")?;
        state.known.insert(write.did.clone());

        let key = (write.did.clone(), write.collection, write.rkey.clone());
        let existing = match (state.records.get(&key), state.tombstones.get(&key)) {
            (Some(row), _) => Existing::Row {
                sequence: row.sequence,
                cid: &row.cid,
            },
            (None, Some(&sequence)) => Existing::Tombstone { sequence },
            (None, None) => Existing::Absent,
        };
        let outcome = resolve_upsert(existing, write.sequence, &write.cid);
        if outcome.wrote() {
            state.tombstones.remove(&key);
            state.records.insert(key, write.into_record(unix_ms_now()));
        }
        Ok(outcome)
    }

    async fn delete(
        &self,
        did: &Did,
        collection: Collection,
        rkey: &str,
        sequence: u64,
    ) -> Result<bool> {
        let mut state = self.write("delete")?;
        let key = (did.clone(), collection, rkey.to_string());
        let removed = state.records.remove(&key);
        let prior = state.tombstones.get(&key).copied();
        let tomb = tombstone_sequence(sequence, removed.as_ref().map(|r| r.sequence), prior);
        state.tombstones.insert(key, tomb);
        Ok(removed.is_some())
    }

    async fn list_by_collection(&self, collection: Collection) -> Result<Vec<IndexedRecord>> {
        let state = self.read("list_by_collection")?;
        let mut out: Vec<IndexedRecord> = state
            .records
            .values()
            .filter(|r| r.collection == collection)
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    async fn recent_across_all(&self, limit: usize) -> Result<Vec<IndexedRecord>> {
        let state = self.read("recent_across_all")?;
        let mut out: Vec<IndexedRecord> = state.records.values().cloned().collect();
        sort_oldest_first(&mut out);
        out.reverse();
        out.truncate(limit);
        Ok(out)
    }

    async fn known_identities(&self) -> Result<BTreeSet<Did>> {
        Ok(self.read("known_identities")?.known.clone())
    }

    async fn is_known(&self, did: &Did) -> Result<bool> {
        Ok(self.read("is_known")?.known.contains(did))
    }

    async fn get_profile(&self, did: &Did) -> Result<Option<ProfileCacheEntry>> {
        let state = self.read("get_profile")?;
        let now = unix_ms_now();
        Ok(state
            .profiles
            .get(did)
            .filter(|entry| entry.is_fresh(now))
            .cloned())
    }

    async fn put_profile(&self, entry: ProfileCacheEntry) -> Result<()> {
        let mut state = self.write("put_profile")?;
        state.profiles.insert(entry.profile.did.clone(), entry);
        Ok(())
    }

    async fn prune_profiles(&self, now_ms: u64) -> Result<usize> {
        let mut state = self.write("prune_profiles")?;
        let before = state.profiles.len();
        state.profiles.retain(|_, entry| entry.is_fresh(now_ms));
        Ok(before - state.profiles.len())
    }

    async fn save_cursor(&self, sequence: u64) -> Result<()> {
        self.write("save_cursor")?.cursor = sequence;
        Ok(())
    }

    async fn load_cursor(&self) -> Result<u64> {
        Ok(self.read("load_cursor")?.cursor)
    }

    async fn purge_identity(&self, did: &Did) -> Result<usize> {
        let mut state = self.write("purge_identity")?;
        let before = state.records.len();
        state.records.retain(|(owner, _, _), _| owner != did);
        state.tombstones.retain(|(owner, _, _), _| owner != did);
        Ok(before - state.records.len())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = self.read("stats")?;
        let mut stats = IndexStats {
            known_identities: state.known.len(),
            ..IndexStats::default()
        };
        for record in state.records.values() {
            stats.add_record(record.collection);
        }
        Ok(stats)
    }
}
