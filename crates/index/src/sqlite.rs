//! SQLite-backed index.
//!
//! ## Tables
//!
//! - `records` - live rows keyed by (did, collection, rkey)
//! - `tombstones` - highest deleted sequence per key
//! - `known_identities` - every DID ever observed, never pruned
//! - `profiles` - profile cache with per-row TTL
//! - `stream_cursor` - single-row resume position
//!
//! Writes go through one connection behind a mutex. A file-backed index
//! also opens a second, query-only connection for reads; under WAL it sees
//! every committed write without waiting for the writer. Every call runs on
//! the blocking pool.

use crate::merge::{resolve_upsert, tombstone_sequence, Existing, UpsertOutcome};
use crate::{IndexError, IndexStats, RecordIndex, Result};
use arabica_protocol::{
    unix_ms_now, Collection, Did, IndexedRecord, Profile, ProfileCacheEntry, RecordBody,
    RecordWrite,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS records (
    did            TEXT    NOT NULL,
    collection     TEXT    NOT NULL,
    rkey           TEXT    NOT NULL,
    cid            TEXT    NOT NULL,
    payload        TEXT    NOT NULL,
    sequence       INTEGER NOT NULL,
    indexed_at_ms  INTEGER NOT NULL,
    PRIMARY KEY (did, collection, rkey)
);
CREATE INDEX IF NOT EXISTS idx_records_collection ON records (collection, sequence);
CREATE INDEX IF NOT EXISTS idx_records_recent ON records (sequence DESC, indexed_at_ms DESC);

CREATE TABLE IF NOT EXISTS tombstones (
    did         TEXT    NOT NULL,
    collection  TEXT    NOT NULL,
    rkey        TEXT    NOT NULL,
    sequence    INTEGER NOT NULL,
    PRIMARY KEY (did, collection, rkey)
);

CREATE TABLE IF NOT EXISTS known_identities (
    did            TEXT    PRIMARY KEY,
    first_seen_ms  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS profiles (
    did            TEXT    PRIMARY KEY,
    handle         TEXT,
    display_name   TEXT,
    avatar         TEXT,
    fetched_at_ms  INTEGER NOT NULL,
    ttl_ms         INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_cursor (
    id        INTEGER PRIMARY KEY CHECK (id = 1),
    sequence  INTEGER NOT NULL
);
";

const RECORD_COLUMNS: &str = "did, collection, rkey, cid, payload, sequence, indexed_at_ms";

type RawRecord = (String, String, String, String, String, i64, i64);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteIndex {
    writer: Arc<Mutex<Connection>>,
    /// Same connection as `writer` for an in-memory index.
    reader: Arc<Mutex<Connection>>,
}

impl SqliteIndex {
    /// Open or create the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| IndexError::unavailable("create index dir", e))?;
        }
        info!("Opening record index at {}", path.display());
        let writer = Connection::open(path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open(path)?;
        reader.busy_timeout(BUSY_TIMEOUT)?;
        reader.execute_batch("PRAGMA query_only=ON;")?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory record index");
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        let shared = Arc::new(Mutex::new(conn));
        Ok(Self {
            writer: Arc::clone(&shared),
            reader: shared,
        })
    }

    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        Self::run_blocking(Arc::clone(&self.writer), op, f).await
    }

    async fn with_reader<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        Self::run_blocking(Arc::clone(&self.reader), op, f).await
    }

    async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| IndexError::unavailable(op, "connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| IndexError::unavailable(op, e))?
    }
}

fn to_sql_int(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| IndexError::Corrupt(format!("{what} {value} out of range")))
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_raw(raw: RawRecord) -> Result<IndexedRecord> {
    let (did, collection, rkey, cid, payload, sequence, indexed_at_ms) = raw;
    let did = Did::parse(&did).map_err(|e| IndexError::Corrupt(e.to_string()))?;
    let collection = Collection::from_nsid(&collection)
        .ok_or_else(|| IndexError::Corrupt(format!("unknown collection {collection}")))?;
    let payload =
        serde_json::from_str(&payload).map_err(|e| IndexError::Corrupt(e.to_string()))?;
    Ok(IndexedRecord {
        did,
        collection,
        rkey,
        cid,
        payload,
        sequence: from_sql_int(sequence),
        indexed_at_ms: from_sql_int(indexed_at_ms),
    })
}

fn collect_records(raws: Vec<RawRecord>) -> Vec<IndexedRecord> {
    raws.into_iter()
        .filter_map(|raw| match decode_raw(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("Skipping unreadable index row: {err}");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RecordIndex for SqliteIndex {
    async fn upsert(&self, write: RecordWrite) -> Result<UpsertOutcome> {
        RecordBody::decode(write.collection, &write.payload)?;
        let payload = serde_json::to_string(&write.payload)
            .map_err(|e| IndexError::Corrupt(e.to_string()))?;
        let sequence = to_sql_int(write.sequence, "sequence")?;

        self.with_conn("upsert", move |conn| {
            let now = to_sql_int(unix_ms_now(), "timestamp")?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let did = write.did.as_str();
            let nsid = write.collection.nsid();

            tx.execute(
                "INSERT INTO known_identities (did, first_seen_ms) VALUES (?1, ?2)
                 ON CONFLICT(did) DO NOTHING",
                params![did, now],
            )?;

            let row: Option<(i64, String)> = tx
                .query_row(
                    "SELECT sequence, cid FROM records WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
                    params![did, nsid, write.rkey],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let tomb: Option<i64> = tx
                .query_row(
                    "SELECT sequence FROM tombstones WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
                    params![did, nsid, write.rkey],
                    |r| r.get(0),
                )
                .optional()?;

            let existing = match (&row, tomb) {
                (Some((seq, cid)), _) => Existing::Row {
                    sequence: from_sql_int(*seq),
                    cid,
                },
                (None, Some(seq)) => Existing::Tombstone {
                    sequence: from_sql_int(seq),
                },
                (None, None) => Existing::Absent,
            };
            let outcome = resolve_upsert(existing, write.sequence, &write.cid);

            if outcome.wrote() {
                tx.execute(
                    "DELETE FROM tombstones WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
                    params![did, nsid, write.rkey],
                )?;
                tx.execute(
                    "INSERT INTO records (did, collection, rkey, cid, payload, sequence, indexed_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(did, collection, rkey) DO UPDATE SET
                         cid = excluded.cid,
                         payload = excluded.payload,
                         sequence = excluded.sequence,
                         indexed_at_ms = excluded.indexed_at_ms",
                    params![did, nsid, write.rkey, write.cid, payload, sequence, now],
                )?;
            }
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn delete(
        &self,
        did: &Did,
        collection: Collection,
        rkey: &str,
        sequence: u64,
    ) -> Result<bool> {
        let did = did.clone();
        let rkey = rkey.to_string();
        self.with_conn("delete", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let nsid = collection.nsid();
            let row: Option<i64> = tx
                .query_row(
                    "SELECT sequence FROM records WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
                    params![did.as_str(), nsid, rkey],
                    |r| r.get(0),
                )
                .optional()?;
            let prior: Option<i64> = tx
                .query_row(
                    "SELECT sequence FROM tombstones WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
                    params![did.as_str(), nsid, rkey],
                    |r| r.get(0),
                )
                .optional()?;
            let tomb = tombstone_sequence(
                sequence,
                row.map(from_sql_int),
                prior.map(from_sql_int),
            );

            let removed = tx.execute(
                "DELETE FROM records WHERE did = ?1 AND collection = ?2 AND rkey = ?3",
                params![did.as_str(), nsid, rkey],
            )?;
            tx.execute(
                "INSERT INTO tombstones (did, collection, rkey, sequence) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(did, collection, rkey) DO UPDATE SET sequence = excluded.sequence",
                params![did.as_str(), nsid, rkey, to_sql_int(tomb, "sequence")?],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_by_collection(&self, collection: Collection) -> Result<Vec<IndexedRecord>> {
        let raws = self
            .with_reader("list_by_collection", move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE collection = ?1
                     ORDER BY sequence ASC, indexed_at_ms ASC, did ASC, rkey ASC"
                ))?;
                let rows = stmt
                    .query_map(params![collection.nsid()], read_raw)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(collect_records(raws))
    }

    async fn recent_across_all(&self, limit: usize) -> Result<Vec<IndexedRecord>> {
        let limit = to_sql_int(limit as u64, "limit")?;
        let raws = self
            .with_reader("recent_across_all", move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     ORDER BY sequence DESC, indexed_at_ms DESC, did DESC, rkey DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit], read_raw)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(collect_records(raws))
    }

    async fn known_identities(&self) -> Result<BTreeSet<Did>> {
        let raw: Vec<String> = self
            .with_reader("known_identities", |conn| {
                let mut stmt = conn.prepare_cached("SELECT did FROM known_identities")?;
                let rows = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(raw
            .iter()
            .filter_map(|did| Did::parse(did).ok())
            .collect())
    }

    async fn is_known(&self, did: &Did) -> Result<bool> {
        let did = did.clone();
        self.with_reader("is_known", move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM known_identities WHERE did = ?1",
                    params![did.as_str()],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn get_profile(&self, did: &Did) -> Result<Option<ProfileCacheEntry>> {
        let did = did.clone();
        let entry = self
            .with_reader("get_profile", move |conn| {
                let row = conn
                    .query_row(
                        "SELECT handle, display_name, avatar, fetched_at_ms, ttl_ms
                         FROM profiles WHERE did = ?1",
                        params![did.as_str()],
                        |r| {
                            Ok((
                                r.get::<_, Option<String>>(0)?,
                                r.get::<_, Option<String>>(1)?,
                                r.get::<_, Option<String>>(2)?,
                                r.get::<_, i64>(3)?,
                                r.get::<_, i64>(4)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row.map(|(handle, display_name, avatar, fetched, ttl)| {
                    ProfileCacheEntry::new(
                        Profile {
                            did,
                            handle,
                            display_name,
                            avatar,
                        },
                        from_sql_int(fetched),
                        from_sql_int(ttl),
                    )
                }))
            })
            .await?;
        let now = unix_ms_now();
        Ok(entry.filter(|e| e.is_fresh(now)))
    }

    async fn put_profile(&self, entry: ProfileCacheEntry) -> Result<()> {
        let fetched = to_sql_int(entry.fetched_at_ms, "fetched_at_ms")?;
        let ttl = to_sql_int(entry.ttl_ms, "ttl_ms")?;
        self.with_conn("put_profile", move |conn| {
            let p = &entry.profile;
            conn.execute(
                "INSERT INTO profiles (did, handle, display_name, avatar, fetched_at_ms, ttl_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(did) DO UPDATE SET
                     handle = excluded.handle,
                     display_name = excluded.display_name,
                     avatar = excluded.avatar,
                     fetched_at_ms = excluded.fetched_at_ms,
                     ttl_ms = excluded.ttl_ms",
                params![
                    p.did.as_str(),
                    p.handle,
                    p.display_name,
                    p.avatar,
                    fetched,
                    ttl
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn prune_profiles(&self, now_ms: u64) -> Result<usize> {
        let now = to_sql_int(now_ms, "now_ms")?;
        self.with_conn("prune_profiles", move |conn| {
            Ok(conn.execute(
                "DELETE FROM profiles WHERE fetched_at_ms + ttl_ms <= ?1",
                params![now],
            )?)
        })
        .await
    }

    async fn save_cursor(&self, sequence: u64) -> Result<()> {
        let sequence = to_sql_int(sequence, "cursor")?;
        self.with_conn("save_cursor", move |conn| {
            conn.execute(
                "INSERT INTO stream_cursor (id, sequence) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET sequence = excluded.sequence",
                params![sequence],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_cursor(&self) -> Result<u64> {
        self.with_reader("load_cursor", |conn| {
            let seq: Option<i64> = conn
                .query_row("SELECT sequence FROM stream_cursor WHERE id = 1", [], |r| {
                    r.get(0)
                })
                .optional()?;
            Ok(seq.map_or(0, from_sql_int))
        })
        .await
    }

    async fn purge_identity(&self, did: &Did) -> Result<usize> {
        let did = did.clone();
        self.with_conn("purge_identity", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute("DELETE FROM records WHERE did = ?1", params![did.as_str()])?;
            tx.execute("DELETE FROM tombstones WHERE did = ?1", params![did.as_str()])?;
            tx.commit()?;
            info!("Purged {removed} records for {did}");
            Ok(removed)
        })
        .await
    }

    async fn stats(&self) -> Result<IndexStats> {
        let (known, per_collection) = self
            .with_reader("stats", |conn| {
                let known: i64 =
                    conn.query_row("SELECT COUNT(*) FROM known_identities", [], |r| r.get(0))?;
                let mut stmt = conn.prepare_cached(
                    "SELECT collection, COUNT(*) FROM records GROUP BY collection",
                )?;
                let per = stmt
                    .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((known, per))
            })
            .await?;

        let mut stats = IndexStats {
            known_identities: usize::try_from(known).unwrap_or_default(),
            ..IndexStats::default()
        };
        for (nsid, count) in per_collection {
            let Some(collection) = Collection::from_nsid(&nsid) else {
                continue;
            };
            let count = usize::try_from(count).unwrap_or_default();
            stats.records += count;
            stats.per_collection.insert(collection, count);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn bean(rkey: &str, sequence: u64) -> RecordWrite {
        RecordWrite {
            did: Did::parse("did:plc:alice").unwrap(),
            collection: Collection::Bean,
            rkey: rkey.to_string(),
            cid: format!("bafy-{rkey}"),
            payload: json!({ "name": "Gesha" }),
            sequence,
        }
    }

    #[tokio::test]
    async fn reads_do_not_wait_for_the_writer() {
        let temp = TempDir::new().unwrap();
        let index = SqliteIndex::open(temp.path().join("index.db")).unwrap();
        index.upsert(bean("b1", 1)).await.unwrap();

        let writer = Arc::clone(&index.writer);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            let _guard = writer.lock().unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().ok();
        });
        locked_rx.recv().unwrap();

        let rows = tokio::time::timeout(
            Duration::from_secs(5),
            index.list_by_collection(Collection::Bean),
        )
        .await
        .expect("read blocked behind the writer lock")
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(5), index.load_cursor())
                .await
                .expect("cursor read blocked")
                .unwrap(),
            0
        );
        release_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn reader_is_query_only_and_sees_new_writes() {
        let temp = TempDir::new().unwrap();
        let index = SqliteIndex::open(temp.path().join("index.db")).unwrap();
        let denied = index
            .with_reader("write attempt", |conn| {
                conn.execute("DELETE FROM records", [])?;
                Ok(())
            })
            .await;
        assert!(denied.is_err());

        index.upsert(bean("b1", 1)).await.unwrap();
        index.save_cursor(9).await.unwrap();
        assert_eq!(index.list_by_collection(Collection::Bean).await.unwrap().len(), 1);
        assert_eq!(index.load_cursor().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn in_memory_index_shares_one_connection() {
        let index = SqliteIndex::open_in_memory().unwrap();
        assert!(Arc::ptr_eq(&index.writer, &index.reader));
        index.upsert(bean("b1", 1)).await.unwrap();
        assert_eq!(index.stats().await.unwrap().records, 1);
    }
}
