use arabica_feed::{
    FeedCache, FeedConfig, FeedError, ModerationGate, ProfileFetcher, DEFAULT_FEED_LIMIT,
};
use arabica_index::{IndexStats, MemoryIndex, RecordIndex, UpsertOutcome};
use arabica_protocol::{
    Collection, Did, IndexedRecord, Profile, ProfileCacheEntry, RecordBody, RecordWrite,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts feed fetches and can be made slow to widen refresh races.
#[derive(Default)]
struct CountingIndex {
    inner: MemoryIndex,
    recent_calls: AtomicUsize,
    delay: Option<Duration>,
}

#[async_trait]
impl RecordIndex for CountingIndex {
    async fn upsert(&self, write: RecordWrite) -> arabica_index::Result<UpsertOutcome> {
        self.inner.upsert(write).await
    }
    async fn delete(&self, did: &Did, c: Collection, rkey: &str, seq: u64) -> arabica_index::Result<bool> {
        self.inner.delete(did, c, rkey, seq).await
    }
    async fn list_by_collection(&self, c: Collection) -> arabica_index::Result<Vec<IndexedRecord>> {
        self.inner.list_by_collection(c).await
    }
    async fn recent_across_all(&self, limit: usize) -> arabica_index::Result<Vec<IndexedRecord>> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.recent_across_all(limit).await
    }
    async fn known_identities(&self) -> arabica_index::Result<BTreeSet<Did>> {
        self.inner.known_identities().await
    }
    async fn is_known(&self, did: &Did) -> arabica_index::Result<bool> {
        self.inner.is_known(did).await
    }
    async fn get_profile(&self, did: &Did) -> arabica_index::Result<Option<ProfileCacheEntry>> {
        self.inner.get_profile(did).await
    }
    async fn put_profile(&self, entry: ProfileCacheEntry) -> arabica_index::Result<()> {
        self.inner.put_profile(entry).await
    }
    async fn prune_profiles(&self, now_ms: u64) -> arabica_index::Result<usize> {
        self.inner.prune_profiles(now_ms).await
    }
    async fn save_cursor(&self, seq: u64) -> arabica_index::Result<()> {
        self.inner.save_cursor(seq).await
    }
    async fn load_cursor(&self) -> arabica_index::Result<u64> {
        self.inner.load_cursor().await
    }
    async fn purge_identity(&self, did: &Did) -> arabica_index::Result<usize> {
        self.inner.purge_identity(did).await
    }
    async fn stats(&self) -> arabica_index::Result<IndexStats> {
        self.inner.stats().await
    }
}

fn did(raw: &str) -> Did {
    Did::parse(raw).unwrap()
}

async fn add(index: &CountingIndex, owner: &str, collection: Collection, rkey: &str, seq: u64, payload: Value) {
    index
        .inner
        .upsert(RecordWrite {
            did: did(owner),
            collection,
            rkey: rkey.to_string(),
            cid: format!("bafy-{rkey}"),
            payload,
            sequence: seq,
        })
        .await
        .unwrap();
}

async fn seeded(delay: Option<Duration>) -> Arc<CountingIndex> {
    let index = Arc::new(CountingIndex {
        delay,
        ..CountingIndex::default()
    });
    add(&index, "did:plc:alice", Collection::Roaster, "r1", 10, json!({ "name": "Onyx" })).await;
    add(
        &index,
        "did:plc:bob",
        Collection::Brew,
        "b1",
        20,
        json!({ "method": "V60", "rating": 9, "createdAt": "2025-01-02T03:04:05Z" }),
    )
    .await;
    add(&index, "did:plc:alice", Collection::Bean, "k1", 30, json!({ "name": "Gesha" })).await;
    index
}

fn config(limit: usize) -> FeedConfig {
    FeedConfig {
        ttl: Duration::from_secs(300),
        limit,
        profile_ttl: Duration::from_secs(3600),
    }
}

#[tokio::test(start_paused = true)]
async fn second_read_within_ttl_is_served_from_cache() {
    let index = seeded(None).await;
    let feed = FeedCache::new(index.clone(), config(20));

    let first = feed.get_feed().await.unwrap();
    let second = feed.get_feed().await.unwrap();
    assert_eq!(index.recent_calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));

    let seqs: Vec<u64> = first.iter().map(|item| item.sequence).collect();
    assert_eq!(seqs, vec![30, 20, 10]);
    assert_eq!(first[1].uri, "at://did:plc:bob/social.arabica.alpha.brew/b1");
    assert!(matches!(first[1].record, RecordBody::Brew(_)));
    assert_eq!(first[1].created_at.to_rfc3339(), "2025-01-02T03:04:05+00:00");
    assert_eq!(first[0].author, Profile::bare(did("did:plc:alice")));
    assert_eq!(first[0].relative_time, "just now");

    tokio::time::advance(Duration::from_secs(301)).await;
    feed.get_feed().await.unwrap();
    assert_eq!(index.recent_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_collapse_into_one_fetch() {
    let index = seeded(Some(Duration::from_millis(50))).await;
    let feed = Arc::new(FeedCache::new(index.clone(), config(20)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.get_feed().await.map(|items| items.len()) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }
    assert_eq!(index.recent_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_serves_stale_snapshot() {
    let index = seeded(None).await;
    let feed = FeedCache::new(index.clone(), config(20));
    assert_eq!(feed.get_feed().await.unwrap().len(), 3);

    index.inner.set_unavailable(true);
    feed.invalidate().await;
    let stale = feed.get_feed().await.unwrap();
    assert_eq!(stale.len(), 3);
    assert_eq!(index.recent_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cold_failure_is_not_ready() {
    let index = seeded(None).await;
    index.inner.set_unavailable(true);
    let feed = FeedCache::new(index.clone(), config(20));

    let err = feed.get_feed().await.unwrap_err();
    assert!(matches!(err, FeedError::NotReady(_)));

    index.inner.set_unavailable(false);
    assert_eq!(feed.get_feed().await.unwrap().len(), 3);
}

#[tokio::test]
async fn invalidate_picks_up_new_writes() {
    let index = seeded(None).await;
    let feed = FeedCache::new(index.clone(), config(20));
    assert_eq!(feed.get_feed().await.unwrap().len(), 3);

    add(&index, "did:plc:carol", Collection::Grinder, "g1", 40, json!({ "name": "C40" })).await;
    assert_eq!(feed.get_feed().await.unwrap().len(), 3);
    feed.invalidate().await;
    let items = feed.get_feed().await.unwrap();
    assert_eq!(items.len(), 4);
    assert_eq!(items[0].rkey, "g1");
}

#[tokio::test]
async fn limit_bounds_the_page() {
    let index = seeded(None).await;
    let feed = FeedCache::new(index.clone(), config(2));
    let items = feed.get_feed().await.unwrap();
    let rkeys: Vec<&str> = items.iter().map(|i| i.rkey.as_str()).collect();
    assert_eq!(rkeys, vec!["k1", "b1"]);
}

#[tokio::test]
async fn zero_limit_applies_the_default_page_size() {
    let index = seeded(None).await;
    let feed = FeedCache::new(index.clone(), config(0));
    assert_eq!(feed.get_feed().await.unwrap().len(), 3);

    for seq in 0..DEFAULT_FEED_LIMIT as u64 {
        let rkey = format!("extra{seq}");
        add(&index, "did:plc:dave", Collection::Bean, &rkey, 100 + seq, json!({ "name": "Gesha" })).await;
    }
    feed.invalidate().await;
    let items = feed.get_feed().await.unwrap();
    assert_eq!(items.len(), DEFAULT_FEED_LIMIT);
    assert_eq!(items[0].sequence, 100 + DEFAULT_FEED_LIMIT as u64 - 1);
}

struct HideAlice;

impl ModerationGate for HideAlice {
    fn is_blacklisted(&self, did: &Did) -> bool {
        did.as_str() == "did:plc:alice"
    }

    fn is_hidden(&self, uri: &str) -> bool {
        uri.ends_with("/b1")
    }
}

#[tokio::test]
async fn moderated_items_are_dropped() {
    let index = seeded(None).await;
    add(&index, "did:plc:carol", Collection::Brewer, "v1", 5, json!({ "name": "V60" })).await;
    let feed = FeedCache::new(index.clone(), config(20)).with_moderation(Arc::new(HideAlice));

    let items = feed.get_feed().await.unwrap();
    let uris: Vec<&str> = items.iter().map(|i| i.uri.as_str()).collect();
    assert_eq!(uris, vec!["at://did:plc:carol/social.arabica.alpha.brewer/v1"]);
}

struct StaticProfiles {
    calls: AtomicUsize,
}

#[async_trait]
impl ProfileFetcher for StaticProfiles {
    async fn fetch_profile(&self, did: &Did) -> arabica_feed::Result<Profile> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Profile {
            did: did.clone(),
            handle: Some(format!("{}.test", did.method_id())),
            display_name: None,
            avatar: None,
        })
    }
}

#[tokio::test]
async fn missing_profiles_are_fetched_once_and_cached() {
    let index = seeded(None).await;
    index
        .inner
        .put_profile(ProfileCacheEntry::new(
            Profile {
                did: did("did:plc:bob"),
                handle: Some("bob.coffee".into()),
                display_name: Some("Bob".into()),
                avatar: None,
            },
            arabica_protocol::unix_ms_now(),
            60_000,
        ))
        .await
        .unwrap();
    let fetcher = Arc::new(StaticProfiles {
        calls: AtomicUsize::new(0),
    });
    let feed = FeedCache::new(index.clone(), config(20)).with_profile_fetcher(fetcher.clone());

    let items = feed.get_feed().await.unwrap();
    assert_eq!(items[1].author.label(), "Bob");
    assert_eq!(items[0].author.label(), "alice.test");
    assert_eq!(items[2].author.label(), "alice.test");
    // alice appears twice but is fetched once; bob came from the cache.
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(index.inner.get_profile(&did("did:plc:alice")).await.unwrap().is_some());
}
