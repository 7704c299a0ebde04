use arabica_index::{IndexError, IndexStats, MemoryIndex, RecordIndex, UpsertOutcome};
use arabica_indexer::{
    BackoffConfig, ConsumerConfig, ConsumerState, FirehoseConsumer, FrameStream, IndexerError,
    RegisteredIdentities, Transport,
};
use arabica_protocol::{
    Collection, Did, IndexedRecord, ProfileCacheEntry, RecordWrite,
};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

enum Script {
    Frames(Vec<String>),
    Refuse,
}

/// Plays one script per connect; once scripts run out, connections stay
/// open without traffic.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: Mutex<Vec<Option<u64>>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            connects: Mutex::new(Vec::new()),
        })
    }

    fn connects(&self) -> Vec<Option<u64>> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, cursor: Option<u64>) -> arabica_indexer::Result<Box<dyn FrameStream>> {
        self.connects.lock().unwrap().push(cursor);
        match self.scripts.lock().unwrap().pop_front() {
            Some(Script::Frames(frames)) => Ok(Box::new(ScriptedStream {
                frames: frames.into(),
            })),
            Some(Script::Refuse) => Err(IndexerError::Transport("connection refused".into())),
            None => Ok(Box::new(IdleStream)),
        }
    }
}

struct ScriptedStream {
    frames: VecDeque<String>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Option<arabica_indexer::Result<String>> {
        self.frames.pop_front().map(Ok)
    }
}

struct IdleStream;

#[async_trait]
impl FrameStream for IdleStream {
    async fn next_frame(&mut self) -> Option<arabica_indexer::Result<String>> {
        std::future::pending().await
    }
}

fn did(raw: &str) -> Did {
    Did::parse(raw).expect("did")
}

fn commit(owner: &str, seq: u64, op: &str, collection: &str, rkey: &str, record: Value) -> String {
    let mut commit = json!({
        "rev": "3l3qo2vutsw2b",
        "operation": op,
        "collection": collection,
        "rkey": rkey,
    });
    if op != "delete" {
        commit["record"] = record;
        commit["cid"] = json!(format!("bafy-{seq}"));
    }
    json!({ "did": owner, "time_us": seq, "kind": "commit", "commit": commit }).to_string()
}

fn roaster_frame(owner: &str, seq: u64, rkey: &str, name: &str) -> String {
    commit(
        owner,
        seq,
        "create",
        "social.arabica.alpha.roaster",
        rkey,
        json!({ "name": name }),
    )
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        cursor_flush_events: 100,
        cursor_flush_interval: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(5),
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn routes_relevant_commits_and_filters_the_rest() {
    let index = Arc::new(MemoryIndex::new());
    // carol is known from an earlier backfill but not registered.
    index
        .upsert(RecordWrite {
            did: did("did:plc:carol"),
            collection: Collection::Brewer,
            rkey: "v60".into(),
            cid: "bafy-old".into(),
            payload: json!({ "name": "V60" }),
            sequence: 0,
        })
        .await
        .unwrap();

    let transport = ScriptedTransport::new(vec![Script::Frames(vec![
        roaster_frame("did:plc:alice", 10, "r1", "Onyx"),
        roaster_frame("did:plc:bob", 11, "r9", "Stranger"),
        commit("did:plc:alice", 12, "create", "app.bsky.feed.post", "p1", json!({ "text": "hi" })),
        commit(
            "did:plc:alice",
            13,
            "update",
            "social.arabica.alpha.roaster",
            "r1",
            json!({ "name": "Onyx Coffee Lab" }),
        ),
        commit("did:plc:alice", 14, "create", "social.arabica.alpha.bean", "b1", json!({ "name": "Gesha" })),
        commit("did:plc:alice", 15, "delete", "social.arabica.alpha.bean", "b1", Value::Null),
        "not json at all".to_string(),
        commit("did:plc:alice", 16, "create", "social.arabica.alpha.grinder", "g1", json!(["bad"])),
        roaster_frame("did:plc:carol", 17, "r2", "Sey"),
        json!({ "did": "did:plc:alice", "time_us": 18, "kind": "identity" }).to_string(),
    ])]);
    let registry = Arc::new(RegisteredIdentities::new([did("did:plc:alice")]));

    let consumer = FirehoseConsumer::new(index.clone(), transport.clone(), registry, fast_config());
    consumer.start(&CancellationToken::new()).unwrap();
    wait_until("reconnect", || transport.connects().len() >= 2).await;
    consumer.stop().await;

    assert_eq!(transport.connects(), vec![None, Some(18)]);
    assert_eq!(index.load_cursor().await.unwrap(), 18);

    let roasters = index.list_by_collection(Collection::Roaster).await.unwrap();
    let names: Vec<&str> = roasters
        .iter()
        .map(|r| r.payload["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Onyx Coffee Lab", "Sey"]);
    assert!(index.list_by_collection(Collection::Bean).await.unwrap().is_empty());
    assert!(index.list_by_collection(Collection::Grinder).await.unwrap().is_empty());
    assert!(!index.is_known(&did("did:plc:bob")).await.unwrap());

    let health = consumer.health();
    assert_eq!(health.state, ConsumerState::Stopped);
    assert_eq!(health.events_skipped, 2);
    assert_eq!(health.decode_errors, 1);
    assert_eq!(health.malformed_records, 1);
    assert_eq!(health.records_deleted, 1);
    assert_eq!(health.records_upserted, 4);
}

/// Fails upserts of one rkey while `failures` remain.
struct FlakyIndex {
    inner: MemoryIndex,
    rkey: &'static str,
    failures: AtomicUsize,
}

#[async_trait]
impl RecordIndex for FlakyIndex {
    async fn upsert(&self, write: RecordWrite) -> arabica_index::Result<UpsertOutcome> {
        if write.rkey == self.rkey
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(IndexError::Unavailable("disk full".into()));
        }
        self.inner.upsert(write).await
    }
    async fn delete(&self, did: &Did, c: Collection, rkey: &str, seq: u64) -> arabica_index::Result<bool> {
        self.inner.delete(did, c, rkey, seq).await
    }
    async fn list_by_collection(&self, c: Collection) -> arabica_index::Result<Vec<IndexedRecord>> {
        self.inner.list_by_collection(c).await
    }
    async fn recent_across_all(&self, limit: usize) -> arabica_index::Result<Vec<IndexedRecord>> {
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

#[tokio::test]
async fn index_failure_holds_cursor_and_replays_after_reconnect() {
    let index = Arc::new(FlakyIndex {
        inner: MemoryIndex::new(),
        rkey: "boom",
        failures: AtomicUsize::new(1),
    });
    let transport = ScriptedTransport::new(vec![
        Script::Frames(vec![
            roaster_frame("did:plc:alice", 10, "r1", "Onyx"),
            roaster_frame("did:plc:alice", 20, "boom", "Flaky"),
            roaster_frame("did:plc:alice", 30, "r3", "Never read"),
        ]),
        Script::Frames(vec![
            roaster_frame("did:plc:alice", 20, "boom", "Flaky"),
            roaster_frame("did:plc:alice", 30, "r3", "Sey"),
        ]),
    ]);
    let registry = Arc::new(RegisteredIdentities::new([did("did:plc:alice")]));
    let consumer = FirehoseConsumer::new(index.clone(), transport.clone(), registry, fast_config());

    consumer.start(&CancellationToken::new()).unwrap();
    wait_until("second replay", || transport.connects().len() >= 3).await;
    consumer.stop().await;

    // The failed frame was never acknowledged, so the next session resumed at 10.
    assert_eq!(transport.connects(), vec![None, Some(10), Some(30)]);
    let rkeys: Vec<String> = index
        .list_by_collection(Collection::Roaster)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.rkey)
        .collect();
    assert_eq!(rkeys, vec!["r1", "boom", "r3"]);
    assert_eq!(index.load_cursor().await.unwrap(), 30);
    assert!(consumer.health().last_error.unwrap().contains("disk full"));
}

#[tokio::test]
async fn refused_connections_are_retried() {
    let index = Arc::new(MemoryIndex::new());
    let transport = ScriptedTransport::new(vec![
        Script::Refuse,
        Script::Refuse,
        Script::Frames(vec![roaster_frame("did:plc:alice", 5, "r1", "Onyx")]),
    ]);
    let registry = Arc::new(RegisteredIdentities::new([did("did:plc:alice")]));
    let consumer = FirehoseConsumer::new(index.clone(), transport.clone(), registry, fast_config());

    consumer.start(&CancellationToken::new()).unwrap();
    wait_until("record after retries", || transport.connects().len() >= 4).await;
    consumer.stop().await;

    assert_eq!(&transport.connects()[..4], &[None, None, None, Some(5)]);
    assert_eq!(index.stats().await.unwrap().records, 1);
}

#[tokio::test]
async fn stop_is_prompt_idempotent_and_final() {
    let index = Arc::new(MemoryIndex::new());
    let transport = ScriptedTransport::new(Vec::new());
    let registry = Arc::new(RegisteredIdentities::default());
    let consumer = FirehoseConsumer::new(index, transport, registry, fast_config());

    consumer.start(&CancellationToken::new()).unwrap();
    wait_until("streaming", || consumer.is_connected()).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(consumer.stop(), consumer.stop());
    })
    .await
    .expect("stop returns while a read is in flight");
    consumer.stop().await;

    assert_eq!(consumer.health().state, ConsumerState::Stopped);
    assert!(!consumer.is_connected());
    assert!(consumer.start(&CancellationToken::new()).is_err());
}

#[tokio::test]
async fn cancelling_the_parent_token_stops_the_loop() {
    let index = Arc::new(MemoryIndex::new());
    let transport = ScriptedTransport::new(Vec::new());
    let registry = Arc::new(RegisteredIdentities::default());
    let consumer = FirehoseConsumer::new(index, transport, registry, fast_config());

    let parent = CancellationToken::new();
    consumer.start(&parent).unwrap();
    wait_until("streaming", || consumer.is_connected()).await;
    parent.cancel();
    wait_until("stopped", || consumer.health().state == ConsumerState::Stopped).await;
    consumer.stop().await;
}
