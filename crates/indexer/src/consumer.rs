//! Firehose consumer: one long-lived background task per process.
//!
//! Each frame is fully indexed before the next one is read. The stream cursor
//! is flushed in batches and only ever points at a frame that has already
//! been written.

use crate::backoff::BackoffConfig;
use crate::health::{ConsumerHealth, ConsumerState};
use crate::registry::IdentityRegistry;
use crate::transport::{FrameStream, Transport};
use crate::{IndexerError, Result};
use arabica_index::{IndexError, RecordIndex};
use arabica_protocol::{
    at_uri, decode_frame, validate_rkey, Collection, CommitEvent, CommitOperation, Did,
    RecordWrite, StreamEvent,
};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Flush the cursor after this many processed frames.
    pub cursor_flush_events: usize,
    /// Flush the cursor at least this often while frames are arriving.
    pub cursor_flush_interval: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            cursor_flush_events: 100,
            cursor_flush_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Highest processed sequence not yet written as the cursor.
struct CursorBatch {
    pending: Option<u64>,
    since_flush: usize,
    last_flush: Instant,
    max_events: usize,
    max_wait: Duration,
}

impl CursorBatch {
    fn new(max_events: usize, max_wait: Duration) -> Self {
        Self {
            pending: None,
            since_flush: 0,
            last_flush: Instant::now(),
            max_events: max_events.max(1),
            max_wait,
        }
    }

    fn record(&mut self, sequence: u64) {
        self.pending = Some(self.pending.map_or(sequence, |cur| cur.max(sequence)));
        self.since_flush += 1;
    }

    fn due(&self) -> bool {
        self.pending.is_some()
            && (self.since_flush >= self.max_events || self.last_flush.elapsed() >= self.max_wait)
    }

    fn take(&mut self) -> Option<u64> {
        self.since_flush = 0;
        self.last_flush = Instant::now();
        self.pending.take()
    }
}

enum SessionEnd {
    Cancelled,
    Closed,
    Failed(IndexerError),
}

struct Session {
    end: SessionEnd,
    /// At least one frame was fully processed on this connection.
    progressed: bool,
}

#[derive(Default)]
struct RunSlot {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

struct ConsumerInner {
    index: Arc<dyn RecordIndex>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn IdentityRegistry>,
    config: ConsumerConfig,
    health_tx: watch::Sender<ConsumerHealth>,
    // Keeps the channel open so publishes never fail.
    _health_rx: watch::Receiver<ConsumerHealth>,
}

#[derive(Clone)]
pub struct FirehoseConsumer {
    inner: Arc<ConsumerInner>,
    slot: Arc<Mutex<RunSlot>>,
}

impl FirehoseConsumer {
    pub fn new(
        index: Arc<dyn RecordIndex>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn IdentityRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        let (health_tx, health_rx) = watch::channel(ConsumerHealth::initial());
        Self {
            inner: Arc::new(ConsumerInner {
                index,
                transport,
                registry,
                config,
                health_tx,
                _health_rx: health_rx,
            }),
            slot: Arc::new(Mutex::new(RunSlot::default())),
        }
    }

    /// Spawn the background loop and return immediately. The loop exits when
    /// `parent` is cancelled or [`FirehoseConsumer::stop`] is called.
    /// A consumer runs once; starting it again is an error.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| IndexerError::Other("consumer state lock poisoned".to_string()))?;
        if slot.started || slot.stopped {
            return Err(IndexerError::Other(
                "firehose consumer can only be started once".to_string(),
            ));
        }
        let token = parent.child_token();
        let inner = Arc::clone(&self.inner);
        let loop_token = token.clone();
        slot.handle = Some(tokio::spawn(async move {
            inner.run(loop_token).await;
        }));
        slot.token = Some(token);
        slot.started = true;
        Ok(())
    }

    /// Cancel the loop and wait until it has exited. Safe to call repeatedly
    /// and from several tasks at once.
    pub async fn stop(&self) {
        let (token, handle, started) = match self.slot.lock() {
            Ok(mut slot) => {
                slot.stopped = true;
                (slot.token.take(), slot.handle.take(), slot.started)
            }
            Err(poisoned) => {
                let mut slot = poisoned.into_inner();
                slot.stopped = true;
                (slot.token.take(), slot.handle.take(), slot.started)
            }
        };

        if let Some(token) = token {
            token.cancel();
        }
        match handle {
            Some(handle) => {
                if let Err(err) = handle.await {
                    error!("Firehose consumer task ended abnormally: {err}");
                }
                self.inner.set_state(ConsumerState::Stopped);
            }
            None if started => {
                // Another caller owns the join handle; wait for it to finish.
                let mut rx = self.inner.health_tx.subscribe();
                let _ = rx
                    .wait_for(|health| health.state == ConsumerState::Stopped)
                    .await;
            }
            None => self.inner.set_state(ConsumerState::Stopped),
        }
    }

    #[must_use]
    pub fn health(&self) -> ConsumerHealth {
        self.inner.health_tx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<ConsumerHealth> {
        self.inner.health_tx.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.health_tx.borrow().is_connected()
    }
}

impl ConsumerInner {
    fn set_state(&self, state: ConsumerState) {
        self.health_tx.send_modify(|health| health.state = state);
    }

    fn bump(&self, update: impl FnOnce(&mut ConsumerHealth)) {
        self.health_tx.send_modify(update);
    }

    async fn run(&self, token: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                break;
            }
            self.set_state(ConsumerState::Connecting);
            let session = self.session(&token).await;
            if session.progressed {
                attempt = 0;
            }
            match session.end {
                SessionEnd::Cancelled => break,
                SessionEnd::Closed => {
                    info!("Firehose stream closed by remote, reconnecting");
                }
                SessionEnd::Failed(err) => {
                    if err.is_index_unavailable() {
                        error!("Index unavailable, cursor held: {err}");
                    } else {
                        warn!("Firehose connection failed: {err}");
                    }
                    self.bump(|health| health.last_error = Some(err.to_string()));
                }
            }

            attempt = attempt.saturating_add(1);
            self.health_tx.send_modify(|health| {
                health.state = ConsumerState::Reconnecting;
                health.consecutive_failures = attempt;
            });
            let delay = self.config.backoff.delay(attempt);
            debug!("Reconnecting in {delay:?} (attempt {attempt})");
            tokio::select! {
                () = token.cancelled() => break,
                () = time::sleep(delay) => {}
            }
        }
        self.set_state(ConsumerState::Stopped);
        info!("Firehose consumer stopped");
    }

    async fn session(&self, token: &CancellationToken) -> Session {
        let mut session = Session {
            end: SessionEnd::Closed,
            progressed: false,
        };

        let cursor = match self.index.load_cursor().await {
            Ok(0) => None,
            Ok(seq) => Some(seq),
            Err(err) => {
                session.end = SessionEnd::Failed(err.into());
                return session;
            }
        };

        let connect = tokio::select! {
            () = token.cancelled() => {
                session.end = SessionEnd::Cancelled;
                return session;
            }
            result = time::timeout(self.config.connect_timeout, self.transport.connect(cursor)) => result,
        };
        let mut stream: Box<dyn FrameStream> = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                session.end = SessionEnd::Failed(err);
                return session;
            }
            Err(_) => {
                session.end =
                    SessionEnd::Failed(IndexerError::ConnectTimeout(self.config.connect_timeout));
                return session;
            }
        };

        info!("Firehose connected (cursor: {cursor:?})");
        self.health_tx.send_modify(|health| {
            health.state = ConsumerState::Streaming;
            health.last_connected = Some(SystemTime::now());
        });

        let mut batch = CursorBatch::new(
            self.config.cursor_flush_events,
            self.config.cursor_flush_interval,
        );
        loop {
            let frame = tokio::select! {
                () = token.cancelled() => {
                    session.end = SessionEnd::Cancelled;
                    break;
                }
                frame = stream.next_frame() => frame,
            };
            let text = match frame {
                None => {
                    session.end = SessionEnd::Closed;
                    break;
                }
                Some(Err(err)) => {
                    session.end = SessionEnd::Failed(err);
                    break;
                }
                Some(Ok(text)) => text,
            };
            match self.handle_frame(&text).await {
                Ok(Some(sequence)) => {
                    session.progressed = true;
                    self.bump(|health| health.consecutive_failures = 0);
                    batch.record(sequence);
                    if batch.due() {
                        if let Err(err) = self.flush(&mut batch).await {
                            session.end = SessionEnd::Failed(err);
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    session.end = SessionEnd::Failed(err);
                    break;
                }
            }
        }

        if let Err(err) = self.flush(&mut batch).await {
            warn!("Failed to save cursor on disconnect: {err}");
        }
        session
    }

    async fn flush(&self, batch: &mut CursorBatch) -> Result<()> {
        let Some(sequence) = batch.take() else {
            return Ok(());
        };
        self.index.save_cursor(sequence).await?;
        debug!("Cursor saved at {sequence}");
        self.bump(|health| health.last_saved_cursor = Some(sequence));
        Ok(())
    }

    /// Index one frame. Returns the sequence the cursor may advance to, or
    /// `None` for a frame that could not be decoded at all.
    async fn handle_frame(&self, text: &str) -> Result<Option<u64>> {
        let event = match decode_frame(text) {
            Ok(event) => event,
            Err(err) => {
                debug!("Skipping undecodable frame: {err}");
                self.bump(|health| health.decode_errors += 1);
                return Ok(None);
            }
        };
        self.bump(|health| health.events_seen += 1);
        let sequence = event.sequence();

        let StreamEvent::Commit(commit) = event else {
            return Ok(Some(sequence));
        };
        let Some(collection) = Collection::from_nsid(&commit.collection) else {
            self.bump(|health| health.events_skipped += 1);
            return Ok(Some(sequence));
        };
        if !self.is_relevant(&commit.did).await? {
            self.bump(|health| health.events_skipped += 1);
            return Ok(Some(sequence));
        }

        self.apply(commit, collection).await?;
        Ok(Some(sequence))
    }

    async fn is_relevant(&self, did: &Did) -> Result<bool> {
        if self.registry.is_registered(did) {
            return Ok(true);
        }
        Ok(self.index.is_known(did).await?)
    }

    async fn apply(&self, commit: CommitEvent, collection: Collection) -> Result<()> {
        let uri = at_uri(&commit.did, collection, &commit.rkey);
        if let Err(err) = validate_rkey(&commit.rkey) {
            warn!("Skipping {uri}: {err}");
            self.bump(|health| health.malformed_records += 1);
            return Ok(());
        }

        match commit.operation {
            CommitOperation::Create | CommitOperation::Update => {
                let (Some(payload), Some(cid)) = (commit.record, commit.cid) else {
                    warn!("Skipping {uri}: commit carries no record");
                    self.bump(|health| health.malformed_records += 1);
                    return Ok(());
                };
                let write = RecordWrite {
                    did: commit.did,
                    collection,
                    rkey: commit.rkey,
                    cid,
                    payload,
                    sequence: commit.sequence,
                };
                match self.index.upsert(write).await {
                    Ok(outcome) => {
                        debug!("Upsert {uri}: {outcome:?}");
                        if outcome.wrote() {
                            self.bump(|health| health.records_upserted += 1);
                        }
                    }
                    Err(err @ IndexError::Malformed(_)) => {
                        warn!("Skipping malformed record {uri}: {err}");
                        self.bump(|health| health.malformed_records += 1);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            CommitOperation::Delete => {
                let removed = self
                    .index
                    .delete(&commit.did, collection, &commit.rkey, commit.sequence)
                    .await?;
                debug!("Delete {uri}: removed={removed}");
                self.bump(|health| health.records_deleted += 1);
            }
        }
        Ok(())
    }
}
