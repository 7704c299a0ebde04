//! Historical catch-up for individual identities.
//!
//! Every backfilled row is written at [`BACKFILL_SEQUENCE`]. Streamed rows
//! always carry a higher sequence, so a live update racing a backfill page
//! for the same key wins no matter which lands first.

use crate::registry::{IdentityRegistry, RegisteredIdentities};
use crate::xrpc::RepoLister;
use crate::{IndexerError, Result};
use arabica_index::{IndexError, RecordIndex};
use arabica_protocol::{at_uri, validate_rkey, Collection, Did, RecordWrite};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sequence assigned to every backfilled write.
pub const BACKFILL_SEQUENCE: u64 = 0;

#[derive(Debug, Clone, Copy)]
pub struct BackfillConfig {
    /// Guard against a repository that never stops paginating.
    pub max_pages_per_collection: usize,
    /// Delay before the startup sweep so the consumer connects first.
    pub startup_delay: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_pages_per_collection: 100,
            startup_delay: Duration::from_secs(5),
        }
    }
}

/// Result of backfilling one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub fetched: usize,
    pub written: usize,
    /// Older than what the stream already delivered, or tombstoned.
    pub stale: usize,
    pub malformed: usize,
    pub pages: usize,
}

/// Result of a multi-identity sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub records_written: usize,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct BackfillOrchestrator {
    index: Arc<dyn RecordIndex>,
    lister: Arc<dyn RepoLister>,
    config: BackfillConfig,
}

impl BackfillOrchestrator {
    pub fn new(
        index: Arc<dyn RecordIndex>,
        lister: Arc<dyn RepoLister>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            index,
            lister,
            config,
        }
    }

    /// Fetch every recognized record of `did` and merge it into the index.
    /// Records written before a failure stay indexed.
    pub async fn backfill_did(
        &self,
        did: &Did,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        for collection in Collection::ALL {
            self.backfill_collection(did, collection, cancel, &mut report)
                .await?;
        }
        info!(
            "Backfilled {did}: {} fetched, {} written, {} stale, {} malformed",
            report.fetched, report.written, report.stale, report.malformed
        );
        Ok(report)
    }

    async fn backfill_collection(
        &self,
        did: &Did,
        collection: Collection,
        cancel: &CancellationToken,
        report: &mut BackfillReport,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        for _ in 0..self.config.max_pages_per_collection {
            if cancel.is_cancelled() {
                return Err(IndexerError::Cancelled);
            }
            let fetched = tokio::select! {
                () = cancel.cancelled() => return Err(IndexerError::Cancelled),
                page = self.lister.list_page(did, collection, cursor.as_deref()) => page,
            };
            let page = fetched.map_err(|err| match err {
                IndexerError::Cancelled => err,
                other => IndexerError::Source {
                    did: did.to_string(),
                    collection: collection.name(),
                    reason: other.to_string(),
                },
            })?;
            report.pages += 1;
            debug!(
                "{did} {}: page of {} records",
                collection.name(),
                page.records.len()
            );

            for record in page.records {
                report.fetched += 1;
                if let Err(err) = validate_rkey(&record.rkey) {
                    warn!("Skipping backfilled record of {did}: {err}");
                    report.malformed += 1;
                    continue;
                }
                let uri = at_uri(did, collection, &record.rkey);
                let write = RecordWrite {
                    did: did.clone(),
                    collection,
                    rkey: record.rkey,
                    cid: record.cid,
                    payload: record.value,
                    sequence: BACKFILL_SEQUENCE,
                };
                match self.index.upsert(write).await {
                    Ok(outcome) if outcome.wrote() => report.written += 1,
                    Ok(_) => report.stale += 1,
                    Err(err @ IndexError::Malformed(_)) => {
                        warn!("Skipping malformed record {uri}: {err}");
                        report.malformed += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            match page.cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
        warn!(
            "{did} {}: stopped after {} pages",
            collection.name(),
            self.config.max_pages_per_collection
        );
        Ok(())
    }

    /// Backfill each identity in turn. A failing identity is logged and
    /// counted; the sweep carries on with the next one.
    pub async fn backfill_all(
        &self,
        dids: impl IntoIterator<Item = Did>,
        cancel: &CancellationToken,
    ) -> BackfillSummary {
        let started = Instant::now();
        let mut summary = BackfillSummary::default();
        for did in dids {
            if cancel.is_cancelled() {
                break;
            }
            match self.backfill_did(&did, cancel).await {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.records_written += report.written;
                }
                Err(IndexerError::Cancelled) => break,
                Err(err) => {
                    warn!("Backfill of {did} failed: {err}");
                    summary.failed += 1;
                }
            }
        }
        summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "Backfill sweep finished: {} ok, {} failed, {} records in {}ms",
            summary.succeeded, summary.failed, summary.records_written, summary.duration_ms
        );
        summary
    }

    /// Fire-and-forget backfill of one identity, e.g. on first login.
    pub fn spawn_backfill(&self, did: Did, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            match orchestrator.backfill_did(&did, &cancel).await {
                Ok(_) => {}
                Err(IndexerError::Cancelled) => debug!("Backfill of {did} cancelled"),
                Err(err) => warn!("Backfill of {did} failed: {err}"),
            }
        })
    }

    /// Register `did` and, the first time it is seen, backfill it in the
    /// background. Returns `None` when the identity was already registered.
    pub fn register_and_backfill(
        &self,
        registry: &RegisteredIdentities,
        did: Did,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !registry.register(did.clone()) {
            debug!("{did} already registered, no backfill");
            return None;
        }
        info!("Registered {did}, starting backfill");
        Some(self.spawn_backfill(did, cancel))
    }

    /// After the startup delay, backfill every known and registered identity.
    pub fn spawn_startup_backfill(
        &self,
        registry: Arc<dyn IdentityRegistry>,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<BackfillSummary>> {
        let orchestrator = self.clone();
        let delay = self.config.startup_delay;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            let mut dids: BTreeSet<Did> = match orchestrator.index.known_identities().await {
                Ok(known) => known,
                Err(err) => {
                    warn!("Startup backfill could not list known identities: {err}");
                    BTreeSet::new()
                }
            };
            dids.extend(registry.registered());
            if dids.is_empty() {
                info!("Startup backfill: no identities to backfill");
                return Some(BackfillSummary::default());
            }
            info!("Startup backfill of {} identities", dids.len());
            Some(orchestrator.backfill_all(dids, &cancel).await)
        })
    }
}
