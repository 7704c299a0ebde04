//! Staleness-tolerant snapshot of recent activity.
//!
//! Readers share one snapshot under a read lock. A refresh runs under a
//! separate mutex and re-checks freshness first, so a burst of requests on
//! an expired snapshot makes a single index fetch.

use crate::moderation::{AllowAll, ModerationGate};
use crate::profiles::ProfileFetcher;
use crate::time::{record_timestamp, relative_time_label};
use crate::{FeedError, Result};
use arabica_index::{IndexError, RecordIndex};
use arabica_protocol::{unix_ms_now, Collection, Did, Profile, ProfileCacheEntry, RecordBody};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Page size used when a feed is configured with a limit of 0.
pub const DEFAULT_FEED_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct FeedConfig {
    pub ttl: Duration,
    /// Items per page; 0 applies [`DEFAULT_FEED_LIMIT`].
    pub limit: usize,
    /// Lifetime of profiles fetched while building the feed.
    pub profile_ttl: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            limit: DEFAULT_FEED_LIMIT,
            profile_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedItem {
    pub uri: String,
    pub did: Did,
    pub collection: Collection,
    pub rkey: String,
    pub record: RecordBody,
    pub author: Profile,
    pub created_at: DateTime<Utc>,
    pub relative_time: String,
    pub sequence: u64,
}

struct Snapshot {
    items: Arc<Vec<FeedItem>>,
    expires_at: Instant,
}

pub struct FeedCache {
    index: Arc<dyn RecordIndex>,
    moderation: Arc<dyn ModerationGate>,
    profiles: Option<Arc<dyn ProfileFetcher>>,
    config: FeedConfig,
    snapshot: RwLock<Option<Snapshot>>,
    refresh: Mutex<()>,
}

impl FeedCache {
    pub fn new(index: Arc<dyn RecordIndex>, config: FeedConfig) -> Self {
        Self {
            index,
            moderation: Arc::new(AllowAll),
            profiles: None,
            config,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_moderation(mut self, gate: Arc<dyn ModerationGate>) -> Self {
        self.moderation = gate;
        self
    }

    #[must_use]
    pub fn with_profile_fetcher(mut self, fetcher: Arc<dyn ProfileFetcher>) -> Self {
        self.profiles = Some(fetcher);
        self
    }

    /// Newest activity, at most `limit` items. Serves the cached snapshot while
    /// it is fresh; falls back to a stale one when a refresh fails.
    pub async fn get_feed(&self) -> Result<Arc<Vec<FeedItem>>> {
        if let Some(items) = self.fresh().await {
            return Ok(items);
        }

        let _refresh = self.refresh.lock().await;
        if let Some(items) = self.fresh().await {
            return Ok(items);
        }

        match self.build().await {
            Ok(items) => {
                let items = Arc::new(items);
                debug!("Feed refreshed with {} items", items.len());
                *self.snapshot.write().await = Some(Snapshot {
                    items: Arc::clone(&items),
                    expires_at: Instant::now() + self.config.ttl,
                });
                Ok(items)
            }
            Err(err) => match self.snapshot.read().await.as_ref() {
                Some(stale) => {
                    warn!("Feed refresh failed, serving stale snapshot: {err}");
                    Ok(Arc::clone(&stale.items))
                }
                None => Err(FeedError::NotReady(err)),
            },
        }
    }

    /// Expire the snapshot so the next read rebuilds it. The old items remain
    /// available as a fallback.
    pub async fn invalidate(&self) {
        if let Some(snapshot) = self.snapshot.write().await.as_mut() {
            snapshot.expires_at = Instant::now();
            info!("Feed cache invalidated");
        }
    }

    async fn fresh(&self) -> Option<Arc<Vec<FeedItem>>> {
        let guard = self.snapshot.read().await;
        let snapshot = guard.as_ref()?;
        (Instant::now() < snapshot.expires_at && !snapshot.items.is_empty())
            .then(|| Arc::clone(&snapshot.items))
    }

    async fn build(&self) -> std::result::Result<Vec<FeedItem>, IndexError> {
        let limit = match self.config.limit {
            0 => DEFAULT_FEED_LIMIT,
            limit => limit,
        };
        // Over-fetch so moderation and undecodable rows do not starve the page.
        let records = self
            .index
            .recent_across_all(limit.saturating_mul(2))
            .await?;

        let now = Utc::now();
        let mut authors: HashMap<Did, Profile> = HashMap::new();
        let mut items = Vec::with_capacity(limit);
        for record in records {
            if items.len() >= limit {
                break;
            }
            let uri = record.uri();
            if self.moderation.is_blacklisted(&record.did) || self.moderation.is_hidden(&uri) {
                debug!("Feed skips moderated {uri}");
                continue;
            }
            let body = match record.body() {
                Ok(body) => body,
                Err(err) => {
                    debug!("Feed skips undecodable {uri}: {err}");
                    continue;
                }
            };

            let author = match authors.get(&record.did) {
                Some(profile) => profile.clone(),
                None => {
                    let profile = self.author(&record.did).await;
                    authors.insert(record.did.clone(), profile.clone());
                    profile
                }
            };
            let created_at = record_timestamp(body.created_at(), record.indexed_at_ms);
            items.push(FeedItem {
                uri,
                did: record.did,
                collection: record.collection,
                rkey: record.rkey,
                record: body,
                author,
                created_at,
                relative_time: relative_time_label(created_at, now),
                sequence: record.sequence,
            });
        }
        Ok(items)
    }

    /// Cached profile, else a fetched one (stored back into the cache), else
    /// a bare profile carrying only the DID.
    async fn author(&self, did: &Did) -> Profile {
        match self.index.get_profile(did).await {
            Ok(Some(entry)) => return entry.profile,
            Ok(None) => {}
            Err(err) => warn!("Profile cache lookup failed for {did}: {err}"),
        }
        let Some(fetcher) = &self.profiles else {
            return Profile::bare(did.clone());
        };
        match fetcher.fetch_profile(did).await {
            Ok(profile) => {
                let ttl_ms = u64::try_from(self.config.profile_ttl.as_millis()).unwrap_or(u64::MAX);
                let entry = ProfileCacheEntry::new(profile.clone(), unix_ms_now(), ttl_ms);
                if let Err(err) = self.index.put_profile(entry).await {
                    warn!("Failed to cache profile for {did}: {err}");
                }
                profile
            }
            Err(err) => {
                warn!("Profile fetch failed for {did}: {err}");
                Profile::bare(did.clone())
            }
        }
    }
}
