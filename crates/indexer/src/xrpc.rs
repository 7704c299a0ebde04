//! Point-in-time repository listing over XRPC.
//!
//! Resolves an identity's PDS from its DID document, then pages through
//! `com.atproto.repo.listRecords`.

use crate::{IndexerError, Result};
use arabica_protocol::{parse_at_uri, Collection, Did};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use url::Url;

pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";

const PDS_SERVICE_ID: &str = "#atproto_pds";

/// Resolved endpoints are re-resolved after this long; accounts can move PDS.
const PDS_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const PDS_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ListedRecord {
    pub rkey: String,
    pub cid: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<ListedRecord>,
    /// Opaque continuation; `None` on the last page.
    pub cursor: Option<String>,
}

/// Source of an identity's current records, one collection page at a time.
#[async_trait]
pub trait RepoLister: Send + Sync {
    async fn list_page(
        &self,
        did: &Did,
        collection: Collection,
        cursor: Option<&str>,
    ) -> Result<RecordPage>;
}

#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default)]
    service: Vec<DidService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidService {
    id: String,
    service_endpoint: Value,
}

fn pds_from_document(doc: &DidDocument) -> Option<Url> {
    doc.service
        .iter()
        .find(|svc| svc.id.ends_with(PDS_SERVICE_ID))
        .and_then(|svc| svc.service_endpoint.as_str())
        .and_then(|endpoint| Url::parse(endpoint).ok())
}

/// Where the DID document for `did` lives.
fn did_document_url(plc_directory: &Url, did: &Did) -> Result<Url> {
    match did.method() {
        // A bare "did:..." reference would parse as an absolute URL.
        "plc" => Ok(plc_directory.join(&format!("./{did}"))?),
        "web" => {
            let mut parts = did.method_id().split(':');
            let host = parts
                .next()
                .filter(|h| !h.is_empty())
                .map(|h| h.replace("%3A", ":"))
                .ok_or_else(|| IndexerError::Resolve {
                    did: did.to_string(),
                    reason: "empty host".to_string(),
                })?;
            let path: Vec<&str> = parts.collect();
            let url = if path.is_empty() {
                format!("https://{host}/.well-known/did.json")
            } else {
                format!("https://{host}/{}/did.json", path.join("/"))
            };
            Ok(Url::parse(&url)?)
        }
        other => Err(IndexerError::Resolve {
            did: did.to_string(),
            reason: format!("unsupported DID method '{other}'"),
        }),
    }
}

/// Bounded DID → PDS map with per-entry expiry.
struct PdsCache {
    entries: HashMap<Did, (Url, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl PdsCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    fn get(&self, did: &Did, now: Instant) -> Option<Url> {
        self.entries
            .get(did)
            .filter(|(_, resolved_at)| now.saturating_duration_since(*resolved_at) < self.ttl)
            .map(|(url, _)| url.clone())
    }

    fn insert(&mut self, did: Did, url: Url, now: Instant) {
        if !self.entries.contains_key(&did) && self.entries.len() >= self.capacity {
            let ttl = self.ttl;
            self.entries
                .retain(|_, (_, resolved_at)| now.saturating_duration_since(*resolved_at) < ttl);
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, (_, resolved_at))| *resolved_at)
                    .map(|(did, _)| did.clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(did, (url, now));
    }
}

/// DID → PDS endpoint resolution with a bounded, expiring cache.
pub struct DidResolver {
    client: reqwest::Client,
    plc_directory: Url,
    cache: RwLock<PdsCache>,
}

impl DidResolver {
    pub fn new(client: reqwest::Client, plc_directory: &str) -> Result<Self> {
        let mut plc_directory = Url::parse(plc_directory)?;
        if !plc_directory.path().ends_with('/') {
            let path = format!("{}/", plc_directory.path());
            plc_directory.set_path(&path);
        }
        Ok(Self {
            client,
            plc_directory,
            cache: RwLock::new(PdsCache::new(PDS_CACHE_CAPACITY, PDS_CACHE_TTL)),
        })
    }

    pub async fn resolve_pds(&self, did: &Did) -> Result<Url> {
        if let Some(url) = self.cache.read().await.get(did, Instant::now()) {
            return Ok(url);
        }

        let doc_url = did_document_url(&self.plc_directory, did)?;
        debug!("Resolving {did} via {doc_url}");
        let doc: DidDocument = self
            .client
            .get(doc_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let pds = pds_from_document(&doc).ok_or_else(|| IndexerError::Resolve {
            did: did.to_string(),
            reason: "no #atproto_pds service in DID document".to_string(),
        })?;

        self.cache
            .write()
            .await
            .insert(did.clone(), pds.clone(), Instant::now());
        Ok(pds)
    }
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    records: Vec<ListRecordsEntry>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecordsEntry {
    uri: String,
    cid: String,
    value: Value,
}

pub struct XrpcRepoLister {
    client: reqwest::Client,
    resolver: DidResolver,
    page_size: u32,
}

impl XrpcRepoLister {
    pub fn new(plc_directory: &str, page_size: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("arabica-indexer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            resolver: DidResolver::new(client.clone(), plc_directory)?,
            client,
            page_size: page_size.clamp(1, 100),
        })
    }
}

#[async_trait]
impl RepoLister for XrpcRepoLister {
    async fn list_page(
        &self,
        did: &Did,
        collection: Collection,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let pds = self.resolver.resolve_pds(did).await?;
        let mut url = pds.join("/xrpc/com.atproto.repo.listRecords")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("repo", did.as_str())
                .append_pair("collection", collection.nsid())
                .append_pair("limit", &self.page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let response: ListRecordsResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let records = response
            .records
            .into_iter()
            .filter_map(|entry| {
                let (_, _, rkey) = parse_at_uri(&entry.uri)?;
                Some(ListedRecord {
                    rkey,
                    cid: entry.cid,
                    value: entry.value,
                })
            })
            .collect();
        Ok(RecordPage {
            records,
            cursor: response.cursor.filter(|c| !c.is_empty()),
        })
    }
}
