use crate::entity::{EntityConfig, Fields};
use crate::Result;
use arabica_index::RecordIndex;
use arabica_protocol::{Collection, Did, IndexedRecord};
use log::debug;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub const DEFAULT_SUGGESTION_LIMIT: usize = 10;
pub const MIN_QUERY_CHARS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub name: String,
    /// at-uri of the record chosen to represent the cluster.
    pub source_ref: String,
    pub fields: Fields,
    /// Distinct identities that contributed a matching record.
    pub count: usize,
}

struct Cluster {
    representative: Fields,
    source_ref: String,
    completeness: usize,
    contributors: HashSet<Did>,
}

/// Typeahead over one collection. Holds no state of its own: every call
/// re-reads the index.
#[derive(Clone)]
pub struct SuggestionEngine {
    index: Arc<dyn RecordIndex>,
    default_limit: usize,
}

impl SuggestionEngine {
    pub fn new(index: Arc<dyn RecordIndex>) -> Self {
        Self {
            index,
            default_limit: DEFAULT_SUGGESTION_LIMIT,
        }
    }

    #[must_use]
    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    /// Ranked, deduplicated suggestions. A `limit` of 0 applies the default.
    /// A query under two characters is empty for every collection, including
    /// ones that have no suggestions.
    pub async fn search(
        &self,
        collection: Collection,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Suggestion>> {
        if query.trim().chars().count() < MIN_QUERY_CHARS {
            return Ok(Vec::new());
        }
        let config = EntityConfig::for_collection(collection)?;
        let records = self.index.list_by_collection(collection).await?;
        let limit = if limit == 0 { self.default_limit } else { limit };
        Ok(rank_suggestions(config, &records, query, limit))
    }
}

fn record_fields(record: &IndexedRecord) -> Option<Fields> {
    match record.body() {
        Ok(body) => Some(
            body.text_fields()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        ),
        Err(err) => {
            debug!("Ignoring undecodable {}: {err}", record.uri());
            None
        }
    }
}

fn matches_query(config: &EntityConfig, fields: &Fields, needle: &str) -> bool {
    config.search_fields.iter().any(|key| {
        fields
            .get(*key)
            .is_some_and(|value| value.to_lowercase().contains(needle))
    })
}

/// Cluster matching records by dedup key and rank the clusters.
/// `records` must be in the order they were first seen.
#[must_use]
pub fn rank_suggestions(
    config: &EntityConfig,
    records: &[IndexedRecord],
    query: &str,
    limit: usize,
) -> Vec<Suggestion> {
    let needle = query.trim().to_lowercase();
    if needle.chars().count() < MIN_QUERY_CHARS {
        return Vec::new();
    }

    let mut clusters: Vec<Cluster> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();

    for record in records {
        let Some(fields) = record_fields(record) else {
            continue;
        };
        if config.display_name(&fields).is_none() || !matches_query(config, &fields, &needle) {
            continue;
        }
        let key = config.dedup_key(&fields);
        let completeness = config.completeness(&fields);
        match by_key.get(&key) {
            Some(&slot) => {
                let cluster = &mut clusters[slot];
                cluster.contributors.insert(record.did.clone());
                if completeness > cluster.completeness {
                    cluster.completeness = completeness;
                    cluster.source_ref = record.uri();
                    cluster.representative = fields;
                }
            }
            None => {
                by_key.insert(key, clusters.len());
                clusters.push(Cluster {
                    source_ref: record.uri(),
                    completeness,
                    contributors: HashSet::from([record.did.clone()]),
                    representative: fields,
                });
            }
        }
    }

    let mut suggestions: Vec<(bool, Suggestion)> = clusters
        .into_iter()
        .filter_map(|cluster| {
            let name = config.display_name(&cluster.representative)?.to_string();
            let prefix = name.to_lowercase().starts_with(&needle);
            let fields = config
                .display_fields
                .iter()
                .filter_map(|key| {
                    cluster
                        .representative
                        .get(*key)
                        .map(|value| ((*key).to_string(), value.clone()))
                })
                .collect();
            Some((
                prefix,
                Suggestion {
                    name,
                    source_ref: cluster.source_ref,
                    fields,
                    count: cluster.contributors.len(),
                },
            ))
        })
        .collect();

    suggestions.sort_by(|(a_prefix, a), (b_prefix, b)| {
        b_prefix
            .cmp(a_prefix)
            .then(b.count.cmp(&a.count))
            .then_with(|| compare_names(&a.name, &b.name))
    });
    suggestions.truncate(limit);
    suggestions.into_iter().map(|(_, s)| s).collect()
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
