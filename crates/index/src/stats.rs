use arabica_protocol::Collection;
use serde::Serialize;
use std::collections::BTreeMap;

/// Point-in-time counts for the metrics gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub known_identities: usize,
    pub records: usize,
    pub per_collection: BTreeMap<Collection, usize>,
}

impl IndexStats {
    pub(crate) fn add_record(&mut self, collection: Collection) {
        self.records += 1;
        *self.per_collection.entry(collection).or_insert(0) += 1;
    }
}
