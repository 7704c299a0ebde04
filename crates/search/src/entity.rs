//! Per-collection suggestion rules.

use crate::normalize::{extract_domain, fuzzy_name, normalize_text, strip_punctuation};
use crate::{Result, SearchError};
use arabica_protocol::Collection;
use std::collections::BTreeMap;

/// Present text fields of one record, keyed by lexicon field name.
pub type Fields = BTreeMap<String, String>;

pub struct EntityConfig {
    pub collection: Collection,
    /// Fields copied onto a suggestion, in display order.
    pub display_fields: &'static [&'static str],
    /// Fields the query is matched against.
    pub search_fields: &'static [&'static str],
    pub name_field: &'static str,
    dedup_key: fn(&Fields) -> String,
}

impl EntityConfig {
    pub fn for_collection(collection: Collection) -> Result<&'static EntityConfig> {
        match collection {
            Collection::Roaster => Ok(&ROASTER),
            Collection::Bean => Ok(&BEAN),
            Collection::Grinder => Ok(&GRINDER),
            Collection::Brewer => Ok(&BREWER),
            Collection::Brew => Err(SearchError::UnsupportedCollection(collection)),
        }
    }

    #[must_use]
    pub fn dedup_key(&self, fields: &Fields) -> String {
        (self.dedup_key)(fields)
    }

    /// Number of usable display fields. A website only counts when it
    /// actually names a domain.
    #[must_use]
    pub fn completeness(&self, fields: &Fields) -> usize {
        self.display_fields
            .iter()
            .filter(|&&key| match fields.get(key) {
                Some(value) if key == "website" => extract_domain(value).is_some(),
                Some(value) => !value.trim().is_empty(),
                None => false,
            })
            .count()
    }

    #[must_use]
    pub fn display_name<'a>(&self, fields: &'a Fields) -> Option<&'a str> {
        fields
            .get(self.name_field)
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
    }
}

fn field<'a>(fields: &'a Fields, key: &str) -> &'a str {
    fields.get(key).map_or("", String::as_str)
}

fn exact(fields: &Fields, key: &str) -> String {
    normalize_text(field(fields, key))
}

// Website is left out of the key: most records omit it, and including it
// would split otherwise identical roasters.
fn roaster_key(fields: &Fields) -> String {
    format!(
        "{}|{}",
        fuzzy_name(field(fields, "name")),
        strip_punctuation(&exact(fields, "location"))
    )
}

fn bean_key(fields: &Fields) -> String {
    format!(
        "{}|{}|{}",
        exact(fields, "name"),
        exact(fields, "origin"),
        exact(fields, "process")
    )
}

fn grinder_key(fields: &Fields) -> String {
    format!(
        "{}|{}|{}",
        exact(fields, "name"),
        exact(fields, "grinderType"),
        exact(fields, "burrType")
    )
}

fn brewer_key(fields: &Fields) -> String {
    format!("{}|{}", exact(fields, "name"), exact(fields, "brewerType"))
}

static ROASTER: EntityConfig = EntityConfig {
    collection: Collection::Roaster,
    display_fields: &["name", "location", "website", "description"],
    search_fields: &["name", "location"],
    name_field: "name",
    dedup_key: roaster_key,
};

static BEAN: EntityConfig = EntityConfig {
    collection: Collection::Bean,
    display_fields: &["name", "origin", "roastLevel", "process", "description"],
    search_fields: &["name", "origin"],
    name_field: "name",
    dedup_key: bean_key,
};

static GRINDER: EntityConfig = EntityConfig {
    collection: Collection::Grinder,
    display_fields: &["name", "grinderType", "burrType", "notes"],
    search_fields: &["name"],
    name_field: "name",
    dedup_key: grinder_key,
};

static BREWER: EntityConfig = EntityConfig {
    collection: Collection::Brewer,
    display_fields: &["name", "brewerType", "description"],
    search_fields: &["name", "brewerType"],
    name_field: "name",
    dedup_key: brewer_key,
};
