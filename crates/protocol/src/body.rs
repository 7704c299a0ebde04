//! Typed record bodies.
//!
//! Payloads arrive as untyped JSON owned by someone else's repository, so the
//! decode is lenient per field: a field whose JSON type does not match the
//! lexicon (a number where a string belongs, an object where a number belongs)
//! is treated as absent rather than failing the whole record. Only a payload
//! that is not a JSON object at all is rejected as malformed.

use crate::{Collection, ProtocolError, Result};
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bean {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roast_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roaster_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Roaster {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grinder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grinder_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burr_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Brewer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brewer_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Brew {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bean_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grinder_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brewer_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grind_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coffee_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub water_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasting_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// A decoded record. Serializes externally tagged, so exactly one of
/// `brew`/`bean`/`roaster`/`grinder`/`brewer` is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordBody {
    Brew(Brew),
    Bean(Bean),
    Roaster(Roaster),
    Grinder(Grinder),
    Brewer(Brewer),
}

impl RecordBody {
    pub fn decode(collection: Collection, payload: &Value) -> Result<Self> {
        let Some(obj) = payload.as_object() else {
            return Err(ProtocolError::MalformedRecord {
                collection: collection.name(),
                reason: format!("expected object, got {}", json_kind(payload)),
            });
        };

        let body = match collection {
            Collection::Bean => RecordBody::Bean(Bean {
                name: text(obj, "name"),
                origin: text(obj, "origin"),
                roast_level: text(obj, "roastLevel"),
                process: text(obj, "process"),
                description: text(obj, "description"),
                roaster_ref: text(obj, "roasterRef"),
                created_at: text(obj, "createdAt"),
            }),
            Collection::Roaster => RecordBody::Roaster(Roaster {
                name: text(obj, "name"),
                location: text(obj, "location"),
                website: text(obj, "website"),
                description: text(obj, "description"),
                created_at: text(obj, "createdAt"),
            }),
            Collection::Grinder => RecordBody::Grinder(Grinder {
                name: text(obj, "name"),
                grinder_type: text(obj, "grinderType"),
                burr_type: text(obj, "burrType"),
                notes: text(obj, "notes"),
                created_at: text(obj, "createdAt"),
            }),
            Collection::Brewer => RecordBody::Brewer(Brewer {
                name: text(obj, "name"),
                brewer_type: text(obj, "brewerType"),
                description: text(obj, "description"),
                created_at: text(obj, "createdAt"),
            }),
            Collection::Brew => RecordBody::Brew(Brew {
                bean_ref: text(obj, "beanRef"),
                grinder_ref: text(obj, "grinderRef"),
                brewer_ref: text(obj, "brewerRef"),
                method: text(obj, "method"),
                grind_size: text(obj, "grindSize"),
                coffee_amount: number(obj, "coffeeAmount"),
                water_amount: number(obj, "waterAmount"),
                temperature: number(obj, "temperature"),
                time_seconds: number(obj, "timeSeconds"),
                tasting_notes: text(obj, "tastingNotes"),
                rating: number(obj, "rating"),
                created_at: text(obj, "createdAt"),
            }),
        };
        Ok(body)
    }

    #[must_use]
    pub fn collection(&self) -> Collection {
        match self {
            RecordBody::Brew(_) => Collection::Brew,
            RecordBody::Bean(_) => Collection::Bean,
            RecordBody::Roaster(_) => Collection::Roaster,
            RecordBody::Grinder(_) => Collection::Grinder,
            RecordBody::Brewer(_) => Collection::Brewer,
        }
    }

    #[must_use]
    pub fn created_at(&self) -> Option<&str> {
        match self {
            RecordBody::Brew(b) => b.created_at.as_deref(),
            RecordBody::Bean(b) => b.created_at.as_deref(),
            RecordBody::Roaster(r) => r.created_at.as_deref(),
            RecordBody::Grinder(g) => g.created_at.as_deref(),
            RecordBody::Brewer(b) => b.created_at.as_deref(),
        }
    }

    /// Present text fields keyed by their lexicon name, in lexicon order.
    /// Numeric brew fields are not displayable and are left out.
    #[must_use]
    pub fn text_fields(&self) -> Vec<(&'static str, &str)> {
        let pairs: Vec<(&'static str, Option<&String>)> = match self {
            RecordBody::Bean(b) => vec![
                ("name", b.name.as_ref()),
                ("origin", b.origin.as_ref()),
                ("roastLevel", b.roast_level.as_ref()),
                ("process", b.process.as_ref()),
                ("description", b.description.as_ref()),
                ("roasterRef", b.roaster_ref.as_ref()),
            ],
            RecordBody::Roaster(r) => vec![
                ("name", r.name.as_ref()),
                ("location", r.location.as_ref()),
                ("website", r.website.as_ref()),
                ("description", r.description.as_ref()),
            ],
            RecordBody::Grinder(g) => vec![
                ("name", g.name.as_ref()),
                ("grinderType", g.grinder_type.as_ref()),
                ("burrType", g.burr_type.as_ref()),
                ("notes", g.notes.as_ref()),
            ],
            RecordBody::Brewer(b) => vec![
                ("name", b.name.as_ref()),
                ("brewerType", b.brewer_type.as_ref()),
                ("description", b.description.as_ref()),
            ],
            RecordBody::Brew(b) => vec![
                ("beanRef", b.bean_ref.as_ref()),
                ("grinderRef", b.grinder_ref.as_ref()),
                ("brewerRef", b.brewer_ref.as_ref()),
                ("method", b.method.as_ref()),
                ("grindSize", b.grind_size.as_ref()),
                ("tastingNotes", b.tasting_notes.as_ref()),
            ],
        };
        pairs
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v.as_str())))
            .collect()
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    let trimmed = obj.get(key)?.as_str()?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key)?.as_f64().filter(|n| n.is_finite())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
