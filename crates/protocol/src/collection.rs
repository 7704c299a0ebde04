use crate::{ProtocolError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Lexicon namespace every recognized collection lives under.
pub const NSID_PREFIX: &str = "social.arabica.alpha.";

/// Record types the indexer recognizes. Anything else on the stream is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Brew,
    Bean,
    Roaster,
    Grinder,
    Brewer,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Brew,
        Collection::Bean,
        Collection::Roaster,
        Collection::Grinder,
        Collection::Brewer,
    ];

    #[must_use]
    pub fn nsid(self) -> &'static str {
        match self {
            Collection::Brew => "social.arabica.alpha.brew",
            Collection::Bean => "social.arabica.alpha.bean",
            Collection::Roaster => "social.arabica.alpha.roaster",
            Collection::Grinder => "social.arabica.alpha.grinder",
            Collection::Brewer => "social.arabica.alpha.brewer",
        }
    }

    /// Short name, the last NSID segment.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Collection::Brew => "brew",
            Collection::Bean => "bean",
            Collection::Roaster => "roaster",
            Collection::Grinder => "grinder",
            Collection::Brewer => "brewer",
        }
    }

    #[must_use]
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.nsid() == nsid)
    }

    /// Accepts either the full NSID or the short name.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        Self::from_nsid(trimmed)
            .or_else(|| {
                Self::ALL
                    .into_iter()
                    .find(|c| c.name().eq_ignore_ascii_case(trimmed))
            })
            .ok_or_else(|| ProtocolError::UnknownCollection(raw.to_string()))
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nsid())
    }
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.nsid())
    }
}

impl<'de> Deserialize<'de> for Collection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nsid_round_trip_for_every_collection() {
        for c in Collection::ALL {
            assert!(c.nsid().starts_with(NSID_PREFIX));
            assert_eq!(Collection::from_nsid(c.nsid()), Some(c));
        }
    }

    #[test]
    fn parse_accepts_short_names_and_rejects_foreign_nsids() {
        assert_eq!(Collection::parse("Roaster").unwrap(), Collection::Roaster);
        assert!(Collection::parse("app.bsky.feed.post").is_err());
        assert_eq!(Collection::from_nsid("app.bsky.feed.post"), None);
    }
}
