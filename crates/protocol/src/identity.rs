use crate::{ProtocolError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Decentralized identifier of a user repository, e.g. `did:plc:abc123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let mut parts = trimmed.splitn(3, ':');
        let scheme = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        let ident = parts.next().unwrap_or_default();
        if scheme != "did" || method.is_empty() || ident.is_empty() {
            return Err(ProtocolError::InvalidDid(raw.to_string()));
        }
        if !method.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(ProtocolError::InvalidDid(raw.to_string()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidDid(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// DID method (`plc`, `web`, ...).
    #[must_use]
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// Method-specific identifier, the part after `did:<method>:`.
    #[must_use]
    pub fn method_id(&self) -> &str {
        self.0.splitn(3, ':').nth(2).unwrap_or_default()
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plc_and_web() {
        let plc = Did::parse("did:plc:ewvi7nxzyoun6zhxrhs64oiz").unwrap();
        assert_eq!(plc.method(), "plc");
        assert_eq!(plc.method_id(), "ewvi7nxzyoun6zhxrhs64oiz");

        let web = Did::parse(" did:web:example.com ").unwrap();
        assert_eq!(web.as_str(), "did:web:example.com");
        assert_eq!(web.method(), "web");
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "plc:abc", "did::abc", "did:plc:", "did:PLC:abc", "did:plc:a b"] {
            assert!(Did::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn deserialize_validates() {
        let ok: Did = serde_json::from_str("\"did:plc:abc\"").unwrap();
        assert_eq!(ok.as_str(), "did:plc:abc");
        assert!(serde_json::from_str::<Did>("\"nope\"").is_err());
    }
}
