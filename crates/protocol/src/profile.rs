use crate::Did;
use serde::{Deserialize, Serialize};

/// Display metadata for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub did: Did,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Profile {
    /// Profile with nothing but the identity, used when nothing is cached.
    #[must_use]
    pub fn bare(did: Did) -> Self {
        Self {
            did,
            handle: None,
            display_name: None,
            avatar: None,
        }
    }

    /// Best human label: display name, then handle, then the DID itself.
    #[must_use]
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.handle.as_deref())
            .unwrap_or_else(|| self.did.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCacheEntry {
    pub profile: Profile,
    pub fetched_at_ms: u64,
    pub ttl_ms: u64,
}

impl ProfileCacheEntry {
    #[must_use]
    pub fn new(profile: Profile, fetched_at_ms: u64, ttl_ms: u64) -> Self {
        Self {
            profile,
            fetched_at_ms,
            ttl_ms,
        }
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.fetched_at_ms.saturating_add(self.ttl_ms)
    }

    #[must_use]
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms()
    }
}
