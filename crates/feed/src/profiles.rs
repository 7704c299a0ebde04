use crate::Result;
use arabica_protocol::{Did, Profile};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

pub const DEFAULT_APPVIEW: &str = "https://public.api.bsky.app";

/// Source of profile data for authors missing from the profile cache.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch_profile(&self, did: &Did) -> Result<Profile>;
}

/// `app.bsky.actor.getProfile` against a public AppView.
pub struct XrpcProfileFetcher {
    client: reqwest::Client,
    endpoint: Url,
}

impl XrpcProfileFetcher {
    pub fn new(appview: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("arabica-feed/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let endpoint = Url::parse(appview)?.join("/xrpc/app.bsky.actor.getProfile")?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ProfileFetcher for XrpcProfileFetcher {
    async fn fetch_profile(&self, did: &Did) -> Result<Profile> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("actor", did.as_str());
        let profile = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Profile>()
            .await?;
        Ok(profile)
    }
}
