use arabica_protocol::Did;

/// Moderation decisions the feed honors. Lookups must be cheap; they run
/// once per candidate item on every refresh.
pub trait ModerationGate: Send + Sync {
    fn is_blacklisted(&self, did: &Did) -> bool;

    fn is_hidden(&self, uri: &str) -> bool;
}

/// Lets everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ModerationGate for AllowAll {
    fn is_blacklisted(&self, _did: &Did) -> bool {
        false
    }

    fn is_hidden(&self, _uri: &str) -> bool {
        false
    }
}
