//! # Arabica Feed
//!
//! Public "recent activity" view with a short-lived shared snapshot.

mod cache;
mod error;
mod moderation;
mod profiles;
mod time;

pub use cache::{FeedCache, FeedConfig, FeedItem, DEFAULT_FEED_LIMIT};
pub use error::{FeedError, Result};
pub use moderation::{AllowAll, ModerationGate};
pub use profiles::{ProfileFetcher, XrpcProfileFetcher, DEFAULT_APPVIEW};
pub use time::{record_timestamp, relative_time_label};
