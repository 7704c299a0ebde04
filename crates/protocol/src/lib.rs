//! # Arabica Protocol
//!
//! Types shared by every arabica crate: identities, collections, indexed
//! records, the typed per-collection record bodies and the Jetstream wire
//! frames the firehose consumer decodes.

mod body;
mod collection;
mod error;
mod identity;
mod jetstream;
mod profile;
mod record;

pub use body::{Bean, Brew, Brewer, Grinder, RecordBody, Roaster};
pub use collection::{Collection, NSID_PREFIX};
pub use error::{ProtocolError, Result};
pub use identity::Did;
pub use jetstream::{decode_frame, CommitEvent, CommitOperation, StreamEvent};
pub use profile::{Profile, ProfileCacheEntry};
pub use record::{at_uri, parse_at_uri, validate_rkey, IndexedRecord, RecordWrite};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in unix milliseconds; saturates instead of failing on clock skew.
#[must_use]
pub fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
