//! # Arabica Indexer
//!
//! Writers of the record index.
//!
//! ```text
//! Jetstream ──> FirehoseConsumer ──┐
//!                                  ├──> RecordIndex
//! PDS listRecords ──> Backfill ────┘
//! ```
//!
//! The consumer tails the commit stream for recognized collections and
//! relevant identities. The backfill orchestrator pulls an identity's full
//! current repository on demand; `register_and_backfill` does so when an
//! identity first signs up.

mod backfill;
mod backoff;
mod consumer;
mod error;
mod health;
mod registry;
mod transport;
mod xrpc;

pub use backfill::{
    BackfillConfig, BackfillOrchestrator, BackfillReport, BackfillSummary, BACKFILL_SEQUENCE,
};
pub use backoff::BackoffConfig;
pub use consumer::{ConsumerConfig, FirehoseConsumer};
pub use error::{IndexerError, Result};
pub use health::{ConsumerHealth, ConsumerState};
pub use registry::{IdentityRegistry, RegisteredIdentities};
pub use transport::{FrameStream, JetstreamTransport, Transport, DEFAULT_JETSTREAM_ENDPOINT};
pub use xrpc::{
    DidResolver, ListedRecord, RecordPage, RepoLister, XrpcRepoLister, DEFAULT_PLC_DIRECTORY,
};
