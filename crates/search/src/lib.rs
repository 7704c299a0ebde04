//! # Arabica Search
//!
//! Typeahead suggestions for beans, roasters, grinders and brewers.
//!
//! Many users enter the same real-world roaster with small differences
//! ("Counter Culture" vs "Counter Culture Coffee"). Records are clustered by a
//! per-collection dedup key, the most complete record represents the cluster,
//! and clusters rank by how many distinct users contributed to them.

mod entity;
mod error;
pub mod normalize;
mod suggest;

pub use entity::{EntityConfig, Fields};
pub use error::{Result, SearchError};
pub use suggest::{
    rank_suggestions, Suggestion, SuggestionEngine, DEFAULT_SUGGESTION_LIMIT, MIN_QUERY_CHARS,
};
