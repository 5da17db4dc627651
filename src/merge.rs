//! Merging of duplicate works: collapsing duplicate chains within one source, and
//! presenting the works linked into a merge container as one episode list.

pub mod chain;
pub mod dedupe;

pub use chain::{Chain, ChainResolver, MergeOutcome};
pub use dedupe::select;
