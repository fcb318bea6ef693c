//! Hierarchical LDA fitted by distributed, partially collapsed Gibbs
//! sampling.
//!
//! Documents live on a path of a topic tree drawn from the nested
//! Chinese restaurant process, and each token sits on one level of its
//! path. Every rank samples its own shard of documents on a rayon pool.
//! Well-populated nodes are *instantiated*: between refreshes their
//! word distributions are held fixed, so threads and ranks can sample
//! them independently. The remaining nodes stay *collapsed* and are
//! scored with live counts. A periodic refresh merges the ranks' trees,
//! aggregates the count table and recomputes the distributions.

/// sampler errors other ranks agree on
pub mod error;

/// run configuration
pub mod options;

/// bag-of-words documents: loading, simulation and sharding
pub mod corpus;

/// per-document sampling state behind per-document locks
pub mod document;

/// replicated topic tree with local growth and deterministic merge
pub mod tree;

/// live per-node word counts and their dense snapshot
pub mod count_store;

/// immutable topic-word distributions between refreshes
pub mod generation;

/// cluster-wide count aggregation by all-reduce or publish/subscribe
pub mod aggregation;

/// path and level resampling
pub mod sampler;

mod refresh;

/// staged warm start
pub mod warm_start;

mod summary;

pub use corpus::Corpus;
pub use error::SamplerError;
pub use generation::{Generation, PhiPolicy};
pub use options::{Aggregation, SamplerOptions};
pub use sampler::{ResampleMode, Sampler};
pub use warm_start::{Activation, WarmStartReport};
