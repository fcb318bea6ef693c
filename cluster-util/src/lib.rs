//! Message passing between the processes of an inference job.
//!
//! Every process owns one [`Endpoint`](endpoint::Endpoint) holding a
//! framed point-to-point link to each peer. Two layers run on top of
//! the same links:
//!
//! - collectives ([`ClusterSync`]): barrier, all-gather, all-reduce;
//! - decentralized publish/subscribe channels ([`PubSub`]).
//!
//! Links are either in-memory pipes (a whole cluster inside one OS
//! process, see [`local`]) or TCP streams (see [`tcp`]). Link I/O runs
//! as tasks on a small tokio runtime owned by each endpoint; the API
//! above it blocks, so callers stay on plain threads.

/// length-prefixed wire frames
pub mod frame;

/// point-to-point links carrying frames
pub mod link;

/// per-process message endpoint and its link tasks
pub mod endpoint;

/// barrier / all-gather / all-reduce
pub mod collective;

/// publish/subscribe channels
pub mod pubsub;

/// an in-process cluster, one thread per rank
pub mod local;

/// TCP mesh bootstrap
pub mod tcp;

pub use collective::ClusterSync;
pub use endpoint::Endpoint;
pub use pubsub::{MessageHandler, PubSub};
