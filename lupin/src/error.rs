use std::fmt;

/// Fatal conditions of a sampling run.
///
/// Both variants are raised identically on every rank, since they are
/// decided on replicated state; callers find them with
/// `anyhow::Error::downcast_ref::<SamplerError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    /// The topic tree grew past the configured limit.
    TopicLimitExceeded {
        /// Number of tree nodes after the refresh
        num_nodes: usize,
        /// Configured `topic_limit`
        limit: usize,
    },

    /// Two aggregation paths produced different count tables.
    InconsistentCounts {
        level: usize,
        topic: usize,
        word: usize,
        /// Count from the all-reduce path
        allreduce: u64,
        /// Count from the publish/subscribe path
        pubsub: u64,
    },
}

impl fmt::Display for SamplerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerError::TopicLimitExceeded { num_nodes, limit } => write!(
                f,
                "there are too many topics: {num_nodes} tree nodes exceed the limit of {limit}"
            ),
            SamplerError::InconsistentCounts {
                level,
                topic,
                word,
                allreduce,
                pubsub,
            } => write!(
                f,
                "inconsistent counts at level {level}, topic {topic}, word {word}: \
                 all-reduce gave {allreduce}, pub/sub gave {pubsub}"
            ),
        }
    }
}

impl std::error::Error for SamplerError {}
