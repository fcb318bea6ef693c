use crate::aggregation::*;
use crate::count_store::DenseCounts;
use crate::error::SamplerError;
use crate::generation::{Generation, PhiPolicy};
use crate::options::Aggregation;
use crate::sampler::Sampler;
use crate::tree::TreeDelta;

use cluster_util::ClusterSync;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;

impl Sampler {
    /// Synchronize the cluster and swap in a new generation.
    ///
    /// Collective: every rank must call it the same number of times.
    /// No sampling may run concurrently.
    ///
    /// 1. merge every rank's tree changes and compress the tree
    /// 2. move document paths to the new numbering
    /// 3. aggregate the count table across ranks and rebuild it
    /// 4. recompute `phi` under the new instantiation boundary
    pub fn refresh(&mut self) -> anyhow::Result<()> {
        let timer = Instant::now();
        let rank = self.rank();

        let gathered = self.endpoint.all_gather(&self.tree.take_delta().encode())?;
        let deltas = gathered
            .iter()
            .map(|bytes| TreeDelta::decode(bytes))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let perm = self.tree.compress(&deltas, rank)?;

        self.docs.permute_paths(&perm)?;
        let num_instantiated = self.tree.num_instantiated();
        self.endpoint.barrier()?;

        let snapshot = self.tree.snapshot();
        let local = DenseCounts::from_documents(
            self.vocab_size,
            &snapshot.nodes_per_level,
            self.docs.iter_mut().map(|doc| &*doc),
        )?;
        let global = self.aggregate(&local)?;
        self.counts.rebuild(&global)?;

        let policy = if self.options.sample_phi {
            PhiPolicy::Sample {
                seed: self.options.seed,
            }
        } else {
            PhiPolicy::PlugIn
        };
        let generation = Generation::compute(
            self.generation.id + 1,
            &global,
            num_instantiated,
            &self.options.beta,
            policy,
        )?;
        self.generation = Arc::new(generation);
        self.num_refreshes += 1;

        debug!(
            "rank {} refresh {} took {:.3}s, {} nodes",
            rank,
            self.num_refreshes,
            timer.elapsed().as_secs_f32(),
            snapshot.num_nodes
        );

        Ok(())
    }

    /// Fails with [`SamplerError::TopicLimitExceeded`] once the tree
    /// has outgrown the topic limit. The tree is replicated, so every
    /// rank fails at the same refresh.
    pub(crate) fn check_topic_limit(&self) -> anyhow::Result<()> {
        let num_nodes = self.tree.snapshot().num_nodes;
        if num_nodes > self.options.topic_limit {
            return Err(SamplerError::TopicLimitExceeded {
                num_nodes,
                limit: self.options.topic_limit,
            }
            .into());
        }
        Ok(())
    }

    fn aggregate(&self, local: &DenseCounts) -> anyhow::Result<DenseCounts> {
        let ret = match self.options.aggregation {
            Aggregation::AllReduce => reduce_counts_allreduce(&self.endpoint, local)?,
            Aggregation::PubSub => reduce_counts_pubsub(&self.endpoint, COUNT_CHANNEL, local)?,
        };

        if self.options.check {
            let other = match self.options.aggregation {
                Aggregation::AllReduce => reduce_counts_pubsub(&self.endpoint, COUNT_CHANNEL, local)?,
                Aggregation::PubSub => reduce_counts_allreduce(&self.endpoint, local)?,
            };
            let (allreduce, pubsub) = match self.options.aggregation {
                Aggregation::AllReduce => (&ret, &other),
                Aggregation::PubSub => (&other, &ret),
            };
            if let Err(err) = compare_counts(allreduce, pubsub) {
                warn!("rank {}: {}", self.rank(), err);
                return Err(err.into());
            }
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Corpus;
    use crate::options::SamplerOptions;
    use crate::sampler::ResampleMode;
    use cluster_util::local::local_endpoints;

    #[test]
    fn refresh_counts_every_token_once() -> anyhow::Result<()> {
        let ep = local_endpoints(1)?.pop().ok_or(anyhow::anyhow!("no endpoint"))?;
        let corpus = Corpus::generate(30, 20.0, 40, 2)?;
        let num_tokens = corpus.num_tokens();
        let options = SamplerOptions {
            threshold: 2,
            num_threads: 2,
            ..Default::default()
        };
        let mut sampler = Sampler::new(Arc::new(ep), corpus, options)?;
        sampler.sample_documents(0, 30, 2, ResampleMode::INITIALIZE, true)?;
        sampler.refresh()?;

        let snap = sampler.tree().snapshot();
        let counted: u64 = (0..3)
            .flat_map(|l| (0..snap.nodes_per_level[l]).map(move |k| (l, k)))
            .map(|(l, k)| sampler.counts().get_sum(l, k))
            .sum();
        assert_eq!(counted as usize, num_tokens);
        assert_eq!(sampler.generation().id, 1);
        assert_eq!(sampler.num_refreshes(), 1);

        // the root carries every document
        let root = sampler.tree().with_nodes(|nodes| nodes[0][0].num_docs);
        assert_eq!(root, 30);
        Ok(())
    }

    #[test]
    fn only_the_explicit_check_enforces_the_topic_limit() -> anyhow::Result<()> {
        let ep = local_endpoints(1)?.pop().ok_or(anyhow::anyhow!("no endpoint"))?;
        let corpus = Corpus::generate(20, 20.0, 40, 5)?;
        let options = SamplerOptions {
            gamma: vec![10.0],
            num_threads: 1,
            ..Default::default()
        };
        let mut sampler = Sampler::new(Arc::new(ep), corpus, options)?;
        sampler.sample_documents(0, 20, 1, ResampleMode::INITIALIZE, true)?;
        sampler.options.topic_limit = 1;

        // the root plus at least one branch
        sampler.refresh()?;
        assert!(sampler.tree().snapshot().num_nodes > 1);

        let err = sampler.check_topic_limit().err();
        let err = err.as_ref().and_then(|e| e.downcast_ref::<SamplerError>());
        assert!(matches!(
            err,
            Some(SamplerError::TopicLimitExceeded { limit: 1, .. })
        ));
        Ok(())
    }
}
