//! Staged warm start.
//!
//! Ranks join sampling in cohorts of growing size: round `r` activates
//! the next `r` ranks. An active rank samples its documents minibatch by
//! minibatch with a refresh after each; every other rank takes part in
//! the same refreshes without sampling. The tree therefore grows from a
//! handful of documents instead of every rank opening its own branches
//! at once.

use crate::sampler::{ResampleMode, Sampler};
use cluster_util::ClusterSync;
use log::info;
use matrix_util::utils::generate_fixed_minibatch_intervals;
use std::ops::Range;

/// Which ranks are active in which round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    round: usize,
    processed: usize,
    size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRound {
    /// starts at 1
    pub round: usize,
    pub cohort: Range<usize>,
}

impl Activation {
    pub fn new(size: usize) -> Self {
        Self {
            round: 1,
            processed: 0,
            size,
        }
    }

    /// Ranks active in the current round
    pub fn cohort(&self) -> Range<usize> {
        self.processed..self.size.min(self.processed + self.round)
    }

    pub fn is_active(&self, rank: usize) -> bool {
        self.cohort().contains(&rank)
    }

    pub fn is_done(&self) -> bool {
        self.processed >= self.size
    }

    pub fn advance(&mut self) {
        self.processed = self.cohort().end;
        self.round += 1;
    }
}

impl Iterator for Activation {
    type Item = ActivationRound;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done() {
            return None;
        }
        let ret = ActivationRound {
            round: self.round,
            cohort: self.cohort(),
        };
        self.advance();
        Some(ret)
    }
}

/// What a rank went through during warm start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmStartReport {
    /// the round in which this rank sampled
    pub active_round: Option<usize>,
    /// refreshes taken part in, the final one included
    pub refreshes: usize,
    pub rounds: usize,
    /// minibatches per active rank
    pub num_minibatches: usize,
}

impl Sampler {
    /// Give every local document an initial path and levels, then
    /// refresh. Collective over the cluster. Every rank fails with
    /// [`SamplerError::TopicLimitExceeded`](crate::SamplerError) at the
    /// same refresh once the tree outgrows the topic limit.
    pub fn initialize(&mut self) -> anyhow::Result<WarmStartReport> {
        let rank = self.rank();
        let size = self.endpoint.size();
        let ndocs = self.docs.len();
        let refreshes_before = self.num_refreshes;

        let requested = match self.options.minibatch_size {
            0 => ndocs,
            mb => mb,
        };
        let local_mb_size = requested.min((ndocs / self.max_threads).max(1)).max(1);
        let local_num_mbs = ndocs.div_ceil(local_mb_size) as u64;
        let num_mbs = (self.endpoint.all_reduce_max(local_num_mbs)? as usize).max(1);
        let mb_size = ndocs / num_mbs + 1;
        // ranks with fewer documents pad with empty minibatches
        let intervals = generate_fixed_minibatch_intervals(ndocs, mb_size, num_mbs);

        if rank == 0 {
            info!("warm start: {} minibatches per rank", num_mbs);
        }

        let mut active_round = None;
        let mut rounds = 0;
        let mut mb_count = 0;

        for ActivationRound { round, cohort } in Activation::new(size) {
            rounds = round;
            if rank == 0 {
                info!("round {}: ranks {:?} sampling", round, cohort);
            }

            if cohort.contains(&rank) {
                active_round = Some(round);
                for &(lb, ub) in &intervals {
                    let num_threads = if round == 1 {
                        mb_count += 1;
                        mb_count.min(self.max_threads)
                    } else {
                        self.max_threads
                    };
                    self.sample_documents(lb, ub, num_threads, ResampleMode::INITIALIZE, true)?;
                    self.endpoint.barrier()?;
                    self.refresh()?;
                    self.check_topic_limit()?;
                    self.endpoint.barrier()?;
                }
            } else {
                for _ in 0..num_mbs {
                    self.endpoint.barrier()?;
                    self.refresh()?;
                    self.check_topic_limit()?;
                    self.endpoint.barrier()?;
                }
            }

            self.endpoint.barrier()?;
            if rank == 0 {
                let snap = self.tree.snapshot();
                info!(
                    "after round {}: {} nodes, instantiated {:?}",
                    round, snap.num_nodes, self.generation.num_instantiated
                );
            }
        }

        self.refresh()?;
        self.check_topic_limit()?;

        Ok(WarmStartReport {
            active_round,
            refreshes: self.num_refreshes - refreshes_before,
            rounds,
            num_minibatches: num_mbs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohorts_grow_and_cover_every_rank_once() {
        let rounds: Vec<_> = Activation::new(7).collect();
        let cohorts: Vec<_> = rounds.iter().map(|x| x.cohort.clone()).collect();
        assert_eq!(cohorts, vec![0..1, 1..3, 3..6, 6..7]);
        assert_eq!(rounds.last().map(|x| x.round), Some(4));

        for rank in 0..7 {
            assert_eq!(cohorts.iter().filter(|c| c.contains(&rank)).count(), 1);
        }
    }

    #[test]
    fn single_rank_finishes_in_one_round() {
        let mut act = Activation::new(1);
        assert!(act.is_active(0));
        act.advance();
        assert!(act.is_done());
        assert_eq!(act.count(), 0);
    }
}
