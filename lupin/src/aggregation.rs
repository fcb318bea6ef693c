//! Summing count tables over the cluster, two ways: an all-reduce over
//! the dense buffer, or a publish/subscribe channel on which every rank
//! broadcasts its non-zero entries and every rank tallies them.

use crate::count_store::DenseCounts;
use crate::error::SamplerError;
use cluster_util::{ClusterSync, Endpoint, MessageHandler, PubSub};
use std::sync::Arc;

/// Entries per pub/sub message
const QUADS_PER_MESSAGE: usize = 4096;

/// Channel carrying count entries during a refresh
pub const COUNT_CHANNEL: u32 = 1;

/// Cluster-wide counts by elementwise all-reduce
pub fn reduce_counts_allreduce(ep: &Endpoint, local: &DenseCounts) -> anyhow::Result<DenseCounts> {
    let mut ret = local.clone();
    ep.all_reduce_sum(ret.data_mut())?;
    Ok(ret)
}

/// Accumulates `(level, topic, word, count)` quads, `u32` each
struct CountTally {
    counts: DenseCounts,
}

impl MessageHandler for CountTally {
    fn on_message(&mut self, msg: &[u8]) {
        for q in msg.chunks_exact(16) {
            let x = |i: usize| u32::from_ne_bytes([q[i], q[i + 1], q[i + 2], q[i + 3]]) as usize;
            self.counts.add(x(0), x(4), x(8), x(12) as u64);
        }
    }
}

/// Cluster-wide counts through a publish/subscribe channel on which
/// every rank publishes and subscribes
///
/// * `channel` - channel id, not otherwise open
/// * `local` - this rank's counts; same shape on every rank
pub fn reduce_counts_pubsub(
    ep: &Arc<Endpoint>,
    channel: u32,
    local: &DenseCounts,
) -> anyhow::Result<DenseCounts> {
    let tally = CountTally {
        counts: DenseCounts::zeros(local.vocab_size(), &local.nodes_per_level()),
    };
    let mut pubsub = PubSub::open(ep, channel, true, true, tally)?;

    let mut quads: Vec<u32> = Vec::with_capacity(4 * QUADS_PER_MESSAGE);
    for (l, k, v, mut n) in local.nonzero() {
        while n > 0 {
            let m = n.min(u32::MAX as u64);
            quads.extend_from_slice(&[l as u32, k as u32, v as u32, m as u32]);
            n -= m;
            if quads.len() == 4 * QUADS_PER_MESSAGE {
                pubsub.publish(bytemuck::cast_slice::<u32, u8>(&quads))?;
                quads.clear();
            }
        }
    }
    if !quads.is_empty() {
        pubsub.publish(bytemuck::cast_slice::<u32, u8>(&quads))?;
    }

    pubsub.barrier()?;
    let ret = pubsub.handler().counts.clone();
    Ok(ret)
}

/// First entry where two tables disagree
pub fn compare_counts(allreduce: &DenseCounts, pubsub: &DenseCounts) -> Result<(), SamplerError> {
    let mismatch = allreduce
        .data()
        .iter()
        .zip(pubsub.data())
        .position(|(a, b)| a != b);

    match mismatch {
        Some(i) => {
            let (level, topic, word) = allreduce.locate(i);
            Err(SamplerError::InconsistentCounts {
                level,
                topic,
                word,
                allreduce: allreduce.data()[i],
                pubsub: pubsub.data()[i],
            })
        }
        None if allreduce.data().len() != pubsub.data().len() => {
            Err(SamplerError::InconsistentCounts {
                level: 0,
                topic: 0,
                word: 0,
                allreduce: allreduce.data().len() as u64,
                pubsub: pubsub.data().len() as u64,
            })
        }
        None => Ok(()),
    }
}

/// Cluster-wide word occurrences by all-reduce
pub fn word_occurrences_allreduce(
    ep: &Endpoint,
    docs: &[Vec<u32>],
    vocab_size: usize,
) -> anyhow::Result<Vec<u64>> {
    let mut cv = vec![0u64; vocab_size];
    for &w in docs.iter().flatten() {
        cv[w as usize] += 1;
    }
    ep.all_reduce_sum(&mut cv)?;
    Ok(cv)
}

/// Tallies documents sent as `[len, w_1, ..., w_len]` (`u32` each)
struct WordTally {
    counts: Vec<u64>,
}

impl MessageHandler for WordTally {
    fn on_message(&mut self, msg: &[u8]) {
        let mut words = msg
            .chunks_exact(4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as usize);
        let len = words.next().unwrap_or(0);
        for w in words.take(len) {
            if let Some(c) = self.counts.get_mut(w) {
                *c += 1;
            }
        }
    }
}

/// Cluster-wide word occurrences through publish/subscribe: every
/// document is published, whole, on each of `channels`, and each
/// channel keeps its own tally.
pub fn word_occurrences_pubsub(
    ep: &Arc<Endpoint>,
    channels: &[u32],
    docs: &[Vec<u32>],
    vocab_size: usize,
) -> anyhow::Result<Vec<Vec<u64>>> {
    let mut pubsubs = channels
        .iter()
        .map(|&id| {
            let tally = WordTally {
                counts: vec![0; vocab_size],
            };
            PubSub::open(ep, id, true, true, tally)
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let mut msg: Vec<u32> = vec![];
    for doc in docs {
        msg.clear();
        msg.push(doc.len() as u32);
        msg.extend_from_slice(doc);
        for pubsub in &pubsubs {
            pubsub.publish(bytemuck::cast_slice::<u32, u8>(&msg))?;
        }
    }

    let mut ret = Vec::with_capacity(pubsubs.len());
    for pubsub in pubsubs.iter_mut() {
        pubsub.barrier()?;
        ret.push(pubsub.handler().counts.clone());
    }
    Ok(ret)
}
