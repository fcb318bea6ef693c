//! Word counts per tree node.
//!
//! [`CountStore`] is the live table read by the samplers: one column of
//! atomic word counts per `(level, node)`. Threads stage their changes
//! in a private [`CountBuffer`] and fold them in with
//! [`CountStore::publish`]; readers may observe counts that are a
//! publish behind. [`DenseCounts`] is the flat snapshot exchanged
//! between ranks at each refresh.

use crate::document::Document;
use anyhow::ensure;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Word counts of one node
pub struct CountColumn {
    words: Box<[AtomicU32]>,
    sum: AtomicU64,
}

impl CountColumn {
    fn zeros(vocab_size: usize) -> Self {
        Self {
            words: (0..vocab_size).map(|_| AtomicU32::new(0)).collect(),
            sum: AtomicU64::new(0),
        }
    }

    fn from_counts(counts: &[u64]) -> Self {
        Self {
            words: counts
                .iter()
                .map(|&n| AtomicU32::new(n.min(u32::MAX as u64) as u32))
                .collect(),
            sum: AtomicU64::new(counts.iter().sum()),
        }
    }

    pub fn get(&self, v: usize) -> u32 {
        self.words[v].load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    fn add(&self, v: usize, delta: i64) {
        let _ = self.words[v].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some((x as i64 + delta).clamp(0, u32::MAX as i64) as u32)
        });
        let _ = self.sum.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.saturating_add_signed(delta))
        });
    }
}

/// Staged count changes of one thread
#[derive(Default)]
pub struct CountBuffer {
    delta: HashMap<(usize, usize, u32), i64>,
}

impl CountBuffer {
    /// One fewer occurrence of word `v` on node `(l, k)`
    pub fn dec(&mut self, l: usize, v: u32, k: usize) {
        *self.delta.entry((l, k, v)).or_default() -= 1;
    }

    /// One more occurrence of word `v` on node `(l, k)`
    pub fn inc(&mut self, l: usize, v: u32, k: usize) {
        *self.delta.entry((l, k, v)).or_default() += 1;
    }
}

pub struct CountStore {
    vocab_size: usize,
    levels: Vec<RwLock<Vec<Arc<CountColumn>>>>,
}

impl CountStore {
    pub fn new(levels: usize, vocab_size: usize) -> Self {
        Self {
            vocab_size,
            levels: (0..levels).map(|_| RwLock::new(vec![])).collect(),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The column of node `(l, k)`, if it has ever been counted
    pub fn column(&self, l: usize, k: usize) -> Option<Arc<CountColumn>> {
        let dir = self.levels[l]
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        dir.get(k).cloned()
    }

    /// Occurrences of word `v` on node `(l, k)`
    pub fn get(&self, l: usize, v: u32, k: usize) -> u32 {
        self.column(l, k).map(|c| c.get(v as usize)).unwrap_or(0)
    }

    /// Tokens on node `(l, k)`
    pub fn get_sum(&self, l: usize, k: usize) -> u64 {
        self.column(l, k).map(|c| c.sum()).unwrap_or(0)
    }

    /// Fold the staged changes into the shared table and clear `buf`
    pub fn publish(&self, buf: &mut CountBuffer) {
        for ((l, k, v), delta) in buf.delta.drain() {
            if delta == 0 {
                continue;
            }
            let col = match self.column(l, k) {
                Some(col) => col,
                None => self.grow(l, k),
            };
            col.add(v as usize, delta);
        }
    }

    fn grow(&self, l: usize, k: usize) -> Arc<CountColumn> {
        let mut dir = self.levels[l]
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while dir.len() <= k {
            dir.push(Arc::new(CountColumn::zeros(self.vocab_size)));
        }
        dir[k].clone()
    }

    /// Replace the whole table
    pub fn rebuild(&mut self, dense: &DenseCounts) -> anyhow::Result<()> {
        ensure!(
            dense.vocab_size == self.vocab_size && dense.num_levels() == self.levels.len(),
            "count table shape mismatch"
        );
        for (l, dir) in self.levels.iter_mut().enumerate() {
            let dir = dir
                .get_mut()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *dir = (0..dense.num_topics(l))
                .map(|k| Arc::new(CountColumn::from_counts(dense.column(l, k))))
                .collect();
        }
        Ok(())
    }
}

/// Dense `(level, topic, word)` counts in one flat buffer, topic-major
/// within a level: entry `(l, k, v)` lives at `(offsets[l] + k) * V + v`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseCounts {
    vocab_size: usize,
    offsets: Vec<usize>,
    data: Vec<u64>,
}

impl DenseCounts {
    pub fn zeros(vocab_size: usize, nodes_per_level: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(nodes_per_level.len() + 1);
        offsets.push(0);
        for &n in nodes_per_level {
            offsets.push(offsets[offsets.len() - 1] + n);
        }
        let ntot = offsets[nodes_per_level.len()];
        Self {
            vocab_size,
            offsets,
            data: vec![0; ntot * vocab_size],
        }
    }

    /// Count the tokens of sampled documents by `(z, c[z], w)`
    pub fn from_documents<'a>(
        vocab_size: usize,
        nodes_per_level: &[usize],
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> anyhow::Result<Self> {
        let mut ret = Self::zeros(vocab_size, nodes_per_level);
        for doc in docs.into_iter().filter(|d| d.initialized) {
            for (&v, &l) in doc.w.iter().zip(&doc.z) {
                let k = doc.c[l];
                ensure!(
                    k < ret.num_topics(l),
                    "a token sits on node ({}, {}) beyond the tree",
                    l,
                    k
                );
                ret.add(l, k, v as usize, 1);
            }
        }
        Ok(ret)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn num_levels(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn num_topics(&self, l: usize) -> usize {
        self.offsets[l + 1] - self.offsets[l]
    }

    pub fn nodes_per_level(&self) -> Vec<usize> {
        (0..self.num_levels()).map(|l| self.num_topics(l)).collect()
    }

    fn index(&self, l: usize, k: usize, v: usize) -> usize {
        (self.offsets[l] + k) * self.vocab_size + v
    }

    pub fn get(&self, l: usize, k: usize, v: usize) -> u64 {
        self.data[self.index(l, k, v)]
    }

    pub fn add(&mut self, l: usize, k: usize, v: usize, n: u64) {
        let i = self.index(l, k, v);
        self.data[i] += n;
    }

    /// Word counts of node `(l, k)`
    pub fn column(&self, l: usize, k: usize) -> &[u64] {
        let lb = self.index(l, k, 0);
        &self.data[lb..lb + self.vocab_size]
    }

    pub fn data(&self) -> &[u64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u64] {
        &mut self.data
    }

    /// `(level, topic, word)` of a flat index
    pub fn locate(&self, i: usize) -> (usize, usize, usize) {
        let row = i / self.vocab_size;
        let l = self.offsets.partition_point(|&o| o <= row) - 1;
        (l, row - self.offsets[l], i % self.vocab_size)
    }

    /// Every non-zero entry as `(level, topic, word, count)`
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, usize, usize, u64)> + '_ {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &n)| n > 0)
            .map(|(i, &n)| {
                let (l, k, v) = self.locate(i);
                (l, k, v, n)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_changes_become_visible() {
        let store = CountStore::new(2, 5);
        let mut buf = CountBuffer::default();
        buf.inc(1, 3, 2);
        buf.inc(1, 3, 2);
        buf.inc(1, 4, 2);
        buf.dec(1, 4, 2);
        assert_eq!(store.get(1, 3, 2), 0);

        store.publish(&mut buf);
        assert!(buf.delta.is_empty());
        assert_eq!(store.get(1, 3, 2), 2);
        assert_eq!(store.get(1, 4, 2), 0);
        assert_eq!(store.get_sum(1, 2), 2);
        assert_eq!(store.get_sum(1, 0), 0);
        assert!(store.column(0, 0).is_none());
    }

    #[test]
    fn dense_counts_follow_document_paths() -> anyhow::Result<()> {
        let mut doc = Document::new(vec![0, 1, 1, 2], 2);
        doc.z = vec![0, 1, 1, 0];
        doc.c = vec![0, 1];
        doc.initialized = true;
        let fresh = Document::new(vec![2, 2], 2);

        let dense = DenseCounts::from_documents(3, &[1, 2], [&doc, &fresh])?;
        assert_eq!(dense.column(0, 0), &[1, 0, 1]);
        assert_eq!(dense.column(1, 0), &[0, 0, 0]);
        assert_eq!(dense.column(1, 1), &[0, 2, 0]);
        assert_eq!(dense.locate(dense.index(1, 1, 2)), (1, 1, 2));

        let nz: Vec<_> = dense.nonzero().collect();
        assert_eq!(nz, vec![(0, 0, 0, 1), (0, 0, 2, 1), (1, 1, 1, 2)]);

        let mut store = CountStore::new(2, 3);
        store.rebuild(&dense)?;
        assert_eq!(store.get(1, 1, 1), 2);
        assert_eq!(store.get_sum(0, 0), 2);

        assert!(DenseCounts::from_documents(3, &[1, 1], [&doc]).is_err());
        Ok(())
    }
}
