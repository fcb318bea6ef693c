use crate::tree::Permutation;
use anyhow::anyhow;
use std::sync::{Mutex, MutexGuard};

/// A document and its current latent assignments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// tokens (vocabulary indices)
    pub w: Vec<u32>,
    /// level of each token
    pub z: Vec<usize>,
    /// node index at each level of the document's path
    pub c: Vec<usize>,
    /// `z` and `c` hold a sampled state
    pub initialized: bool,
}

impl Document {
    pub fn new(w: Vec<u32>, levels: usize) -> Self {
        let n = w.len();
        Self {
            w,
            z: vec![0; n],
            c: vec![0; levels],
            initialized: false,
        }
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    /// Number of tokens at each level (`cdl`)
    pub fn level_counts(&self) -> Vec<usize> {
        let mut cdl = vec![0; self.c.len()];
        for &l in &self.z {
            cdl[l] += 1;
        }
        cdl
    }
}

/// Fixed set of documents, each behind its own lock, so that sampling
/// threads can work on disjoint documents without a global mutex.
pub struct DocumentArena {
    docs: Vec<Mutex<Document>>,
}

impl DocumentArena {
    pub fn new(docs: Vec<Vec<u32>>, levels: usize) -> Self {
        Self {
            docs: docs
                .into_iter()
                .map(|w| Mutex::new(Document::new(w, levels)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Exclusive access to document `d`
    pub fn lock(&self, d: usize) -> MutexGuard<'_, Document> {
        match self.docs[d].lock() {
            Ok(doc) => doc,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Lock-free access while nothing else can hold a document
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Document> {
        self.docs
            .iter_mut()
            .map(|m| m.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Move every sampled path to the renumbered tree
    pub fn permute_paths(&mut self, perm: &Permutation) -> anyhow::Result<()> {
        for doc in self.iter_mut().filter(|doc| doc.initialized) {
            for (l, k) in doc.c.iter_mut().enumerate() {
                let old = *k;
                *k = perm.get(l, old).ok_or_else(|| {
                    anyhow!("a document path runs through pruned node ({}, {})", l, old)
                })?;
            }
        }
        Ok(())
    }
}
