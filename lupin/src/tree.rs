//! The topic tree, replicated on every rank.
//!
//! Level 0 holds the root alone; a node at level `l > 0` points to its
//! parent at level `l - 1`. Between refreshes each rank grows its own
//! copy: sampling threads attach documents to paths and open new
//! branches, which stay *pending* (local to the rank). A refresh
//! all-gathers every rank's [`TreeDelta`], replays them in rank order
//! on top of the last synchronized tree, prunes empty nodes and
//! renumbers each level with instantiated nodes first. Every rank
//! replays the same deltas, so every rank ends with the same tree.

use anyhow::{anyhow, bail, ensure};
use cluster_util::collective::decode_u64s;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeNode {
    /// index of the parent at the level above (0 for the root)
    pub parent: usize,
    /// number of documents whose path runs through this node
    pub num_docs: i64,
}

/// Shape of the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub nodes_per_level: Vec<usize>,
    pub num_nodes: usize,
}

/// Changes a rank made since the last synchronization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDelta {
    /// parent of every pending node, per level, in creation order
    pub created: Vec<Vec<usize>>,
    /// change of document counts per level, indexed like the local tree
    pub doc_delta: Vec<Vec<i64>>,
}

impl TreeDelta {
    /// Flat `u64` encoding: for each level, the number of created
    /// nodes and their parents, then the number of deltas and the
    /// deltas (two's complement).
    pub fn encode(&self) -> Vec<u8> {
        let mut words: Vec<u64> = vec![self.created.len() as u64];
        for (created, delta) in self.created.iter().zip(&self.doc_delta) {
            words.push(created.len() as u64);
            words.extend(created.iter().map(|&p| p as u64));
            words.push(delta.len() as u64);
            words.extend(delta.iter().map(|&d| d as u64));
        }
        bytemuck::cast_slice::<u64, u8>(&words).to_vec()
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let words = decode_u64s(bytes)?;
        let mut pos = 0;
        let mut next = || -> anyhow::Result<u64> {
            let w = words
                .get(pos)
                .copied()
                .ok_or_else(|| anyhow!("truncated tree delta"))?;
            pos += 1;
            Ok(w)
        };

        let levels = next()? as usize;
        let mut ret = TreeDelta::default();
        for _ in 0..levels {
            let n = next()? as usize;
            let created = (0..n)
                .map(|_| next().map(|p| p as usize))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let n = next()? as usize;
            let delta = (0..n)
                .map(|_| next().map(|d| d as i64))
                .collect::<anyhow::Result<Vec<_>>>()?;
            ret.created.push(created);
            ret.doc_delta.push(delta);
        }
        Ok(ret)
    }
}

/// Old-to-new node indices per level; `None` marks a pruned node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    levels: Vec<Vec<Option<usize>>>,
}

impl Permutation {
    pub fn get(&self, level: usize, k: usize) -> Option<usize> {
        self.levels.get(level)?.get(k).copied().flatten()
    }
}

struct TreeState {
    /// the tree as of the last synchronization, identical on all ranks
    synced: Vec<Vec<TreeNode>>,
    /// this rank's view: `synced` plus pending nodes and local counts
    nodes: Vec<Vec<TreeNode>>,
    doc_delta: Vec<Vec<i64>>,
}

impl TreeState {
    fn new(synced: Vec<Vec<TreeNode>>) -> Self {
        let doc_delta = synced.iter().map(|x| vec![0; x.len()]).collect();
        Self {
            nodes: synced.clone(),
            synced,
            doc_delta,
        }
    }
}

pub struct Tree {
    levels: usize,
    threshold: i64,
    num_instantiated: Vec<usize>,
    state: RwLock<TreeState>,
}

impl Tree {
    /// A tree holding only the root
    pub fn new(levels: usize) -> Self {
        let mut synced = vec![vec![]; levels];
        if let Some(top) = synced.first_mut() {
            top.push(TreeNode {
                parent: 0,
                num_docs: 0,
            });
        }
        Self {
            levels,
            threshold: 0,
            num_instantiated: vec![0; levels],
            state: RwLock::new(TreeState::new(synced)),
        }
    }

    /// Nodes with at least `threshold` documents get instantiated at
    /// the next compression
    pub fn set_threshold(&mut self, threshold: i64) {
        self.threshold = threshold;
    }

    /// Number of instantiated nodes per level; they carry the lowest
    /// indices of their level
    pub fn num_instantiated(&self) -> Vec<usize> {
        self.num_instantiated.clone()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        let st = self.read();
        let nodes_per_level: Vec<usize> = st.nodes.iter().map(|x| x.len()).collect();
        TreeSnapshot {
            num_nodes: nodes_per_level.iter().sum(),
            nodes_per_level,
        }
    }

    /// Run `f` on this rank's view of the tree, levels top-down
    pub fn with_nodes<R>(&self, f: impl FnOnce(&[Vec<TreeNode>]) -> R) -> R {
        f(&self.read().nodes)
    }

    /// Remove one document from the nodes of `path`
    pub fn detach(&self, path: &[usize]) -> anyhow::Result<()> {
        let mut st = self.write();
        check_path(&st.nodes, path)?;
        let TreeState {
            nodes, doc_delta, ..
        } = &mut *st;
        for (l, &k) in path.iter().enumerate() {
            nodes[l][k].num_docs -= 1;
            doc_delta[l][k] -= 1;
        }
        Ok(())
    }

    /// Attach one document below node `(depth, k)`, opening new nodes
    /// for the levels under `depth`. Returns the full path.
    pub fn attach(&self, depth: usize, k: usize) -> anyhow::Result<Vec<usize>> {
        let mut st = self.write();
        let TreeState {
            nodes, doc_delta, ..
        } = &mut *st;

        ensure!(
            depth < self.levels && k < nodes[depth].len(),
            "no node ({}, {}) to attach to",
            depth,
            k
        );

        let mut path = vec![0; self.levels];
        path[depth] = k;
        for l in (1..=depth).rev() {
            path[l - 1] = nodes[l][path[l]].parent;
        }
        for l in (depth + 1)..self.levels {
            path[l] = nodes[l].len();
            nodes[l].push(TreeNode {
                parent: path[l - 1],
                num_docs: 0,
            });
            doc_delta[l].push(0);
        }

        for (l, &k) in path.iter().enumerate() {
            nodes[l][k].num_docs += 1;
            doc_delta[l][k] += 1;
        }
        Ok(path)
    }

    /// This rank's changes since the last synchronization
    pub fn take_delta(&self) -> TreeDelta {
        let st = self.read();
        TreeDelta {
            created: st
                .nodes
                .iter()
                .zip(&st.synced)
                .map(|(nodes, synced)| nodes[synced.len()..].iter().map(|x| x.parent).collect())
                .collect(),
            doc_delta: st.doc_delta.clone(),
        }
    }

    /// Merge every rank's delta (in rank order), prune nodes without
    /// documents, and renumber each level so that instantiated nodes
    /// come first. Returns where this rank's nodes moved.
    ///
    /// * `deltas` - one delta per rank, as returned by [`Tree::take_delta`]
    /// * `rank` - which of `deltas` is ours
    pub fn compress(&mut self, deltas: &[TreeDelta], rank: usize) -> anyhow::Result<Permutation> {
        ensure!(rank < deltas.len(), "no tree delta for rank {}", rank);
        let levels = self.levels;
        let st = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let base: Vec<usize> = st.synced.iter().map(|x| x.len()).collect();
        let mut merged = st.synced.clone();
        let mut my_map = vec![];

        for (r, delta) in deltas.iter().enumerate() {
            ensure!(
                delta.created.len() == levels && delta.doc_delta.len() == levels,
                "tree delta of rank {} has the wrong depth",
                r
            );
            // pending index of rank r -> index in `merged`
            let mut map: Vec<Vec<usize>> = vec![vec![]; levels];
            for l in 0..levels {
                if l == 0 {
                    ensure!(delta.created[0].is_empty(), "rank {} created a root", r);
                }
                for &p in &delta.created[l] {
                    let parent = resolve(p, base[l - 1], &map[l - 1])?;
                    map[l].push(merged[l].len());
                    merged[l].push(TreeNode {
                        parent,
                        num_docs: 0,
                    });
                }
                for (k, &dd) in delta.doc_delta[l].iter().enumerate() {
                    if dd != 0 {
                        let k = resolve(k, base[l], &map[l])?;
                        merged[l][k].num_docs += dd;
                    }
                }
            }
            if r == rank {
                my_map = map;
            }
        }

        let mut renumber: Vec<Vec<Option<usize>>> = Vec::with_capacity(levels);
        let mut compressed: Vec<Vec<TreeNode>> = Vec::with_capacity(levels);
        let mut num_instantiated = Vec::with_capacity(levels);

        for (l, nodes) in merged.iter().enumerate() {
            if let Some((k, x)) = nodes.iter().enumerate().find(|(_, x)| x.num_docs < 0) {
                bail!("node ({}, {}) has {} documents", l, k, x.num_docs);
            }

            let kept: Vec<usize> = (0..nodes.len())
                .filter(|&k| {
                    if l == 0 {
                        k == 0
                    } else {
                        nodes[k].num_docs > 0 && renumber[l - 1][nodes[k].parent].is_some()
                    }
                })
                .collect();

            let (inst, rest): (Vec<usize>, Vec<usize>) = kept
                .into_iter()
                .partition(|&k| nodes[k].num_docs >= self.threshold);
            num_instantiated.push(inst.len());

            let mut perm = vec![None; nodes.len()];
            let mut level_nodes = Vec::with_capacity(inst.len() + rest.len());
            for (new, &old) in inst.iter().chain(rest.iter()).enumerate() {
                perm[old] = Some(new);
                let parent = if l == 0 {
                    0
                } else {
                    renumber[l - 1][nodes[old].parent]
                        .ok_or_else(|| anyhow!("node ({}, {}) lost its parent", l, old))?
                };
                level_nodes.push(TreeNode {
                    parent,
                    num_docs: nodes[old].num_docs,
                });
            }
            renumber.push(perm);
            compressed.push(level_nodes);
        }

        // where this rank's view (synced + pending) ends up
        let mut levels_perm = Vec::with_capacity(levels);
        for l in 0..levels {
            let local_len = st.nodes[l].len();
            let perm = (0..local_len)
                .map(|k| {
                    resolve(k, base[l], &my_map[l])
                        .ok()
                        .and_then(|k| renumber[l][k])
                })
                .collect();
            levels_perm.push(perm);
        }

        *st = TreeState::new(compressed);
        self.num_instantiated = num_instantiated;
        Ok(Permutation {
            levels: levels_perm,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn resolve(k: usize, base: usize, pending: &[usize]) -> anyhow::Result<usize> {
    if k < base {
        Ok(k)
    } else {
        pending
            .get(k - base)
            .copied()
            .ok_or_else(|| anyhow!("unknown pending node {}", k))
    }
}

fn check_path(nodes: &[Vec<TreeNode>], path: &[usize]) -> anyhow::Result<()> {
    ensure!(path.len() == nodes.len(), "path of depth {}", path.len());
    for (l, &k) in path.iter().enumerate() {
        ensure!(k < nodes[l].len(), "no node ({}, {})", l, k);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_identity(perm: &Permutation) -> bool {
        perm.levels
            .iter()
            .all(|level| level.iter().enumerate().all(|(k, &x)| x == Some(k)))
    }

    #[test]
    fn pending_branches_merge_in_rank_order() -> anyhow::Result<()> {
        // two ranks grow the same empty tree independently
        let mut trees = [Tree::new(3), Tree::new(3)];
        let a = trees[0].attach(0, 0)?;
        let b = trees[0].attach(1, 0)?;
        let c = trees[1].attach(0, 0)?;
        assert_eq!(a, vec![0, 0, 0]);
        assert_eq!(b, vec![0, 0, 1]);
        assert_eq!(c, vec![0, 0, 0]);

        let deltas: Vec<_> = trees.iter().map(|t| t.take_delta()).collect();
        let bytes: Vec<_> = deltas.iter().map(|d| d.encode()).collect();
        let deltas = bytes
            .iter()
            .map(|b| TreeDelta::decode(b))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let p0 = trees[0].compress(&deltas, 0)?;
        let p1 = trees[1].compress(&deltas, 1)?;

        for t in &trees {
            assert_eq!(t.snapshot().nodes_per_level, vec![1, 2, 3]);
            assert_eq!(t.snapshot().num_nodes, 6);
        }
        assert!(is_identity(&p0));
        // rank 1's only branch lands after rank 0's
        assert_eq!(p1.get(1, 0), Some(1));
        assert_eq!(p1.get(2, 0), Some(2));

        trees[1].with_nodes(|nodes| {
            assert_eq!(nodes[0][0].num_docs, 3);
            assert_eq!(nodes[1][0].num_docs, 2);
            assert_eq!(nodes[2][2].parent, 1);
        });
        Ok(())
    }

    #[test]
    fn empty_nodes_are_pruned_and_instantiated_first() -> anyhow::Result<()> {
        let mut tree = Tree::new(2);
        tree.set_threshold(2);
        let p = tree.attach(0, 0)?; // leaf 0, one doc
        tree.attach(0, 0)?; // leaf 1, one doc
        tree.attach(0, 0)?; // leaf 2
        tree.attach(1, 2)?; // leaf 2, second doc
        tree.detach(&p)?; // leaf 0 empties

        let delta = tree.take_delta();
        let perm = tree.compress(&[delta], 0)?;

        assert_eq!(perm.get(1, 0), None);
        assert_eq!(perm.get(1, 2), Some(0));
        assert_eq!(perm.get(1, 1), Some(1));
        assert_eq!(tree.num_instantiated(), vec![1, 1]);
        assert_eq!(tree.snapshot().nodes_per_level, vec![1, 2]);

        // nothing changed: compressing again is the identity
        let delta = tree.take_delta();
        assert!(is_identity(&tree.compress(&[delta], 0)?));
        Ok(())
    }

    #[test]
    fn bad_paths_are_rejected() {
        let tree = Tree::new(2);
        assert!(tree.detach(&[0, 3]).is_err());
        assert!(tree.attach(1, 0).is_err());
    }
}
