//! Partially collapsed Gibbs sampling of document paths and token levels.
//!
//! A node is *instantiated* when it sits below the generation's
//! instantiation boundary of its level; its word distribution is the
//! generation's `phi`. Every other node is *collapsed*: it is scored
//! with the Dirichlet-multinomial predictive of the live counts in the
//! [`CountStore`], and only collapsed nodes have their counts updated
//! token by token.

use crate::corpus::Corpus;
use crate::count_store::{CountBuffer, CountColumn, CountStore, DenseCounts};
use crate::document::{Document, DocumentArena};
use crate::generation::{Generation, PhiPolicy};
use crate::options::SamplerOptions;
use crate::tree::{Tree, TreeNode};

use anyhow::{bail, ensure};
use cluster_util::{ClusterSync, Endpoint};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use special::Gamma as _;
use std::collections::HashMap;
use std::sync::Arc;

/// What a resampling pass may do to the shared state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleMode {
    /// remove the document's current assignment from the counts first
    pub decrease_count: bool,
    /// add the new assignment to the counts afterwards
    pub increase_count: bool,
    /// score collapsed nodes by live counts and let paths open new branches
    pub allow_new_topic: bool,
}

impl ResampleMode {
    /// first visit of a document during warm start
    pub const INITIALIZE: Self = Self {
        decrease_count: false,
        increase_count: true,
        allow_new_topic: true,
    };

    /// ordinary Gibbs sweep
    pub const SWEEP: Self = Self {
        decrease_count: true,
        increase_count: true,
        allow_new_topic: true,
    };
}

pub struct Sampler {
    pub(crate) endpoint: Arc<Endpoint>,
    pub(crate) options: SamplerOptions,
    pub(crate) vocab_size: usize,
    pub(crate) docs: DocumentArena,
    pub(crate) tree: Tree,
    pub(crate) counts: CountStore,
    pub(crate) generation: Arc<Generation>,
    pub(crate) max_threads: usize,
    pub(crate) pools: HashMap<usize, Arc<rayon::ThreadPool>>,
    pub(crate) num_refreshes: usize,
    pub(crate) num_sweeps: u64,
}

impl Sampler {
    /// Set up the sampler of one rank
    ///
    /// * `endpoint` - this rank's cluster endpoint
    /// * `corpus` - this rank's documents; the vocabulary is shared
    /// * `options` - run configuration, identical on every rank
    pub fn new(
        endpoint: Arc<Endpoint>,
        corpus: Corpus,
        options: SamplerOptions,
    ) -> anyhow::Result<Self> {
        let options = options.validate()?;
        let levels = options.levels;
        let vocab_size = corpus.vocab_size;
        ensure!(vocab_size > 0, "empty vocabulary");

        let mut tree = Tree::new(levels);
        tree.set_threshold(options.threshold);

        let nodes_per_level = tree.snapshot().nodes_per_level;
        let generation = Generation::compute(
            0,
            &DenseCounts::zeros(vocab_size, &nodes_per_level),
            tree.num_instantiated(),
            &options.beta,
            PhiPolicy::PlugIn,
        )?;

        let max_threads = options.max_threads();
        if endpoint.rank() == 0 {
            info!(
                "{} ranks, up to {} threads each, {} levels",
                endpoint.size(),
                max_threads,
                levels
            );
        }

        Ok(Self {
            docs: DocumentArena::new(corpus.docs, levels),
            counts: CountStore::new(levels, vocab_size),
            generation: Arc::new(generation),
            pools: HashMap::new(),
            num_refreshes: 0,
            num_sweeps: 0,
            endpoint,
            options,
            vocab_size,
            tree,
            max_threads,
        })
    }

    pub fn rank(&self) -> usize {
        self.endpoint.rank()
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    pub fn documents(&self) -> &DocumentArena {
        &self.docs
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn counts(&self) -> &CountStore {
        &self.counts
    }

    /// The parameters sampling currently reads
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Refreshes this rank has taken part in
    pub fn num_refreshes(&self) -> usize {
        self.num_refreshes
    }

    /// Steady-state Gibbs sweeps over the local documents, each
    /// followed by a refresh. Without `new_topic` the tree can only
    /// lose nodes.
    pub fn iterate(&mut self, num_iters: usize) -> anyhow::Result<()> {
        let mode = ResampleMode {
            allow_new_topic: self.options.new_topic,
            ..ResampleMode::SWEEP
        };
        let pb = ProgressBar::new(num_iters as u64);
        if self.rank() != 0 {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for iter in 0..num_iters {
            self.sample_documents(0, self.docs.len(), self.max_threads, mode, false)?;
            self.endpoint.barrier()?;
            self.refresh()?;

            if self.rank() == 0 {
                let snap = self.tree.snapshot();
                info!(
                    "iteration {}: {} nodes {:?}, instantiated {:?}",
                    iter + 1,
                    snap.num_nodes,
                    snap.nodes_per_level,
                    self.generation.num_instantiated
                );
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(())
    }

    fn pool(&mut self, num_threads: usize) -> anyhow::Result<Arc<rayon::ThreadPool>> {
        if let Some(pool) = self.pools.get(&num_threads) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .thread_name(move |i| format!("sampler-{}-{}", num_threads, i))
                .build()?,
        );
        self.pools.insert(num_threads, pool.clone());
        Ok(pool)
    }

    /// Resample documents `[lb, ub)` on `num_threads` threads
    ///
    /// * `fresh` - draw uniform levels and mark the documents initialized first
    pub(crate) fn sample_documents(
        &mut self,
        lb: usize,
        ub: usize,
        num_threads: usize,
        mode: ResampleMode,
        fresh: bool,
    ) -> anyhow::Result<()> {
        let pool = self.pool(num_threads.max(1))?;
        self.num_sweeps += 1;
        let sweep_seed = self.options.seed
            ^ self.num_sweeps.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (self.rank() as u64).wrapping_mul(0xD1B5_4A32_D192_ED03);

        let this = &*self;
        let generation = this.generation.clone();
        let levels = this.options.levels;
        // levels are always resampled in place, a fresh document included
        let z_mode = ResampleMode {
            decrease_count: true,
            increase_count: true,
            ..mode
        };

        pool.install(|| {
            (lb..ub).into_par_iter().try_for_each_init(
                CountBuffer::default,
                |buf, d| -> anyhow::Result<()> {
                    let mut rng = SmallRng::seed_from_u64(sweep_seed ^ (d as u64).wrapping_mul(2654435761));
                    let mut doc = this.docs.lock(d);
                    if fresh {
                        for z in doc.z.iter_mut() {
                            *z = rng.random_range(0..levels);
                        }
                        doc.initialized = true;
                    }
                    if !doc.initialized {
                        return Ok(());
                    }
                    this.sample_c(&mut doc, &generation, mode, buf, &mut rng)?;
                    this.sample_z(&mut doc, &generation, z_mode, buf, &mut rng);
                    Ok(())
                },
            )
        })
    }

    /// Resample the level of every token of `doc`. The caller holds the
    /// document's lock.
    pub fn sample_z(
        &self,
        doc: &mut Document,
        generation: &Generation,
        mode: ResampleMode,
        buf: &mut CountBuffer,
        rng: &mut impl Rng,
    ) {
        let levels = generation.levels();
        let mut cdl = doc.level_counts();
        let collapsed = collapsed_levels(&doc.c, generation, mode.allow_new_topic);
        let columns: Vec<Option<Arc<CountColumn>>> = (0..levels)
            .map(|l| self.counts.column(l, doc.c[l]))
            .collect();
        let mut prob = vec![0f64; levels];

        let Document { w, z, c: pos, .. } = doc;
        for (&v, zn) in w.iter().zip(z.iter_mut()) {
            let l = *zn;
            if mode.decrease_count {
                if !generation.is_instantiated(l, pos[l]) {
                    buf.dec(l, v, pos[l]);
                }
                cdl[l] -= 1;
            }

            fill_level_weights(
                v,
                pos,
                &cdl,
                &collapsed,
                &columns,
                generation,
                &self.options.alpha,
                &self.options.beta,
                self.vocab_size,
                &mut prob,
            );

            let l = sample_categorical(&prob, rng);
            *zn = l;

            if mode.increase_count {
                if !generation.is_instantiated(l, pos[l]) {
                    buf.inc(l, v, pos[l]);
                }
                cdl[l] += 1;
            }
        }

        self.counts.publish(buf);
    }

    /// Resample the path of `doc` under the nested CRP prior. The
    /// caller holds the document's lock.
    pub fn sample_c(
        &self,
        doc: &mut Document,
        generation: &Generation,
        mode: ResampleMode,
        buf: &mut CountBuffer,
        rng: &mut impl Rng,
    ) -> anyhow::Result<()> {
        let levels = generation.levels();
        let old_leaf = doc.c[levels - 1];

        if mode.decrease_count {
            self.tree.detach(&doc.c)?;
            for (&v, &l) in doc.w.iter().zip(&doc.z) {
                if !generation.is_instantiated(l, doc.c[l]) {
                    buf.dec(l, v, doc.c[l]);
                }
            }
            self.counts.publish(buf);
        }

        let level_words = level_word_counts(doc, levels);
        let (depth, k) = self.tree.with_nodes(|nodes| {
            let candidates = self.path_candidates(nodes, &level_words, generation, mode.allow_new_topic);
            if candidates.is_empty() {
                // a fixed tree whose only populated leaf was this document's
                if !mode.allow_new_topic && old_leaf < nodes[levels - 1].len() {
                    return Ok((levels - 1, old_leaf));
                }
                bail!("no path to place a document on");
            }
            let scores: Vec<f64> = candidates.iter().map(|x| x.2).collect();
            let (d, k, _) = candidates[sample_categorical_log(&scores, rng)];
            Ok((d, k))
        })?;

        doc.c = self.tree.attach(depth, k)?;

        if mode.increase_count {
            for (&v, &l) in doc.w.iter().zip(&doc.z) {
                if !generation.is_instantiated(l, doc.c[l]) {
                    buf.inc(l, v, doc.c[l]);
                }
            }
            self.counts.publish(buf);
        }
        Ok(())
    }

    /// Every place a document can go, as `(depth, node, log score)`:
    /// an existing leaf (`depth = L - 1`), or a new branch hanging off
    /// an existing inner node.
    fn path_candidates(
        &self,
        nodes: &[Vec<TreeNode>],
        level_words: &[Vec<(u32, u32)>],
        generation: &Generation,
        allow_new_branch: bool,
    ) -> Vec<(usize, usize, f64)> {
        let levels = nodes.len();
        let gamma = &self.options.gamma;

        // log score of the path from the root down to each node
        let mut path_score: Vec<Vec<f64>> = Vec::with_capacity(levels);
        for (l, level_nodes) in nodes.iter().enumerate() {
            let scores = level_nodes
                .iter()
                .enumerate()
                .map(|(k, node)| {
                    let prior = if l == 0 {
                        0.0
                    } else if node.num_docs <= 0 {
                        f64::NEG_INFINITY
                    } else {
                        let parent = &nodes[l - 1][node.parent];
                        (node.num_docs as f64).ln()
                            - (parent.num_docs as f64 + gamma[l - 1] as f64).ln()
                    };
                    let upper = if l == 0 { 0.0 } else { path_score[l - 1][node.parent] };
                    if !(prior + upper).is_finite() {
                        return f64::NEG_INFINITY;
                    }
                    upper + prior + self.node_log_likelihood(l, Some(k), &level_words[l], generation)
                })
                .collect();
            path_score.push(scores);
        }

        let mut ret: Vec<(usize, usize, f64)> = path_score[levels - 1]
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_finite())
            .map(|(k, &s)| (levels - 1, k, s))
            .collect();

        if allow_new_branch {
            // a fresh subtree below level l scores the same wherever it hangs
            let mut new_below = vec![0f64; levels];
            for l in (0..levels.saturating_sub(1)).rev() {
                new_below[l] =
                    new_below[l + 1] + self.node_log_likelihood(l + 1, None, &level_words[l + 1], generation);
            }

            for l in 0..levels.saturating_sub(1) {
                for (k, &s) in path_score[l].iter().enumerate() {
                    if !s.is_finite() {
                        continue;
                    }
                    let m = nodes[l][k].num_docs.max(0) as f64;
                    let g = gamma[l] as f64;
                    let prior = g.ln() - (m + g).ln();
                    ret.push((l, k, s + prior + new_below[l]));
                }
            }
        }
        ret
    }

    /// Log likelihood of the words a document assigns to level `l`,
    /// under node `k` (or a brand-new node)
    fn node_log_likelihood(
        &self,
        l: usize,
        k: Option<usize>,
        words: &[(u32, u32)],
        generation: &Generation,
    ) -> f64 {
        if words.is_empty() {
            return 0.0;
        }

        match k {
            Some(k) if generation.is_instantiated(l, k) => {
                let log_phi = &generation.log_phi[l];
                words
                    .iter()
                    .map(|&(v, n)| n as f64 * log_phi[(v as usize, k)] as f64)
                    .sum()
            }
            _ => {
                let column = k.and_then(|k| self.counts.column(l, k));
                let beta = self.options.beta[l] as f64;
                let count = |v: u32| column.as_ref().map(|c| c.get(v as usize)).unwrap_or(0) as f64;
                let total = column.as_ref().map(|c| c.sum()).unwrap_or(0) as f64;
                let n_tot: f64 = words.iter().map(|&(_, n)| n as f64).sum();
                let beta_v = beta * self.vocab_size as f64;

                let mut ret = (beta_v + total).ln_gamma().0 - (beta_v + total + n_tot).ln_gamma().0;
                for &(v, n) in words {
                    let c = count(v) + beta;
                    ret += (c + n as f64).ln_gamma().0 - c.ln_gamma().0;
                }
                ret
            }
        }
    }
}

/// Levels scored by the collapsed predictive for a document on `pos`
pub(crate) fn collapsed_levels(pos: &[usize], generation: &Generation, allow_new_topic: bool) -> Vec<bool> {
    pos.iter()
        .enumerate()
        .map(|(l, &k)| {
            k >= generation.phi[l].ncols() || (allow_new_topic && k >= generation.num_instantiated[l])
        })
        .collect()
}

/// Unnormalized probability of each level for one token of word `v`
///
/// ```text
/// collapsed:    (cdl[l] + alpha[l]) * (count(l,v,pos[l]) + beta[l]) / (countSum(l,pos[l]) + beta[l] * V)
/// instantiated: (cdl[l] + alpha[l]) * phi[l](v, pos[l])
/// ```
#[allow(clippy::too_many_arguments)]
pub(crate) fn fill_level_weights(
    v: u32,
    pos: &[usize],
    cdl: &[usize],
    collapsed: &[bool],
    columns: &[Option<Arc<CountColumn>>],
    generation: &Generation,
    alpha: &[f32],
    beta: &[f32],
    vocab_size: usize,
    prob: &mut [f64],
) {
    for (l, p) in prob.iter_mut().enumerate() {
        let a = cdl[l] as f64 + alpha[l] as f64;
        *p = if collapsed[l] {
            let (count, total) = columns[l]
                .as_ref()
                .map(|c| (c.get(v as usize) as f64, c.sum() as f64))
                .unwrap_or((0.0, 0.0));
            let b = beta[l] as f64;
            a * (count + b) / (total + b * vocab_size as f64)
        } else {
            a * generation.phi[l][(v as usize, pos[l])] as f64
        };
    }
}

/// Per level, the document's `(word, count)` pairs
fn level_word_counts(doc: &Document, levels: usize) -> Vec<Vec<(u32, u32)>> {
    let mut words: Vec<Vec<u32>> = vec![vec![]; levels];
    for (&v, &l) in doc.w.iter().zip(&doc.z) {
        words[l].push(v);
    }
    words
        .into_iter()
        .map(|mut ww| {
            ww.sort_unstable();
            let mut ret: Vec<(u32, u32)> = vec![];
            for v in ww {
                match ret.last_mut() {
                    Some((u, n)) if *u == v => *n += 1,
                    _ => ret.push((v, 1)),
                }
            }
            ret
        })
        .collect()
}

/// Draw an index proportional to non-negative `weights`; uniform if
/// they carry no mass
pub(crate) fn sample_categorical(weights: &[f64], rng: &mut impl Rng) -> usize {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        return rng.random_range(0..weights.len());
    }
    let u = rng.random::<f64>() * total;
    let mut cum = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cum += w;
        if cum >= u {
            return i;
        }
    }
    weights.len() - 1
}

/// Draw an index proportional to `exp(log_probs)`
pub(crate) fn sample_categorical_log(log_probs: &[f64], rng: &mut impl Rng) -> usize {
    let max = log_probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = log_probs.iter().map(|lp| (lp - max).exp()).collect();
    sample_categorical(&weights, rng)
}
