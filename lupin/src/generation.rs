use crate::count_store::DenseCounts;
use matrix_util::dmatrix_util::{
    ln_matrix, mat_from_columns, normalize_columns_simplex_inplace, rdirichlet_vec,
};
use matrix_util::Mat;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// How topic-word distributions are recompiled from counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhiPolicy {
    /// posterior mean `(count + beta) / (countSum + beta * V)`
    PlugIn,
    /// one Dirichlet draw per topic, seeded by (seed, generation, node)
    Sample { seed: u64 },
}

/// Everything sampling threads read between two refreshes. A refresh
/// builds a new value and swaps it in; a generation is never mutated.
#[derive(Debug, Clone)]
pub struct Generation {
    /// advances by one at every refresh
    pub id: u64,
    /// nodes with index below this are instantiated, per level
    pub num_instantiated: Vec<usize>,
    /// per level, `V x K_l` word distributions of every node
    pub phi: Vec<Mat>,
    /// elementwise `ln(phi)`
    pub log_phi: Vec<Mat>,
}

impl Generation {
    /// Recompute `phi` for every node of `counts`
    ///
    /// * `id` - generation number
    /// * `counts` - cluster-wide counts, identical on all ranks
    /// * `num_instantiated` - instantiation boundary per level
    /// * `beta` - per-level topic-word prior
    pub fn compute(
        id: u64,
        counts: &DenseCounts,
        num_instantiated: Vec<usize>,
        beta: &[f32],
        policy: PhiPolicy,
    ) -> anyhow::Result<Self> {
        let vocab_size = counts.vocab_size();
        let mut phi = Vec::with_capacity(counts.num_levels());

        for (l, &b) in beta.iter().enumerate().take(counts.num_levels()) {
            let columns = (0..counts.num_topics(l))
                .into_par_iter()
                .map(|k| {
                    let col = counts.column(l, k);
                    let shapes: Vec<f32> = col.iter().map(|&n| n as f32 + b).collect();
                    match policy {
                        PhiPolicy::PlugIn => Ok(shapes),
                        PhiPolicy::Sample { seed } => {
                            let mut rng = SmallRng::seed_from_u64(node_seed(seed, id, l, k));
                            rdirichlet_vec(&shapes, &mut rng)
                        }
                    }
                })
                .collect::<anyhow::Result<Vec<Vec<f32>>>>()?;

            let mut phi_l = mat_from_columns(vocab_size, columns)?;
            if policy == PhiPolicy::PlugIn {
                normalize_columns_simplex_inplace(&mut phi_l);
            }
            phi.push(phi_l);
        }

        let log_phi = phi.iter().map(ln_matrix).collect();

        Ok(Self {
            id,
            num_instantiated,
            phi,
            log_phi,
        })
    }

    pub fn levels(&self) -> usize {
        self.phi.len()
    }

    /// Node `(l, k)` is read through `phi` rather than live counts
    pub fn is_instantiated(&self, l: usize, k: usize) -> bool {
        k < self.num_instantiated[l] && k < self.phi[l].ncols()
    }
}

fn node_seed(seed: u64, id: u64, l: usize, k: usize) -> u64 {
    seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ ((l as u64) << 56)
        ^ (k as u64).wrapping_mul(2654435761)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::dmatrix_util::column_sums;

    fn toy_counts() -> DenseCounts {
        let mut counts = DenseCounts::zeros(4, &[1, 2]);
        counts.add(0, 0, 1, 10);
        counts.add(1, 1, 3, 5);
        counts.add(1, 1, 0, 1);
        counts
    }

    #[test]
    fn both_policies_are_column_stochastic() -> anyhow::Result<()> {
        let counts = toy_counts();
        for policy in [PhiPolicy::PlugIn, PhiPolicy::Sample { seed: 3 }] {
            let generation = Generation::compute(1, &counts, vec![1, 1], &[1.0, 0.1], policy)?;
            for phi in &generation.phi {
                for s in column_sums(phi) {
                    assert_abs_diff_eq!(s, 1.0, epsilon = 1e-4);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn plug_in_matches_the_posterior_mean() -> anyhow::Result<()> {
        let counts = toy_counts();
        let generation = Generation::compute(1, &counts, vec![1, 0], &[1.0, 0.1], PhiPolicy::PlugIn)?;
        assert_abs_diff_eq!(generation.phi[0][(1, 0)], 11.0 / 14.0, epsilon = 1e-6);
        assert_abs_diff_eq!(generation.phi[1][(3, 1)], 5.1 / 6.4, epsilon = 1e-6);
        assert_abs_diff_eq!(generation.log_phi[1][(3, 1)], (5.1f32 / 6.4).ln(), epsilon = 1e-6);
        assert!(generation.is_instantiated(0, 0));
        assert!(!generation.is_instantiated(1, 0));
        Ok(())
    }

    #[test]
    fn sampled_phi_depends_only_on_seed_and_generation() -> anyhow::Result<()> {
        let counts = toy_counts();
        let policy = PhiPolicy::Sample { seed: 11 };
        let a = Generation::compute(4, &counts, vec![1, 2], &[1.0, 0.1], policy)?;
        let b = Generation::compute(4, &counts, vec![1, 2], &[1.0, 0.1], policy)?;
        let c = Generation::compute(5, &counts, vec![1, 2], &[1.0, 0.1], policy)?;
        assert_eq!(a.phi, b.phi);
        assert_ne!(a.phi, c.phi);
        Ok(())
    }
}
