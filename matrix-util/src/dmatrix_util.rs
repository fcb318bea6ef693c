use crate::Mat;
use rand::Rng;
use rand_distr::{Distribution, Gamma};

/// Normalize d x m matrix X by columns so that each column sums to one
/// Y[,j] = X[,j] / sum(X[,j])
///
/// A column with a non-positive or non-finite total becomes uniform.
pub fn normalize_columns_simplex_inplace(xx: &mut Mat) {
    let dd = xx.nrows();
    for mut xx_j in xx.column_iter_mut() {
        let denom: f32 = xx_j.iter().sum();
        if denom > 0.0 && denom.is_finite() {
            xx_j /= denom;
        } else {
            xx_j.fill(1.0 / dd as f32);
        }
    }
}

/// Elementwise natural log
pub fn ln_matrix(xx: &Mat) -> Mat {
    xx.map(|x| x.ln())
}

/// Column sums of d x m matrix
pub fn column_sums(xx: &Mat) -> Vec<f32> {
    xx.column_iter().map(|x_j| x_j.iter().sum()).collect()
}

/// Stack column vectors (each of length `nrows`) into a dense matrix
pub fn mat_from_columns(nrows: usize, columns: Vec<Vec<f32>>) -> anyhow::Result<Mat> {
    let ncols = columns.len();
    let mut data = Vec::with_capacity(nrows * ncols);
    for (j, col) in columns.into_iter().enumerate() {
        if col.len() != nrows {
            anyhow::bail!("column {} has {} rows, expected {}", j, col.len(), nrows);
        }
        data.extend(col);
    }
    Ok(Mat::from_vec(nrows, ncols, data))
}

/// Sample one Gamma(shape, 1) variate per entry of `shapes`
///
/// * `shapes` - strictly positive shape parameters
pub fn rgamma_vec<R: Rng + ?Sized>(shapes: &[f32], rng: &mut R) -> anyhow::Result<Vec<f32>> {
    shapes
        .iter()
        .map(|&a| {
            let gam = Gamma::new(a, 1.0)
                .map_err(|e| anyhow::anyhow!("invalid gamma shape {}: {}", a, e))?;
            Ok(gam.sample(rng))
        })
        .collect()
}

/// Sample a Dirichlet vector by the gamma-ratio construction
///
/// ```text
/// g[i] ~ Gamma(a[i], 1),  p[i] = g[i] / sum(g)
/// ```
///
/// If every gamma variate underflows to zero, falls back to the
/// normalized shape vector (the Dirichlet mean).
pub fn rdirichlet_vec<R: Rng + ?Sized>(shapes: &[f32], rng: &mut R) -> anyhow::Result<Vec<f32>> {
    let mut gg = rgamma_vec(shapes, rng)?;
    let tot: f32 = gg.iter().sum();
    if tot > 0.0 && tot.is_finite() {
        let inv = 1.0 / tot;
        gg.iter_mut().for_each(|g| *g *= inv);
    } else {
        let tot: f32 = shapes.iter().sum();
        gg.iter_mut().zip(shapes).for_each(|(g, &a)| *g = a / tot);
    }
    Ok(gg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn simplex_columns_sum_to_one() {
        let mut xx = Mat::from_fn(5, 3, |i, j| (i + j) as f32);
        xx.column_mut(0).fill(0.0);
        normalize_columns_simplex_inplace(&mut xx);
        for s in column_sums(&xx) {
            assert_abs_diff_eq!(s, 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(xx[(2, 0)], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn dirichlet_is_on_simplex() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(7);
        let shapes = vec![0.01f32; 1000];
        let pp = rdirichlet_vec(&shapes, &mut rng)?;
        let tot: f32 = pp.iter().sum();
        assert_abs_diff_eq!(tot, 1.0, epsilon = 1e-4);
        assert!(pp.iter().all(|&p| p >= 0.0));
        Ok(())
    }

    #[test]
    fn stacking_checks_lengths() {
        assert!(mat_from_columns(3, vec![vec![1.0; 3], vec![1.0; 2]]).is_err());
        let xx = mat_from_columns(2, vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(xx[(1, 0)], 2.0);
        assert_eq!(xx[(0, 1)], 3.0);
    }
}
