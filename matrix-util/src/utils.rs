/// Generate exactly `num_batches` minibatch intervals of `batch_size`;
/// trailing intervals may be empty `(ntot, ntot)`.
///
/// Every participant of a lock-step protocol walks the same number of
/// steps no matter how many samples it holds.
pub fn generate_fixed_minibatch_intervals(
    ntot: usize,
    batch_size: usize,
    num_batches: usize,
) -> Vec<(usize, usize)> {
    (0..num_batches)
        .map(|b| {
            let lb = (b * batch_size).min(ntot);
            let ub = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_cover_everything() {
        let iv = generate_fixed_minibatch_intervals(10, 4, 3);
        assert_eq!(iv, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn fixed_intervals_pad_with_empty() {
        let iv = generate_fixed_minibatch_intervals(2, 1, 3);
        assert_eq!(iv, vec![(0, 1), (1, 2), (2, 2)]);
    }
}
