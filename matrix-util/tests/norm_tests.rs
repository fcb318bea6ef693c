use approx::assert_abs_diff_eq;
use matrix_util::dmatrix_util::*;
use matrix_util::Mat;

#[test]
fn log_of_simplex_columns() {
    let mut xx = Mat::from_fn(100, 10, |i, j| (1 + i * j) as f32);
    normalize_columns_simplex_inplace(&mut xx);
    let log_xx = ln_matrix(&xx);

    for j in 0..xx.ncols() {
        let tot: f32 = log_xx.column(j).iter().map(|x| x.exp()).sum();
        assert_abs_diff_eq!(tot, 1.0, epsilon = 1e-4);
    }
}
