//! Temperature-scaled pairwise similarity and row-wise softmax.
//!
//! Two equivalent views of the same quantity are exposed:
//!
//! - the exponentiated form ([`similarity_matrix`] + [`row_normalize`]),
//!   matching the written-out definition `S[i][j] = exp(<a_i, b_j> / tau)`,
//! - the log-space form ([`scaled_logits`] + [`log_row_softmax`]), which the
//!   loss uses so that tiny probabilities never round-trip through `exp`
//!   before a `log`.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2, Axis};

fn check_pair(a: &ArrayView2<f32>, b: &ArrayView2<f32>, temperature: f32) -> Result<()> {
    if a.nrows() == 0 || b.nrows() == 0 || a.ncols() == 0 {
        return Err(Error::Domain("embedding batches must be non-empty"));
    }
    if a.ncols() != b.ncols() {
        return Err(Error::Shape("embedding batches must share a dimension"));
    }
    if !(temperature > 0.0) || !temperature.is_finite() {
        return Err(Error::Domain("temperature must be positive and finite"));
    }
    Ok(())
}

/// Scaled logits `Z[i][j] = <a_i, b_j> / temperature` for batches `a` (N x D)
/// and `b` (M x D). This is `log(similarity_matrix)` entry for entry.
pub fn scaled_logits(
    a: &ArrayView2<f32>,
    b: &ArrayView2<f32>,
    temperature: f32,
) -> Result<Array2<f32>> {
    check_pair(a, b, temperature)?;
    Ok(a.dot(&b.t()) / temperature)
}

/// Similarity matrix `S[i][j] = exp(<a_i, b_j> / temperature)`.
///
/// Not symmetric in general when `a` and `b` are different embedding sets.
pub fn similarity_matrix(
    a: &ArrayView2<f32>,
    b: &ArrayView2<f32>,
    temperature: f32,
) -> Result<Array2<f32>> {
    Ok(scaled_logits(a, b, temperature)?.mapv(f32::exp))
}

/// Row-normalize a nonnegative matrix so each row sums to 1.
///
/// Errors on empty input and on any row whose sum is zero or non-finite
/// (degenerate similarity; should not occur for finite embeddings, but the
/// contract is explicit).
pub fn row_normalize(s: &ArrayView2<f32>) -> Result<Array2<f32>> {
    if s.nrows() == 0 || s.ncols() == 0 {
        return Err(Error::Domain("matrix must be non-empty"));
    }
    let mut out = s.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let sum: f64 = row.iter().map(|&x| x as f64).sum();
        if !(sum > 0.0) || !sum.is_finite() {
            return Err(Error::Domain("row sum must be positive and finite"));
        }
        let inv = (1.0 / sum) as f32;
        row.mapv_inplace(|x| x * inv);
    }
    Ok(out)
}

/// Row-wise log-softmax: `out[i][j] = z[i][j] - logsumexp(z[i][:])`.
///
/// Max-shifted, so `exp(out)` equals `row_normalize(exp(z))` without ever
/// forming `exp(z)` at full scale.
pub fn log_row_softmax(z: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = z.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse: f32 = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|x| x - lse);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn toy_cross_view_similarity_matches_closed_form() {
        // Unit basis vectors: dot products are 1 on the diagonal, 0 off it.
        let e1 = array![[1.0f32, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]];
        let e2 = e1.clone();
        let s = similarity_matrix(&e1.view(), &e2.view(), 1.0).unwrap();
        let e = std::f32::consts::E;
        assert!((s[[0, 0]] - e).abs() < 1e-6);
        assert!((s[[0, 1]] - 1.0).abs() < 1e-6);
        assert!((s[[1, 0]] - 1.0).abs() < 1e-6);
        assert!((s[[1, 1]] - e).abs() < 1e-6);

        let p = row_normalize(&s.view()).unwrap();
        assert!((p[[0, 0]] - e / (e + 1.0)).abs() < 1e-6);
        assert!((p[[1, 1]] - e / (e + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn zero_temperature_is_rejected() {
        let e = array![[1.0f32, 0.0], [0.0, 1.0]];
        assert!(similarity_matrix(&e.view(), &e.view(), 0.0).is_err());
        assert!(similarity_matrix(&e.view(), &e.view(), f32::NAN).is_err());
        assert!(similarity_matrix(&e.view(), &e.view(), -0.1).is_err());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let a = array![[1.0f32, 0.0]];
        let b = array![[1.0f32, 0.0, 0.0]];
        assert!(scaled_logits(&a.view(), &b.view(), 1.0).is_err());
    }

    #[test]
    fn zero_row_sum_is_rejected() {
        let s = array![[0.0f32, 0.0], [1.0, 1.0]];
        assert!(row_normalize(&s.view()).is_err());
    }

    fn deterministic_embeddings(n: usize, d: usize, salt: usize) -> Array2<f32> {
        let mut e = Array2::<f32>::zeros((n, d));
        for i in 0..n {
            for k in 0..d {
                e[[i, k]] = (((i * 31 + k * 17 + salt * 7) % 101) as f32 / 101.0) * 2.0 - 1.0;
            }
        }
        e
    }

    proptest! {
        #[test]
        fn prop_row_normalize_rows_sum_to_one(
            n in 1usize..24,
            d in 1usize..16,
            salt in 0usize..64,
        ) {
            let e1 = deterministic_embeddings(n, d, salt);
            let e2 = deterministic_embeddings(n, d, salt + 1);
            let s = similarity_matrix(&e1.view(), &e2.view(), 0.5).unwrap();
            let p = row_normalize(&s.view()).unwrap();
            for row in p.axis_iter(Axis(0)) {
                let sum: f32 = row.sum();
                prop_assert!((sum - 1.0).abs() < 1e-4, "row sum {sum}");
                for &x in row.iter() {
                    prop_assert!(x > 0.0 && x <= 1.0 + 1e-6);
                }
            }
        }
    }

    proptest! {
        #[test]
        fn prop_log_softmax_agrees_with_normalized_similarity(
            n in 1usize..16,
            d in 1usize..12,
            salt in 0usize..64,
        ) {
            let e1 = deterministic_embeddings(n, d, salt);
            let e2 = deterministic_embeddings(n, d, salt + 3);
            let tau = 0.25f32;

            let z = scaled_logits(&e1.view(), &e2.view(), tau).unwrap();
            let via_log = log_row_softmax(&z.view()).mapv(f32::exp);

            let s = similarity_matrix(&e1.view(), &e2.view(), tau).unwrap();
            let via_exp = row_normalize(&s.view()).unwrap();

            for (a, b) in via_log.iter().zip(via_exp.iter()) {
                prop_assert!((a - b).abs() < 1e-4, "{a} vs {b}");
            }
        }
    }
}
