//! The VISPE objective: two prototype distributions per batch, a symmetric
//! cross-entropy term, and a KL regularizer tying them together.
//!
//! For embeddings `E1` (primary views) and `E2` (secondary views), both
//! N x D and positionally paired:
//!
//! - prototype set 1: `P1 = row-softmax(E1 E2^T / tau)`, how strongly each
//!   primary view recognizes each secondary view;
//! - prototype set 2: `P2 = row-softmax(Z2)` where `Z2 = E2 E2^T / tau`
//!   **with its diagonal overwritten by the cross-view diagonal** of
//!   `E1 E2^T / tau`. The same-view self-similarity is trivially maximal, so
//!   the cross-view value stands in for it; off-diagonal entries keep the
//!   same-view scale. This mixes two similarity scales on purpose.
//!
//! The loss is
//!
//! ```text
//! loss_ce = -mean_i( log P1[i][i] + log P2[i][i] )
//! loss_kl = mean_i( sum_j P2[i][j] * (log P2[i][j] - log P1[i][j]) )
//! total   = loss_ce + alpha * loss_kl
//! ```
//!
//! Gradients flow through **both** distributions of the KL term; the target
//! `P2` is not detached.
//!
//! Everything is computed in log space (max-shifted log-softmax), so a
//! vanishing diagonal probability shows up as a large-but-finite log term
//! rather than `ln(0)`.

use crate::similarity::{log_row_softmax, scaled_logits};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};

/// VISPE loss with fixed hyperparameters (neither is learned).
#[derive(Debug, Clone, Copy)]
pub struct VispeLoss {
    /// Softmax temperature. Smaller values sharpen both distributions.
    pub temperature: f32,
    /// Weight of the KL regularizer.
    pub alpha: f32,
}

/// Scalar terms of one loss evaluation.
#[derive(Debug, Clone, Copy)]
pub struct VispeTerms {
    pub total: f32,
    pub cross_entropy: f32,
    pub kl: f32,
}

/// Gradients of `total` with respect to both embedding batches.
#[derive(Debug, Clone)]
pub struct VispeGrads {
    pub e1: Array2<f32>,
    pub e2: Array2<f32>,
}

/// Overwrite the diagonal of `z2` with the diagonal of `z1`.
///
/// Applied at the logit level; `exp` is monotone entrywise, so this is the
/// same substitution as swapping diagonals of the exponentiated similarity
/// matrices.
pub fn substitute_diagonal(z2: &mut Array2<f32>, z1: &ArrayView2<f32>) {
    let n = z2.nrows().min(z1.nrows());
    for i in 0..n {
        z2[[i, i]] = z1[[i, i]];
    }
}

struct Forward {
    l1: Array2<f32>,
    l2: Array2<f32>,
    kl_rows: Array1<f32>,
    terms: VispeTerms,
}

impl VispeLoss {
    pub fn new(temperature: f32, alpha: f32) -> Result<Self> {
        if !(temperature > 0.0) || !temperature.is_finite() {
            return Err(Error::Domain("temperature must be positive and finite"));
        }
        if !(alpha > 0.0) || !alpha.is_finite() {
            return Err(Error::Domain("alpha must be positive and finite"));
        }
        Ok(Self { temperature, alpha })
    }

    fn forward(&self, e1: &ArrayView2<f32>, e2: &ArrayView2<f32>) -> Result<Forward> {
        if e1.nrows() != e2.nrows() {
            return Err(Error::Shape("view batches must have equal length"));
        }
        let n = e1.nrows();

        let z1 = scaled_logits(e1, e2, self.temperature)?;
        let mut z2 = scaled_logits(e2, e2, self.temperature)?;
        substitute_diagonal(&mut z2, &z1.view());

        let l1 = log_row_softmax(&z1.view());
        let l2 = log_row_softmax(&z2.view());

        let mut ce_acc = 0.0f64;
        let mut kl_rows = Array1::<f32>::zeros(n);
        for i in 0..n {
            ce_acc -= (l1[[i, i]] + l2[[i, i]]) as f64;
            let mut row_kl = 0.0f64;
            for j in 0..n {
                let p2 = l2[[i, j]].exp();
                row_kl += (p2 * (l2[[i, j]] - l1[[i, j]])) as f64;
            }
            kl_rows[i] = row_kl as f32;
        }
        let cross_entropy = (ce_acc / n as f64) as f32;
        let kl = (kl_rows.iter().map(|&x| x as f64).sum::<f64>() / n as f64) as f32;

        Ok(Forward {
            l1,
            l2,
            kl_rows,
            terms: VispeTerms {
                total: cross_entropy + self.alpha * kl,
                cross_entropy,
                kl,
            },
        })
    }

    /// Loss terms for a deduplicated, positionally paired pair of embedding
    /// batches. A single-row batch yields a zero loss (the softmax over one
    /// element is 1).
    pub fn terms(&self, e1: &ArrayView2<f32>, e2: &ArrayView2<f32>) -> Result<VispeTerms> {
        Ok(self.forward(e1, e2)?.terms)
    }

    /// Loss terms plus `d total / d E1` and `d total / d E2`.
    ///
    /// Derivation sketch (per row `i`, all scaled by `1/N`):
    ///
    /// ```text
    /// dL/dZ1[i][:] = (P1[i][:] - e_i) + alpha * (P1[i][:] - P2[i][:])
    /// dL/dZ2[i][:] = (P2[i][:] - e_i)
    ///              + alpha * P2[i][:] .* ((L2 - L1)[i][:] - kl_i)
    /// ```
    ///
    /// then through the bilinear logits: `Z1 = E1 E2^T / tau` contributes to
    /// both batches; `Z2`'s off-diagonal is `E2 E2^T / tau` (both sides are
    /// `E2`), while its substituted diagonal is `E1_i . E2_i / tau`.
    pub fn terms_with_grads(
        &self,
        e1: &ArrayView2<f32>,
        e2: &ArrayView2<f32>,
    ) -> Result<(VispeTerms, VispeGrads)> {
        let fwd = self.forward(e1, e2)?;
        let n = e1.nrows();
        let inv_n = 1.0f32 / n as f32;

        let p1 = fwd.l1.mapv(f32::exp);
        let p2 = fwd.l2.mapv(f32::exp);

        // Gradients w.r.t. the two logit matrices.
        let mut g1 = Array2::<f32>::zeros((n, n));
        let mut g2 = Array2::<f32>::zeros((n, n));
        for i in 0..n {
            let kl_i = fwd.kl_rows[i];
            for j in 0..n {
                let delta = if i == j { 1.0 } else { 0.0 };
                g1[[i, j]] = inv_n
                    * ((p1[[i, j]] - delta) + self.alpha * (p1[[i, j]] - p2[[i, j]]));
                g2[[i, j]] = inv_n
                    * ((p2[[i, j]] - delta)
                        + self.alpha * p2[[i, j]] * ((fwd.l2[[i, j]] - fwd.l1[[i, j]]) - kl_i));
            }
        }

        // Split Z2's gradient into its off-diagonal part (same-view bilinear
        // form in E2) and its diagonal part (cross-view dot products).
        let mut g2_diag = Array1::<f32>::zeros(n);
        let mut g2_off = g2;
        for i in 0..n {
            g2_diag[i] = g2_off[[i, i]];
            g2_off[[i, i]] = 0.0;
        }

        let inv_tau = 1.0 / self.temperature;

        let mut grad_e1 = g1.dot(e2);
        let mut grad_e2 = g1.t().dot(e1) + (&g2_off + &g2_off.t()).dot(e2);
        for i in 0..n {
            let gd = g2_diag[i];
            let (e1_row, e2_row) = (e1.row(i), e2.row(i));
            for (k, slot) in grad_e1.row_mut(i).iter_mut().enumerate() {
                *slot += gd * e2_row[k];
            }
            for (k, slot) in grad_e2.row_mut(i).iter_mut().enumerate() {
                *slot += gd * e1_row[k];
            }
        }
        grad_e1.mapv_inplace(|x| x * inv_tau);
        grad_e2.mapv_inplace(|x| x * inv_tau);

        Ok((
            fwd.terms,
            VispeGrads {
                e1: grad_e1,
                e2: grad_e2,
            },
        ))
    }
}
