//! The feature-extractor seam and one concrete backbone.
//!
//! The training loop only sees [`FeatureExtractor`]: embed a batch, push a
//! gradient back through it, and read/write a flat parameter vector (the flat
//! form is what the optimizer and the checkpoint store traffic in).
//!
//! [`LinearBackbone`] is an intentionally boring baseline: an L2-normalized
//! linear projection with a closed-form backward pass. It is enough structure
//! to exercise the objective and the loop without importing an ML framework.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

const NORM_FLOOR: f32 = 1e-12;

/// An opaque image-batch to embedding-batch mapping with trainable state.
///
/// `embed` takes row-flattened images `(n, input_dim)` and returns
/// `(n, embed_dim)`. `backward` chains a gradient w.r.t. the embeddings into
/// a gradient w.r.t. the flat parameters, aligned with `params()`.
pub trait FeatureExtractor {
    fn input_dim(&self) -> usize;
    fn embed_dim(&self) -> usize;
    fn param_len(&self) -> usize;

    fn embed(&self, images: &ArrayView2<f32>) -> Array2<f32>;
    fn backward(&self, images: &ArrayView2<f32>, grad_embed: &ArrayView2<f32>) -> Vec<f32>;

    fn params(&self) -> Vec<f32>;
    fn load_params(&mut self, params: &[f32]) -> Result<()>;

    /// Toggle between training and evaluation behavior. The bundled backbone
    /// has none, so the default is a no-op.
    fn set_training(&mut self, _training: bool) {}
}

/// L2-normalized linear projection: `embed(x) = normalize_rows(x W^T)`.
///
/// Embeddings always have unit norm (floored at a tiny epsilon), so dot
/// products downstream are cosines and the temperature alone controls the
/// sharpness of the softmax.
#[derive(Debug, Clone)]
pub struct LinearBackbone {
    /// Projection weights, `(embed_dim, input_dim)`.
    w: Array2<f32>,
}

impl LinearBackbone {
    /// Wrap an existing `(embed_dim, input_dim)` weight matrix.
    pub fn from_weights(w: Array2<f32>) -> Result<Self> {
        if w.nrows() == 0 || w.ncols() == 0 {
            return Err(Error::Domain("weights must be non-empty"));
        }
        Ok(Self { w })
    }

    /// Random init scaled by `1/sqrt(input_dim)`, deterministic in `seed`.
    pub fn new(input_dim: usize, embed_dim: usize, seed: u64) -> Result<Self> {
        if input_dim == 0 || embed_dim == 0 {
            return Err(Error::Domain("input_dim and embed_dim must be >= 1"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let scale = 1.0 / (input_dim as f32).sqrt();
        let mut w = Array2::<f32>::zeros((embed_dim, input_dim));
        for slot in w.iter_mut() {
            let v: f32 = StandardNormal.sample(&mut rng);
            *slot = v * scale;
        }
        Ok(Self { w })
    }

    fn raw_embed(&self, images: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(images.ncols(), self.w.ncols());
        images.dot(&self.w.t())
    }
}

impl FeatureExtractor for LinearBackbone {
    fn input_dim(&self) -> usize {
        self.w.ncols()
    }

    fn embed_dim(&self) -> usize {
        self.w.nrows()
    }

    fn param_len(&self) -> usize {
        self.w.len()
    }

    fn embed(&self, images: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = self.raw_embed(images);
        for mut row in out.rows_mut() {
            let norm = row.iter().map(|&x| x * x).sum::<f32>().sqrt().max(NORM_FLOOR);
            row.mapv_inplace(|x| x / norm);
        }
        out
    }

    fn backward(&self, images: &ArrayView2<f32>, grad_embed: &ArrayView2<f32>) -> Vec<f32> {
        debug_assert_eq!(grad_embed.nrows(), images.nrows());
        debug_assert_eq!(grad_embed.ncols(), self.embed_dim());

        let raw = self.raw_embed(images);
        let mut grad_raw = grad_embed.to_owned();
        for (i, mut g_row) in grad_raw.rows_mut().into_iter().enumerate() {
            let raw_row = raw.row(i);
            let norm = raw_row.iter().map(|&x| x * x).sum::<f32>().sqrt().max(NORM_FLOOR);
            // y = raw/norm, so dL/draw = (g - (g.y) y) / norm.
            let dot: f32 = g_row
                .iter()
                .zip(raw_row.iter())
                .map(|(&g, &r)| g * r / norm)
                .sum();
            for (slot, &r) in g_row.iter_mut().zip(raw_row.iter()) {
                *slot = (*slot - dot * r / norm) / norm;
            }
        }

        // dL/dW = grad_raw^T . x, flattened row-major like `params`.
        let grad_w = grad_raw.t().dot(images);
        grad_w.iter().copied().collect()
    }

    fn params(&self) -> Vec<f32> {
        self.w.iter().copied().collect()
    }

    fn load_params(&mut self, params: &[f32]) -> Result<()> {
        if params.len() != self.w.len() {
            return Err(Error::Shape("parameter length does not match backbone"));
        }
        for (slot, &v) in self.w.iter_mut().zip(params.iter()) {
            *slot = v;
        }
        Ok(())
    }
}
