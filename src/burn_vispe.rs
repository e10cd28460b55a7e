//! Burn-backed (opt-in) training for the VISPE objective that exports to the
//! default ndarray model.
//!
//! Design goal: use Burn autodiff + optimizers to train, but keep the public
//! model type ([`LinearBackbone`]) unchanged by exporting learned parameters
//! back out. Burn is a backend for **training**; no Burn tensor types leak
//! into the default API surface.
//!
//! Scope note: this path runs plain SGD (`SgdConfig::new()`); momentum,
//! weight decay and the LR schedule live on the default ndarray path.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::{backend::Backend, Tensor};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::{Linear, LinearConfig};
use burn_optim::{GradientsParams, LearningRate, Optimizer, SgdConfig};
use ndarray::Array2;

use crate::data::BatchSource;
use crate::loss::VispeLoss;
use crate::model::LinearBackbone;
use crate::{Error, Result};

/// Default burn backend for this training loop: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

#[derive(Module, Debug)]
struct BurnLinearBackbone<B: Backend> {
    linear: Linear<B>,
    embed_dim: usize,
}

impl<B: Backend> BurnLinearBackbone<B> {
    fn new(device: &B::Device, input_dim: usize, embed_dim: usize) -> Self {
        // No bias, matching the ndarray backbone's parameterization.
        let linear = LinearConfig::new(input_dim, embed_dim)
            .with_bias(false)
            .init(device);
        Self { linear, embed_dim }
    }

    /// L2-normalized projection: `normalize_rows(x W)`.
    fn embed(&self, images: Tensor<B, 2>) -> Tensor<B, 2> {
        let raw = self.linear.forward(images);
        let norm = raw
            .clone()
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt()
            .add_scalar(1e-12);
        raw / norm
    }

    fn export_to_ndarray(&self) -> Result<LinearBackbone> {
        // Burn Linear weight is [d_input, d_output]; the ndarray backbone
        // wants [embed_dim, input_dim].
        let w_data = self.linear.weight.to_data();
        let w_shape = &w_data.shape;
        debug_assert_eq!(w_shape.len(), 2);
        let d_in = w_shape[0];
        let d_out = w_shape[1];
        debug_assert_eq!(d_out, self.embed_dim);

        let w_flat: Vec<f32> = w_data
            .to_vec::<f32>()
            .map_err(|_| Error::Domain("weight export failed"))?;
        // w_flat is row-major: w_flat[i * d_out + j], i over inputs.
        let mut w = Array2::<f32>::zeros((d_out, d_in));
        for j in 0..d_out {
            for i in 0..d_in {
                w[[j, i]] = w_flat[i * d_out + j];
            }
        }
        LinearBackbone::from_weights(w)
    }
}

fn ndarray_to_burn_2<B: Backend>(device: &B::Device, x: &Array2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let data = burn::tensor::TensorData::new(x.as_slice().unwrap_or(&[]).to_vec(), [n, d]);
    Tensor::from_data(data, device)
}

fn log_row_softmax<B: Backend>(z: Tensor<B, 2>) -> Tensor<B, 2> {
    let max = z.clone().max_dim(1);
    let shifted = z - max;
    let lse = shifted.clone().exp().sum_dim(1).log();
    shifted - lse
}

/// The VISPE objective in burn tensor ops.
///
/// `eye` must be the `n x n` identity for the (deduplicated) batch size; the
/// same-view logit diagonal is replaced by the cross-view one through it,
/// and the loss follows the closed form of [`crate::loss::VispeLoss`].
pub fn vispe_loss<B: Backend>(
    e1: Tensor<B, 2>,
    e2: Tensor<B, 2>,
    eye: Tensor<B, 2>,
    loss: &VispeLoss,
) -> Tensor<B, 1> {
    let z1 = e1
        .matmul(e2.clone().transpose())
        .div_scalar(loss.temperature);
    let z2_raw = e2.clone().matmul(e2.transpose()).div_scalar(loss.temperature);

    // z2 with its diagonal overwritten by z1's diagonal.
    let inv_eye = eye.clone().neg().add_scalar(1.0);
    let z2 = z2_raw * inv_eye + z1.clone() * eye.clone();

    let l1 = log_row_softmax(z1);
    let l2 = log_row_softmax(z2);
    let p2 = l2.clone().exp();

    let diag1 = (l1.clone() * eye.clone()).sum_dim(1);
    let diag2 = (l2.clone() * eye).sum_dim(1);
    let loss_ce = (diag1 + diag2).mean().neg();
    let loss_kl = (p2 * (l2 - l1)).sum_dim(1).mean();

    loss_ce + loss_kl.mul_scalar(loss.alpha)
}

/// Burn-backed training over a batch source, exporting the learned weights
/// into the default ndarray backbone.
pub fn train_vispe_linear_burn(
    device: &<BurnBackend as Backend>::Device,
    source: &mut dyn BatchSource,
    input_dim: usize,
    embed_dim: usize,
    epochs: usize,
    loss: &VispeLoss,
    lr: LearningRate,
) -> Result<LinearBackbone> {
    if input_dim == 0 || embed_dim == 0 {
        return Err(Error::Domain("input_dim and embed_dim must be >= 1"));
    }
    if epochs == 0 {
        return Err(Error::Domain("epochs must be >= 1"));
    }

    let mut model = BurnLinearBackbone::<BurnBackend>::new(device, input_dim, embed_dim);
    let mut optim = SgdConfig::new().init::<BurnBackend, BurnLinearBackbone<BurnBackend>>();

    for _epoch in 0..epochs {
        source.reset();
        while let Some(batch) = source.next_batch() {
            let batch = batch.deduplicated();
            let n = batch.len();
            if n == 0 {
                continue;
            }
            let x1 = ndarray_to_burn_2::<BurnBackend>(device, &batch.primary);
            let x2 = ndarray_to_burn_2::<BurnBackend>(device, &batch.secondary);
            let eye = ndarray_to_burn_2::<BurnBackend>(device, &Array2::<f32>::eye(n));

            let e1 = model.embed(x1);
            let e2 = model.embed(x2);
            let loss_value = vispe_loss(e1, e2, eye, loss);

            let grads = loss_value.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);
        }
    }

    model.export_to_ndarray()
}
