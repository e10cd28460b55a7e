//! # vispe
//!
//! Self-supervised multi-view embedding training with a prototype-regularized
//! contrastive objective, evaluated by k-nearest-neighbor retrieval.
//!
//! This crate is intentionally small:
//!
//! - it implements the **training loop** and the **VISPE objective** (two
//!   temperature-scaled prototype distributions per batch, tied together by a
//!   symmetric cross-entropy term and a KL regularizer),
//! - it treats the backbone as an opaque feature extractor behind the
//!   [`model::FeatureExtractor`] trait,
//! - it does not own the image pipeline: data arrives through the blocking
//!   [`data::BatchSource`] / [`data::LabeledSource`] seams.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: anything random takes a `seed`.
//! - **No hidden normalization**: the bundled backbone L2-normalizes its
//!   embeddings and says so in its doc comment; the loss itself never
//!   normalizes its inputs.
//! - **Backend-agnostic by default**: the default path is `ndarray` with
//!   closed-form gradients; no GPU framework types leak through the public
//!   API. An autodiff training backend (`burn`) is **feature-gated**.
//! - **Checkpoint names are stable**: `model_<dataset>_<trial>.pt` and
//!   `model_<dataset>_<trial>_epoch<N>.pt` under the store root, consumed by
//!   external tooling.
//!
//! ## Module map
//!
//! - `similarity`: temperature-scaled similarity matrices and row softmax
//! - `loss`: the VISPE objective (value + analytic gradients)
//! - `data`: batches, deduplication, data-source traits, interchange format
//! - `model`: the feature-extractor seam and one linear baseline backbone
//! - `optim`: SGD with momentum/weight decay and the step-decay LR schedule
//! - `eval`: k-NN retrieval accuracy over reference/query splits
//! - `checkpoint`: persisted model/optimizer state keyed by dataset and trial
//! - `train`: the epoch/checkpoint/validation control flow

pub mod checkpoint;
pub mod data;
pub mod eval;
pub mod loss;
pub mod model;
pub mod optim;
pub mod similarity;
pub mod train;

#[cfg(feature = "burn")]
pub mod burn_vispe;

/// vispe error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("checkpoint not found: {}", path.display())]
    MissingCheckpoint { path: std::path::PathBuf },
    #[error("persist error at {}: {source}", path.display())]
    Persist {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
