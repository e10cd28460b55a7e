//! Training/evaluation entry point.
//!
//! The image pipeline is a collaborator this crate does not own, so the
//! binary wires the trainer to a deterministic synthetic multi-view dataset
//! (clustered unit directions with per-object and per-view jitter). Swap the
//! [`DataBundle`] construction for a real pipeline to train on disk data.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ndarray::s;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vispe::checkpoint::CheckpointStore;
use vispe::data::{flatten_views, synthetic_object_views, InMemoryLabeled, InMemoryViews};
use vispe::model::LinearBackbone;
use vispe::train::{DataBundle, TrainConfig, Trainer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Net {
    /// L2-normalized linear projection backbone.
    Linear,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Dataset {
    Mcb,
}

impl Dataset {
    fn tag(self) -> &'static str {
        match self {
            Dataset::Mcb => "mcb",
        }
    }

    fn knn_k(self) -> usize {
        match self {
            Dataset::Mcb => 960,
        }
    }
}

/// Self-supervised multi-view embedding training.
#[derive(Debug, Parser)]
#[command(name = "vispe-train", version, about)]
struct Args {
    /// Number of training epochs.
    #[arg(short = 'e', long, default_value_t = 100)]
    epochs: usize,

    /// Batch size.
    #[arg(long = "batch-size", default_value_t = 32)]
    batch_size: usize,

    /// Learning rate.
    #[arg(long, visible_alias = "learning-rate", default_value_t = 1e-3)]
    lr: f32,

    /// SGD momentum.
    #[arg(long, default_value_t = 0.9)]
    momentum: f32,

    /// Regularization weight decay.
    #[arg(long = "weight-decay", default_value_t = 5e-4)]
    weight_decay: f32,

    /// Switch to evaluate mode (restores the best model, no training).
    #[arg(long)]
    evaluate: bool,

    /// Accelerator index. This build is CPU-only; nonzero values warn.
    #[arg(long = "gpu-num", default_value_t = 0)]
    gpu_num: u32,

    /// Backbone model.
    #[arg(long, value_enum, default_value_t = Net::Linear)]
    net: Net,

    /// Dataset tag (checkpoint naming + k-NN neighbor count).
    #[arg(long, value_enum, default_value_t = Dataset::Mcb)]
    dataset: Dataset,

    /// Softmax temperature of the objective.
    #[arg(long, default_value_t = 0.05)]
    lamda: f32,

    /// KL-regularizer weight of the objective.
    #[arg(long, default_value_t = 5.0)]
    alpha: f32,

    /// Trial id (checkpoint naming).
    #[arg(long, default_value_t = 1)]
    trial: u32,

    /// Starting epoch; nonzero resumes from that epoch's checkpoint.
    #[arg(long = "start-epoch", default_value_t = 0)]
    start_epoch: usize,

    /// Initialize from pretrain/pretrain.pt instead of a checkpoint.
    #[arg(long = "load-pretrain")]
    load_pretrain: bool,

    /// Multiplicative factor for learning-rate decay.
    #[arg(long, default_value_t = 0.1)]
    gamma: f32,

    /// Flattened input dimensionality of the synthetic views.
    #[arg(long = "input-dim", default_value_t = 64)]
    input_dim: usize,

    /// Embedding dimensionality of the backbone.
    #[arg(long = "embed-dim", default_value_t = 1280)]
    embed_dim: usize,

    /// Seed for the synthetic dataset and the backbone init.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

/// Synthetic stand-in for the on-disk multi-view dataset: a seen corpus and a
/// disjoint unseen corpus, each with train/test view splits.
fn synthetic_bundle(args: &Args) -> Result<DataBundle> {
    const VIEWS: usize = 12;
    const TRAIN_VIEWS: usize = 9;

    let (seen, seen_labels) =
        synthetic_object_views(8, 4, VIEWS, args.input_dim, 0.08, args.seed);
    let (unseen, unseen_labels) =
        synthetic_object_views(3, 4, VIEWS, args.input_dim, 0.08, args.seed.wrapping_add(101));

    let seen_train = seen.slice(s![.., ..TRAIN_VIEWS, ..]).to_owned();
    let seen_test = seen.slice(s![.., TRAIN_VIEWS.., ..]).to_owned();
    let unseen_train = unseen.slice(s![.., ..TRAIN_VIEWS, ..]).to_owned();
    let unseen_test = unseen.slice(s![.., TRAIN_VIEWS.., ..]).to_owned();

    let (seen_train_rows, seen_train_labels) = flatten_views(&seen_train, &seen_labels);
    let (seen_test_rows, seen_test_labels) = flatten_views(&seen_test, &seen_labels);
    let (unseen_train_rows, unseen_train_labels) = flatten_views(&unseen_train, &unseen_labels);
    let (unseen_test_rows, unseen_test_labels) = flatten_views(&unseen_test, &unseen_labels);

    Ok(DataBundle {
        train: Box::new(InMemoryViews::new(
            seen_train,
            args.batch_size,
            args.seed.wrapping_add(7),
        )?),
        seen_train_knn: Box::new(InMemoryLabeled::new(
            seen_train_rows,
            seen_train_labels,
            args.batch_size,
        )?),
        seen_test_knn: Box::new(InMemoryLabeled::new(
            seen_test_rows,
            seen_test_labels,
            args.batch_size,
        )?),
        unseen_train_knn: Box::new(InMemoryLabeled::new(
            unseen_train_rows,
            unseen_train_labels,
            args.batch_size,
        )?),
        unseen_test_knn: Box::new(InMemoryLabeled::new(
            unseen_test_rows,
            unseen_test_labels,
            args.batch_size,
        )?),
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.gpu_num != 0 {
        tracing::warn!(
            "gpu {} requested, but this build is CPU-only; running on the host",
            args.gpu_num
        );
    }

    let config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        lr: args.lr,
        momentum: args.momentum,
        weight_decay: args.weight_decay,
        temperature: args.lamda,
        alpha: args.alpha,
        gamma: args.gamma,
        dataset: args.dataset.tag().to_owned(),
        trial: args.trial,
        start_epoch: args.start_epoch,
        evaluate_only: args.evaluate,
        pretrained: args
            .load_pretrain
            .then(|| PathBuf::from("pretrain/pretrain.pt")),
        knn_k: args.dataset.knn_k(),
        ..TrainConfig::default()
    };

    let model = match args.net {
        Net::Linear => LinearBackbone::new(args.input_dim, args.embed_dim, args.seed)?,
    };
    let data = synthetic_bundle(&args)?;
    let store = CheckpointStore::new("model");

    let mut trainer = Trainer::new(model, data, store, config)?;
    let report = trainer.run()?;

    println!(
        "test seen_acc:{} unseen_acc:{}",
        report.final_seen_acc, report.final_unseen_acc
    );
    Ok(())
}
