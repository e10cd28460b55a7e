//! The training loop: epochs over deduplicated batches, SGD steps, the
//! step-decay schedule, periodic checkpointing, per-epoch k-NN validation
//! with best-model tracking, and the final evaluation.
//!
//! Control flow per run:
//!
//! 1. **Initializing**: build/validate everything; optionally restore state
//!    (pretrained weights file, a specific epoch checkpoint, or, in
//!    evaluation-only mode, the best-model checkpoint). A missing file
//!    aborts the run.
//! 2. **Training(e)**: for each batch: blocking fetch, deduplicate, embed
//!    both view sets, VISPE loss + gradients, one SGD step. Gradients are
//!    rebuilt from scratch every batch; nothing carries over.
//! 3. **Checkpointing(e)**: after the schedule steps, every
//!    `checkpoint_every`-th epoch persists model + optimizer state.
//! 4. **Validating(e)**: k-NN accuracy on the seen and unseen splits; the
//!    best-model checkpoint is overwritten whenever the seen accuracy is at
//!    least the best so far (ties go to the newer model).
//! 5. **EvaluatingFinal**: restore the best model (training mode) or keep
//!    the restored one (evaluation-only mode) and report both accuracies.
//!
//! The only interruption points are epoch boundaries; a restarted process
//! resumes from the last written checkpoint via `start_epoch`.

use crate::checkpoint::CheckpointStore;
use crate::data::{Batch, BatchSource, LabeledSource};
use crate::eval::retrieval_accuracy;
use crate::loss::VispeLoss;
use crate::model::FeatureExtractor;
use crate::optim::{SgdOptimizer, StepDecay};
use crate::{Error, Result};
use std::path::PathBuf;
use tracing::info;

/// The learning rate decays by `gamma` once per this many epochs.
const LR_STEP_EPOCHS: usize = 10;

/// All knobs of one training run. No ambient configuration: everything the
/// loop and the loss read is in here.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    /// Softmax temperature of the objective.
    pub temperature: f32,
    /// KL-regularizer weight of the objective.
    pub alpha: f32,
    /// Multiplicative LR decay factor, applied every 10 epochs.
    pub gamma: f32,
    /// Dataset tag; part of every checkpoint file name.
    pub dataset: String,
    /// Trial id; part of every checkpoint file name.
    pub trial: u32,
    /// First epoch index. Nonzero resumes from that epoch's checkpoint.
    pub start_epoch: usize,
    /// Skip training entirely and evaluate a restored model.
    pub evaluate_only: bool,
    /// Initialize model weights from this file instead of a checkpoint.
    pub pretrained: Option<PathBuf>,
    /// Neighbor count for k-NN validation.
    pub knn_k: usize,
    /// Emit the batch loss line every this many batches.
    pub log_every: usize,
    /// Persist a periodic checkpoint every this many epochs.
    pub checkpoint_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 32,
            lr: 1e-3,
            momentum: 0.9,
            weight_decay: 5e-4,
            temperature: 0.05,
            alpha: 5.0,
            gamma: 0.1,
            dataset: "mcb".to_owned(),
            trial: 1,
            start_epoch: 0,
            evaluate_only: false,
            pretrained: None,
            knn_k: 960,
            log_every: 50,
            checkpoint_every: 5,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        if self.knn_k == 0 {
            return Err(Error::Domain("knn_k must be >= 1"));
        }
        if self.log_every == 0 || self.checkpoint_every == 0 {
            return Err(Error::Domain("log_every and checkpoint_every must be >= 1"));
        }
        if self.dataset.is_empty() {
            return Err(Error::Domain("dataset tag must be non-empty"));
        }
        // lr/momentum/weight_decay/gamma/temperature/alpha are validated by
        // the components they parameterize.
        Ok(())
    }
}

/// Typed handles to the five data splits a run consumes.
pub struct DataBundle {
    pub train: Box<dyn BatchSource>,
    pub seen_train_knn: Box<dyn LabeledSource>,
    pub seen_test_knn: Box<dyn LabeledSource>,
    pub unseen_train_knn: Box<dyn LabeledSource>,
    pub unseen_test_knn: Box<dyn LabeledSource>,
}

/// Per-epoch observables.
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    pub epoch: usize,
    pub mean_loss: f32,
    pub seen_acc: f32,
    pub unseen_acc: f32,
    pub checkpointed: bool,
    pub best_updated: bool,
}

/// Whole-run observables.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs: Vec<EpochReport>,
    pub best_seen_acc: f32,
    pub final_seen_acc: f32,
    pub final_unseen_acc: f32,
}

/// The exact batch progress line. Downstream tooling parses it with
/// `epoch:(\d+), batch index: \d+, loss:([\d.]+)`; the format is load-bearing.
pub fn batch_log_line(epoch: usize, batch_index: usize, loss: f32) -> String {
    format!("epoch:{epoch}, batch index: {batch_index}, loss:{loss}")
}

/// Best-model overwrite rule: at least as good wins, so among equal
/// accuracies the newest model is kept.
pub fn best_should_update(seen_acc: f32, best_so_far: f32) -> bool {
    seen_acc >= best_so_far
}

pub struct Trainer<M: FeatureExtractor> {
    config: TrainConfig,
    model: M,
    loss: VispeLoss,
    optimizer: SgdOptimizer,
    schedule: StepDecay,
    store: CheckpointStore,
    data: DataBundle,
    best_seen: f32,
}

impl<M: FeatureExtractor> Trainer<M> {
    /// Build a trainer and perform state restoration.
    ///
    /// Restoration precedence: a pretrained weights file if configured, else
    /// the `start_epoch` checkpoint (model + optimizer) if `start_epoch > 0`,
    /// else (only in evaluation-only mode) the best-model checkpoint.
    /// A missing file is a terminal error.
    pub fn new(
        mut model: M,
        data: DataBundle,
        store: CheckpointStore,
        config: TrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        let loss = VispeLoss::new(config.temperature, config.alpha)?;
        let mut optimizer = SgdOptimizer::new(config.lr, config.momentum, config.weight_decay)?;
        let schedule = StepDecay::new(config.lr, config.gamma, LR_STEP_EPOCHS, config.start_epoch)?;
        optimizer.set_lr(schedule.lr());

        if let Some(path) = &config.pretrained {
            info!("loading pretrained weights from {}", path.display());
            model.load_params(&CheckpointStore::load_pretrained(path)?)?;
        } else if config.start_epoch > 0 {
            info!(
                "loading model and optimizer from epoch {}",
                config.start_epoch
            );
            let (params, state) =
                store.load_epoch(&config.dataset, config.trial, config.start_epoch)?;
            model.load_params(&params)?;
            optimizer.load_state(state);
        } else if config.evaluate_only {
            info!("loading best model for evaluation");
            model.load_params(&store.load_best(&config.dataset, config.trial)?)?;
        }

        Ok(Self {
            config,
            model,
            loss,
            optimizer,
            schedule,
            store,
            data,
            best_seen: 0.0,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Drive the run to completion and return its observables.
    pub fn run(&mut self) -> Result<TrainReport> {
        let epochs = if self.config.evaluate_only {
            0
        } else {
            self.config.epochs
        };

        info!(
            dataset = %self.config.dataset,
            trial = self.config.trial,
            epochs,
            batch_size = self.config.batch_size,
            lr = self.config.lr,
            temperature = self.config.temperature,
            alpha = self.config.alpha,
            "start training"
        );

        let mut reports = Vec::new();
        for epoch in self.config.start_epoch..epochs {
            self.model.set_training(true);
            let mean_loss = self.train_epoch(epoch)?;

            self.schedule.step();
            self.optimizer.set_lr(self.schedule.lr());

            let checkpointed = (epoch + 1) % self.config.checkpoint_every == 0;
            if checkpointed {
                self.store.save_epoch(
                    &self.config.dataset,
                    self.config.trial,
                    epoch + 1,
                    &self.model.params(),
                    &self.optimizer.state(),
                )?;
                info!(
                    "saved model checkpoint at epoch {} to {}",
                    epoch + 1,
                    self.store
                        .epoch_path(&self.config.dataset, self.config.trial, epoch + 1)
                        .display()
                );
            }

            let (seen_acc, unseen_acc) = self.validate()?;
            let best_updated = best_should_update(seen_acc, self.best_seen);
            if best_updated {
                self.best_seen = seen_acc;
                self.store.save_best(
                    &self.config.dataset,
                    self.config.trial,
                    &self.model.params(),
                )?;
            }
            info!("test seen_acc:{seen_acc} unseen_acc:{unseen_acc}");

            reports.push(EpochReport {
                epoch,
                mean_loss,
                seen_acc,
                unseen_acc,
                checkpointed,
                best_updated,
            });
        }

        // Final evaluation: in training mode, report the best model rather
        // than whatever the last epoch left behind.
        if !self.config.evaluate_only {
            self.model
                .load_params(&self.store.load_best(&self.config.dataset, self.config.trial)?)?;
        }
        let (final_seen_acc, final_unseen_acc) = self.validate()?;
        info!("test seen_acc:{final_seen_acc} unseen_acc:{final_unseen_acc}");

        Ok(TrainReport {
            epochs: reports,
            best_seen_acc: self.best_seen,
            final_seen_acc,
            final_unseen_acc,
        })
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<f32> {
        self.data.train.reset();
        let mut loss_acc = 0.0f64;
        let mut batches = 0usize;
        let mut batch_index = 0usize;
        while let Some(batch) = self.data.train.next_batch() {
            let loss_value = self.train_batch(&batch)?;
            if batch_index % self.config.log_every == 0 {
                info!("{}", batch_log_line(epoch, batch_index, loss_value));
            }
            loss_acc += loss_value as f64;
            batches += 1;
            batch_index += 1;
        }
        if batches == 0 {
            return Err(Error::Domain("training source yielded no batches"));
        }
        Ok((loss_acc / batches as f64) as f32)
    }

    fn train_batch(&mut self, batch: &Batch) -> Result<f32> {
        let batch = batch.deduplicated();
        let e1 = self.model.embed(&batch.primary.view());
        let e2 = self.model.embed(&batch.secondary.view());
        let (terms, grads) = self.loss.terms_with_grads(&e1.view(), &e2.view())?;

        let mut grad = self.model.backward(&batch.primary.view(), &grads.e1.view());
        let grad2 = self
            .model
            .backward(&batch.secondary.view(), &grads.e2.view());
        for (a, b) in grad.iter_mut().zip(grad2) {
            *a += b;
        }

        let mut params = self.model.params();
        self.optimizer.step(&mut params, &grad);
        self.model.load_params(&params)?;
        Ok(terms.total)
    }

    fn validate(&mut self) -> Result<(f32, f32)> {
        self.model.set_training(false);
        let seen = retrieval_accuracy(
            &self.model,
            self.data.seen_train_knn.as_mut(),
            self.data.seen_test_knn.as_mut(),
            self.config.knn_k,
        )?;
        let unseen = retrieval_accuracy(
            &self.model,
            self.data.unseen_train_knn.as_mut(),
            self.data.unseen_test_knn.as_mut(),
            self.config.knn_k,
        )?;
        Ok((seen, unseen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_log_line_is_pinned() {
        assert_eq!(
            batch_log_line(3, 50, 0.125),
            "epoch:3, batch index: 50, loss:0.125"
        );
        assert_eq!(batch_log_line(0, 0, 2.0), "epoch:0, batch index: 0, loss:2");
    }

    #[test]
    fn best_update_rule_ties_overwrite() {
        // Accuracy sequence 0.5, 0.5, 0.4, 0.6 -> writes at epochs 0, 1, 3.
        let accs = [0.5f32, 0.5, 0.4, 0.6];
        let mut best = 0.0f32;
        let mut writes = Vec::new();
        for (epoch, &acc) in accs.iter().enumerate() {
            if best_should_update(acc, best) {
                best = acc;
                writes.push(epoch);
            }
        }
        assert_eq!(writes, vec![0, 1, 3]);
    }

    #[test]
    fn config_defaults_match_the_published_interface() {
        let config = TrainConfig::default();
        assert_eq!(config.epochs, 100);
        assert_eq!(config.batch_size, 32);
        assert!((config.lr - 1e-3).abs() < 1e-9);
        assert!((config.temperature - 0.05).abs() < 1e-9);
        assert!((config.alpha - 5.0).abs() < 1e-9);
        assert!((config.gamma - 0.1).abs() < 1e-9);
        assert_eq!(config.dataset, "mcb");
        assert_eq!(config.checkpoint_every, 5);
        assert_eq!(config.log_every, 50);
        config.validate().unwrap();
    }

    #[test]
    fn config_rejects_degenerate_values() {
        let mut config = TrainConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.knn_k = 0;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.dataset.clear();
        assert!(config.validate().is_err());
    }
}
