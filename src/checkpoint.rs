//! Persisted model/optimizer state keyed by dataset name, trial id, and
//! (for periodic checkpoints) epoch.
//!
//! File names are a stable external interface consumed by resume tooling:
//!
//! - best model:          `<root>/model_<dataset>_<trial>.pt`
//! - periodic checkpoint: `<root>/model_<dataset>_<trial>_epoch<N>.pt`
//!
//! The best-model record carries model parameters only; the periodic record
//! carries model and optimizer state. The payload is a serde record (JSON);
//! the `.pt` extension is kept for path compatibility.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk checkpoint payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub model_params: Vec<f32>,
    /// Present in periodic checkpoints, absent in best-model records.
    pub optimizer_state: Option<Vec<f32>>,
}

/// Store rooted at a directory (created on first save).
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn best_path(&self, dataset: &str, trial: u32) -> PathBuf {
        self.root.join(format!("model_{dataset}_{trial}.pt"))
    }

    pub fn epoch_path(&self, dataset: &str, trial: u32, epoch: usize) -> PathBuf {
        self.root
            .join(format!("model_{dataset}_{trial}_epoch{epoch}.pt"))
    }

    fn write(&self, path: &Path, record: &CheckpointRecord) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|source| Error::Persist {
            path: self.root.clone(),
            source,
        })?;
        let json = serde_json::to_string(record)?;
        std::fs::write(path, json).map_err(|source| Error::Persist {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read(path: &Path) -> Result<CheckpointRecord> {
        if !path.is_file() {
            return Err(Error::MissingCheckpoint {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| Error::Persist {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Overwrite the best-model record (model parameters only).
    pub fn save_best(&self, dataset: &str, trial: u32, model_params: &[f32]) -> Result<()> {
        self.write(
            &self.best_path(dataset, trial),
            &CheckpointRecord {
                model_params: model_params.to_vec(),
                optimizer_state: None,
            },
        )
    }

    /// Write the periodic checkpoint for `epoch` (model + optimizer).
    pub fn save_epoch(
        &self,
        dataset: &str,
        trial: u32,
        epoch: usize,
        model_params: &[f32],
        optimizer_state: &[f32],
    ) -> Result<()> {
        self.write(
            &self.epoch_path(dataset, trial, epoch),
            &CheckpointRecord {
                model_params: model_params.to_vec(),
                optimizer_state: Some(optimizer_state.to_vec()),
            },
        )
    }

    /// Model parameters from the best-model record.
    pub fn load_best(&self, dataset: &str, trial: u32) -> Result<Vec<f32>> {
        Ok(Self::read(&self.best_path(dataset, trial))?.model_params)
    }

    /// Model parameters and optimizer state from a periodic checkpoint.
    pub fn load_epoch(
        &self,
        dataset: &str,
        trial: u32,
        epoch: usize,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let path = self.epoch_path(dataset, trial, epoch);
        let record = Self::read(&path)?;
        let optimizer_state = record
            .optimizer_state
            .ok_or(Error::Domain("epoch checkpoint is missing optimizer state"))?;
        Ok((record.model_params, optimizer_state))
    }

    /// Model parameters from an externally produced weights file (same record
    /// layout; optimizer state, if any, is ignored).
    pub fn load_pretrained(path: &Path) -> Result<Vec<f32>> {
        Ok(Self::read(path)?.model_params)
    }
}
