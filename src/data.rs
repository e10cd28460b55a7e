//! Batches, duplicate-object filtering, data-source seams, and the dataset
//! interchange format.
//!
//! The image pipeline (decoding, augmentation, shuffling workers) is a
//! collaborator, not part of this crate. The core consumes:
//!
//! - [`BatchSource`]: a blocking "next training batch" seam,
//! - [`LabeledSource`]: a blocking labeled-sample seam for the k-NN splits,
//!
//! and understands the serialized dataset layout via [`DatasetRecord`].
//! Deterministic in-memory implementations are provided for tests and the
//! demo binary.

use crate::{Error, Result};
use ndarray::{Array2, Array3, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One training batch: two positionally paired view sets and the object
/// identity behind each pair.
///
/// Rows are flattened image tensors; the backbone seam decides what a row
/// means. Before deduplication the same object may appear more than once.
#[derive(Debug, Clone)]
pub struct Batch {
    pub primary: Array2<f32>,
    pub secondary: Array2<f32>,
    pub object_ids: Vec<String>,
}

/// Indices of the first occurrence of each distinct id, in original order.
pub fn first_occurrence_indices<T: Eq + std::hash::Hash>(ids: &[T]) -> Vec<usize> {
    let mut seen = HashSet::new();
    let mut keep = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        if seen.insert(id) {
            keep.push(i);
        }
    }
    keep
}

impl Batch {
    pub fn len(&self) -> usize {
        self.object_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_ids.is_empty()
    }

    /// Drop all but the first occurrence of each object id.
    ///
    /// A multi-view dataset may yield several same-object pairs per batch by
    /// chance; duplicate rows would give the contrastive objective more than
    /// one valid positive per row, so they are filtered before the loss.
    pub fn deduplicated(&self) -> Batch {
        let keep = first_occurrence_indices(&self.object_ids);
        if keep.len() == self.len() {
            return self.clone();
        }
        Batch {
            primary: self.primary.select(Axis(0), &keep),
            secondary: self.secondary.select(Axis(0), &keep),
            object_ids: keep.iter().map(|&i| self.object_ids[i].clone()).collect(),
        }
    }
}

/// Blocking training-batch seam. `next_batch` returns `None` at the end of an
/// epoch; `reset` starts the next one (reshuffling is the source's concern).
pub trait BatchSource {
    fn next_batch(&mut self) -> Option<Batch>;
    fn reset(&mut self);
}

/// Blocking labeled-sample seam for the k-NN reference/query splits.
///
/// `len` is the total sample count, used to preallocate the embedding matrix.
pub trait LabeledSource {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn next_batch(&mut self) -> Option<(Array2<f32>, Vec<usize>)>;
    fn reset(&mut self);
}

// ── Interchange format ─────────────────────────────────────────────────────

/// One split of the serialized dataset mapping: parallel sequences of a
/// primary image path, the alternate-view paths for the same object, and an
/// integer class label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRecord {
    pub img_pth: Vec<String>,
    pub img2_pth: Vec<Vec<String>>,
    pub labels: Vec<i64>,
}

/// The full interchange mapping: a `train` and a `test` split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub train: SplitRecord,
    pub test: SplitRecord,
}

impl SplitRecord {
    fn validate(&self) -> Result<()> {
        if self.img_pth.len() != self.img2_pth.len() || self.img_pth.len() != self.labels.len() {
            return Err(Error::Shape(
                "img_pth, img2_pth and labels must have equal length",
            ));
        }
        Ok(())
    }
}

impl DatasetRecord {
    /// Parse and validate an interchange file (JSON rendering of the mapping).
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Persist {
            path: path.to_path_buf(),
            source,
        })?;
        let record: DatasetRecord = serde_json::from_str(&text)?;
        record.train.validate()?;
        record.test.validate()?;
        Ok(record)
    }
}

// ── Deterministic in-memory sources ────────────────────────────────────────

/// Multi-view training source over an in-memory tensor of shape
/// `(objects, views, dim)`.
///
/// One epoch visits every (object, view) pair once in shuffled order; the
/// secondary view is drawn uniformly among the object's other views, matching
/// the sampling of the on-disk pipeline this stands in for. The RNG stream
/// continues across epochs, so a whole run is reproducible from one seed.
pub struct InMemoryViews {
    views: Array3<f32>,
    batch_size: usize,
    rng: ChaCha8Rng,
    order: Vec<(usize, usize)>,
    cursor: usize,
}

impl InMemoryViews {
    pub fn new(views: Array3<f32>, batch_size: usize, seed: u64) -> Result<Self> {
        let (objects, per_object, dim) = views.dim();
        if objects == 0 || dim == 0 {
            return Err(Error::Domain("views must be non-empty"));
        }
        if per_object < 2 {
            return Err(Error::Domain("each object needs at least two views"));
        }
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        let mut source = Self {
            views,
            batch_size,
            rng: ChaCha8Rng::seed_from_u64(seed),
            order: Vec::new(),
            cursor: 0,
        };
        source.reshuffle();
        Ok(source)
    }

    fn reshuffle(&mut self) {
        let (objects, per_object, _) = self.views.dim();
        self.order.clear();
        for obj in 0..objects {
            for view in 0..per_object {
                self.order.push((obj, view));
            }
        }
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }
}

impl BatchSource for InMemoryViews {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let items = &self.order[self.cursor..end];
        let (_, per_object, dim) = self.views.dim();

        let mut primary = Array2::<f32>::zeros((items.len(), dim));
        let mut secondary = Array2::<f32>::zeros((items.len(), dim));
        let mut object_ids = Vec::with_capacity(items.len());
        for (row, &(obj, view)) in items.iter().enumerate() {
            // Uniform over the object's other views.
            let mut other = self.rng.random_range(0..per_object - 1);
            if other >= view {
                other += 1;
            }
            primary.row_mut(row).assign(&self.views.slice(ndarray::s![obj, view, ..]));
            secondary
                .row_mut(row)
                .assign(&self.views.slice(ndarray::s![obj, other, ..]));
            object_ids.push(format!("obj-{obj}"));
        }
        self.cursor = end;
        Some(Batch {
            primary,
            secondary,
            object_ids,
        })
    }

    fn reset(&mut self) {
        self.reshuffle();
    }
}

/// Labeled evaluation source over in-memory rows, served in a fixed order.
pub struct InMemoryLabeled {
    features: Array2<f32>,
    labels: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl InMemoryLabeled {
    pub fn new(features: Array2<f32>, labels: Vec<usize>, batch_size: usize) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(Error::Shape("features and labels must have equal length"));
        }
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        Ok(Self {
            features,
            labels,
            batch_size,
            cursor: 0,
        })
    }
}

impl LabeledSource for InMemoryLabeled {
    fn len(&self) -> usize {
        self.features.nrows()
    }

    fn next_batch(&mut self) -> Option<(Array2<f32>, Vec<usize>)> {
        if self.cursor >= self.features.nrows() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.features.nrows());
        let rows: Vec<usize> = (self.cursor..end).collect();
        let feats = self.features.select(Axis(0), &rows);
        let labels = self.labels[self.cursor..end].to_vec();
        self.cursor = end;
        Some((feats, labels))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}

// ── Synthetic data (demo binary + tests) ───────────────────────────────────

/// Deterministic clustered multi-view data: each class gets a random unit
/// direction, each object perturbs it (at twice the view jitter, so objects
/// stay distinguishable from their own views), each view perturbs the object
/// again.
///
/// A stand-in for the out-of-scope image pipeline so the trainer can be
/// exercised end to end. Returns the view tensor `(objects, views, dim)` and
/// one class label per object.
pub fn synthetic_object_views(
    classes: usize,
    objects_per_class: usize,
    views_per_object: usize,
    dim: usize,
    noise: f32,
    seed: u64,
) -> (Array3<f32>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let objects = classes * objects_per_class;
    let mut views = Array3::<f32>::zeros((objects, views_per_object, dim));
    let mut labels = Vec::with_capacity(objects);

    let mut centers = Array2::<f32>::zeros((classes, dim));
    for c in 0..classes {
        let mut norm_sq = 0.0f32;
        for k in 0..dim {
            let v: f32 = StandardNormal.sample(&mut rng);
            centers[[c, k]] = v;
            norm_sq += v * v;
        }
        let inv = 1.0 / norm_sq.sqrt().max(1e-12);
        for k in 0..dim {
            centers[[c, k]] *= inv;
        }
    }

    for c in 0..classes {
        for _ in 0..objects_per_class {
            let obj = labels.len();
            labels.push(c);
            let mut anchor = vec![0.0f32; dim];
            for (k, slot) in anchor.iter_mut().enumerate() {
                let jitter: f32 = StandardNormal.sample(&mut rng);
                *slot = centers[[c, k]] + 2.0 * noise * jitter;
            }
            for view in 0..views_per_object {
                for k in 0..dim {
                    let jitter: f32 = StandardNormal.sample(&mut rng);
                    views[[obj, view, k]] = anchor[k] + noise * jitter;
                }
            }
        }
    }
    (views, labels)
}

/// Flatten a view tensor into per-view labeled rows for a [`LabeledSource`].
pub fn flatten_views(views: &Array3<f32>, object_labels: &[usize]) -> (Array2<f32>, Vec<usize>) {
    let (objects, per_object, dim) = views.dim();
    debug_assert_eq!(objects, object_labels.len());
    let mut features = Array2::<f32>::zeros((objects * per_object, dim));
    let mut labels = Vec::with_capacity(objects * per_object);
    for obj in 0..objects {
        for view in 0..per_object {
            features
                .row_mut(obj * per_object + view)
                .assign(&views.slice(ndarray::s![obj, view, ..]));
            labels.push(object_labels[obj]);
        }
    }
    (features, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dedup_keeps_first_occurrences_in_order() {
        let ids = ["a", "b", "a", "c", "b", "d"];
        assert_eq!(first_occurrence_indices(&ids), vec![0, 1, 3, 5]);
    }

    proptest! {
        #[test]
        fn prop_dedup_output_is_unique_and_ordered(ids in proptest::collection::vec(0u8..12, 0..64)) {
            let keep = first_occurrence_indices(&ids);
            prop_assert!(keep.len() <= ids.len());
            // Strictly increasing indices preserve original order.
            for w in keep.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
            let kept: Vec<u8> = keep.iter().map(|&i| ids[i]).collect();
            let unique: HashSet<u8> = kept.iter().copied().collect();
            prop_assert_eq!(unique.len(), kept.len());
            // Every distinct input id survives.
            let all: HashSet<u8> = ids.iter().copied().collect();
            prop_assert_eq!(all, unique);
        }
    }

    #[test]
    fn batch_dedup_selects_matching_rows() {
        let batch = Batch {
            primary: ndarray::array![[1.0f32], [2.0], [3.0]],
            secondary: ndarray::array![[10.0f32], [20.0], [30.0]],
            object_ids: vec!["x".into(), "y".into(), "x".into()],
        };
        let deduped = batch.deduplicated();
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped.object_ids, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(deduped.primary[[0, 0]], 1.0);
        assert_eq!(deduped.primary[[1, 0]], 2.0);
        assert_eq!(deduped.secondary[[1, 0]], 20.0);
    }

    #[test]
    fn interchange_record_round_trips_and_validates() {
        let record = DatasetRecord {
            train: SplitRecord {
                img_pth: vec!["a/1.jpg".into(), "a/2.jpg".into()],
                img2_pth: vec![vec!["a/1b.jpg".into()], vec!["a/2b.jpg".into()]],
                labels: vec![0, 1],
            },
            test: SplitRecord {
                img_pth: vec!["b/1.jpg".into()],
                img2_pth: vec![vec!["b/1b.jpg".into()]],
                labels: vec![0],
            },
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
        let loaded = DatasetRecord::from_json_file(&path).unwrap();
        assert_eq!(loaded.train.img_pth, record.train.img_pth);
        assert_eq!(loaded.test.labels, record.test.labels);

        let broken = r#"{"train":{"img_pth":["a"],"img2_pth":[],"labels":[0]},
                         "test":{"img_pth":[],"img2_pth":[],"labels":[]}}"#;
        let bad_path = dir.path().join("bad.json");
        std::fs::write(&bad_path, broken).unwrap();
        assert!(DatasetRecord::from_json_file(&bad_path).is_err());
    }

    #[test]
    fn in_memory_views_cover_an_epoch_deterministically() {
        let (views, _) = synthetic_object_views(2, 3, 4, 5, 0.1, 7);
        let mut a = InMemoryViews::new(views.clone(), 4, 42).unwrap();
        let mut b = InMemoryViews::new(views, 4, 42).unwrap();

        let mut total = 0usize;
        loop {
            match (a.next_batch(), b.next_batch()) {
                (Some(x), Some(y)) => {
                    assert_eq!(x.object_ids, y.object_ids);
                    assert_eq!(x.primary, y.primary);
                    assert_eq!(x.secondary, y.secondary);
                    assert!(x.len() <= 4);
                    total += x.len();
                }
                (None, None) => break,
                _ => panic!("sources diverged"),
            }
        }
        // 6 objects x 4 views.
        assert_eq!(total, 24);
    }

    #[test]
    fn secondary_view_differs_from_primary() {
        // Views are far apart, so a same-view pairing would be detectable as
        // an exactly-equal row.
        let (views, _) = synthetic_object_views(1, 2, 6, 3, 0.2, 9);
        let mut source = InMemoryViews::new(views, 64, 1).unwrap();
        let batch = source.next_batch().unwrap();
        for i in 0..batch.len() {
            assert_ne!(batch.primary.row(i), batch.secondary.row(i));
        }
    }

    #[test]
    fn labeled_source_walks_rows_once() {
        let (views, labels) = synthetic_object_views(2, 2, 3, 4, 0.1, 3);
        let (features, flat_labels) = flatten_views(&views, &labels);
        let mut source = InMemoryLabeled::new(features, flat_labels.clone(), 5).unwrap();
        assert_eq!(source.len(), 12);

        let mut seen = Vec::new();
        while let Some((feats, labels)) = source.next_batch() {
            assert_eq!(feats.nrows(), labels.len());
            seen.extend(labels);
        }
        assert_eq!(seen, flat_labels);

        source.reset();
        assert!(source.next_batch().is_some());
    }
}
