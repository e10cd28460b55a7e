//! k-NN retrieval accuracy of a query split against a reference split.
//!
//! The trainer only depends on this returning a scalar in `[0, 1]` that is
//! comparable across epochs. The implementation is a dense exact scan:
//! embeddings are L2-normalized by the bundled backbone, so dot products are
//! cosines, and reference sets here are small enough that an index would be
//! overhead.

use crate::data::LabeledSource;
use crate::model::FeatureExtractor;
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use std::collections::HashMap;

/// Embed every sample of a labeled source into a preallocated matrix.
///
/// The source's `len` is the preallocation hint; a source that under- or
/// over-delivers is a contract violation and is reported as such.
fn embed_split(
    model: &dyn FeatureExtractor,
    source: &mut dyn LabeledSource,
) -> Result<(Array2<f32>, Vec<usize>)> {
    let total = source.len();
    if total == 0 {
        return Err(Error::Domain("evaluation split must be non-empty"));
    }
    let mut embeddings = Array2::<f32>::zeros((total, model.embed_dim()));
    let mut labels = Vec::with_capacity(total);

    source.reset();
    let mut row = 0usize;
    while let Some((images, batch_labels)) = source.next_batch() {
        let batch = model.embed(&images.view());
        if row + batch.nrows() > total {
            return Err(Error::Shape("labeled source delivered more than len() samples"));
        }
        embeddings
            .slice_mut(ndarray::s![row..row + batch.nrows(), ..])
            .assign(&batch);
        labels.extend(batch_labels);
        row += batch.nrows();
    }
    if row != total {
        return Err(Error::Shape("labeled source delivered fewer than len() samples"));
    }
    Ok((embeddings, labels))
}

/// k-NN classification accuracy of `queries` against `reference`.
///
/// Each query votes among its `k` nearest reference embeddings (dot-product
/// similarity); the majority label wins, with summed similarity breaking
/// ties. `k` is clamped to the reference size.
pub fn retrieval_accuracy(
    model: &dyn FeatureExtractor,
    reference: &mut dyn LabeledSource,
    queries: &mut dyn LabeledSource,
    k: usize,
) -> Result<f32> {
    if k == 0 {
        return Err(Error::Domain("k must be >= 1"));
    }
    let (ref_embed, ref_labels) = embed_split(model, reference)?;
    let (query_embed, query_labels) = embed_split(model, queries)?;
    let k = k.min(ref_embed.nrows());

    let mut correct = 0usize;
    for (qi, query) in query_embed.rows().into_iter().enumerate() {
        let sims: Array1<f32> = ref_embed.dot(&query);

        // Indices of the k largest similarities.
        let mut order: Vec<usize> = (0..sims.len()).collect();
        order.sort_by(|&a, &b| {
            sims[b].partial_cmp(&sims[a]).unwrap_or(std::cmp::Ordering::Equal)
        });
        order.truncate(k);

        // (count, summed similarity) per label among the neighbors.
        let mut votes: HashMap<usize, (usize, f32)> = HashMap::new();
        for &idx in &order {
            let entry = votes.entry(ref_labels[idx]).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += sims[idx];
        }
        let predicted = votes
            .iter()
            .max_by(|a, b| {
                (a.1 .0, a.1 .1)
                    .partial_cmp(&(b.1 .0, b.1 .1))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(&label, _)| label);

        if predicted == Some(query_labels[qi]) {
            correct += 1;
        }
    }
    Ok(correct as f32 / query_labels.len() as f32)
}
