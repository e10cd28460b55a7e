use ndarray::s;
use vispe::checkpoint::CheckpointStore;
use vispe::data::{flatten_views, synthetic_object_views, Batch, InMemoryLabeled, InMemoryViews};
use vispe::loss::VispeLoss;
use vispe::model::{FeatureExtractor, LinearBackbone};
use vispe::train::{DataBundle, TrainConfig, Trainer};

const INPUT_DIM: usize = 16;
const EMBED_DIM: usize = 8;
const VIEWS: usize = 6;
const TRAIN_VIEWS: usize = 4;

/// Fresh synthetic bundle: 3 seen classes and 2 unseen classes, 3 objects
/// each, with the views split into a train part and a held-out test part.
fn bundle(seed: u64, batch_size: usize) -> (DataBundle, ndarray::Array3<f32>) {
    let (seen, seen_labels) = synthetic_object_views(3, 3, VIEWS, INPUT_DIM, 0.05, seed);
    let (unseen, unseen_labels) =
        synthetic_object_views(2, 3, VIEWS, INPUT_DIM, 0.05, seed.wrapping_add(31));

    let seen_train = seen.slice(s![.., ..TRAIN_VIEWS, ..]).to_owned();
    let seen_test = seen.slice(s![.., TRAIN_VIEWS.., ..]).to_owned();
    let unseen_train = unseen.slice(s![.., ..TRAIN_VIEWS, ..]).to_owned();
    let unseen_test = unseen.slice(s![.., TRAIN_VIEWS.., ..]).to_owned();

    let (str_rows, str_labels) = flatten_views(&seen_train, &seen_labels);
    let (ste_rows, ste_labels) = flatten_views(&seen_test, &seen_labels);
    let (utr_rows, utr_labels) = flatten_views(&unseen_train, &unseen_labels);
    let (ute_rows, ute_labels) = flatten_views(&unseen_test, &unseen_labels);

    let data = DataBundle {
        train: Box::new(
            InMemoryViews::new(seen_train.clone(), batch_size, seed.wrapping_add(7)).unwrap(),
        ),
        seen_train_knn: Box::new(InMemoryLabeled::new(str_rows, str_labels, batch_size).unwrap()),
        seen_test_knn: Box::new(InMemoryLabeled::new(ste_rows, ste_labels, batch_size).unwrap()),
        unseen_train_knn: Box::new(
            InMemoryLabeled::new(utr_rows, utr_labels, batch_size).unwrap(),
        ),
        unseen_test_knn: Box::new(
            InMemoryLabeled::new(ute_rows, ute_labels, batch_size).unwrap(),
        ),
    };
    (data, seen_train)
}

fn config(model_dir: &std::path::Path, epochs: usize) -> (TrainConfig, CheckpointStore) {
    let config = TrainConfig {
        epochs,
        batch_size: 8,
        lr: 0.02,
        momentum: 0.9,
        weight_decay: 1e-4,
        temperature: 0.1,
        alpha: 1.0,
        gamma: 0.1,
        knn_k: 3,
        ..TrainConfig::default()
    };
    (config, CheckpointStore::new(model_dir))
}

/// A fixed probe batch (one view pair per object, ids unique) for measuring
/// the objective outside the training stream.
fn probe_batch(train_views: &ndarray::Array3<f32>) -> Batch {
    let objects = train_views.dim().0;
    Batch {
        primary: train_views.slice(s![.., 0, ..]).to_owned(),
        secondary: train_views.slice(s![.., 1, ..]).to_owned(),
        object_ids: (0..objects).map(|o| format!("obj-{o}")).collect(),
    }
}

#[test]
fn training_reduces_the_objective_and_retrieval_stays_strong() {
    let dir = tempfile::tempdir().unwrap();
    let (data, train_views) = bundle(11, 8);
    let (config, store) = config(&dir.path().join("model"), 8);

    let loss = VispeLoss::new(config.temperature, config.alpha).unwrap();
    let model = LinearBackbone::new(INPUT_DIM, EMBED_DIM, 2).unwrap();

    let probe = probe_batch(&train_views);
    let before = loss
        .terms(
            &model.embed(&probe.primary.view()).view(),
            &model.embed(&probe.secondary.view()).view(),
        )
        .unwrap()
        .total;

    let mut trainer = Trainer::new(model, data, store, config).unwrap();
    let report = trainer.run().unwrap();

    // run() leaves the best (trained) model in place.
    let after = loss
        .terms(
            &trainer.model().embed(&probe.primary.view()).view(),
            &trainer.model().embed(&probe.secondary.view()).view(),
        )
        .unwrap()
        .total;

    assert!(before.is_finite() && after.is_finite());
    assert!(
        after < before,
        "objective did not improve: before {before} after {after}"
    );

    assert_eq!(report.epochs.len(), 8);
    for epoch_report in &report.epochs {
        assert!(epoch_report.mean_loss.is_finite());
        assert!((0.0..=1.0).contains(&epoch_report.seen_acc));
        assert!((0.0..=1.0).contains(&epoch_report.unseen_acc));
    }
    // Classes are cleanly separated; retrieval on the seen split should be
    // nearly perfect with or without training, and must stay so after it.
    assert!(
        report.final_seen_acc >= 0.8,
        "seen accuracy {}",
        report.final_seen_acc
    );
}

#[test]
fn per_epoch_loss_trend_is_downward_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (data, _) = bundle(23, 8);
    let (config, store) = config(&dir.path().join("model"), 8);

    let model = LinearBackbone::new(INPUT_DIM, EMBED_DIM, 4).unwrap();
    let mut trainer = Trainer::new(model, data, store, config).unwrap();
    let report = trainer.run().unwrap();

    let first = report.epochs.first().unwrap().mean_loss;
    let last = report.epochs.last().unwrap().mean_loss;
    assert!(
        last < first,
        "mean epoch loss did not trend down: first {first} last {last}"
    );
}
