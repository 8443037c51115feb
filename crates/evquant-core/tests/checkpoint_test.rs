use std::sync::Arc;

use evquant_core::checkpoint::{Checkpoint, best_checkpoint_path};
use evquant_core::dataset::{EventStore, InMemoryStore};
use evquant_core::error::CheckpointError;
use evquant_core::loader::{Loader, LoaderOptions};
use evquant_core::metrics::JsonlSink;
use evquant_core::nn::{ParameterSet, StateDict};
use evquant_core::optimizer::Adam;
use evquant_core::trainer::{ControllerState, Loaders, Trainer, TrainerOptions};
use evquant_core::{Device, Event, EventSample, ModelConfig, Polarity, PrecisionMode, QuantizedClassifier};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn tiny_config() -> ModelConfig {
    ModelConfig {
        height: 4,
        width: 6,
        bins: 3,
        value_layer_widths: vec![1, 8, 1],
        pooled_grid: 2,
        head_hidden: 8,
        ..ModelConfig::default()
    }
}

fn model(seed: u64, num_classes: usize) -> QuantizedClassifier {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    QuantizedClassifier::new(&tiny_config(), num_classes, &mut rng)
}

fn bits(state: &StateDict) -> Vec<(String, Vec<usize>, Vec<u32>)> {
    state
        .iter()
        .map(|(k, t)| (k.clone(), t.shape.clone(), t.data.iter().map(|v| v.to_bits()).collect()))
        .collect()
}

/// Samples whose events cover the whole sensor
fn store(n: usize) -> Arc<dyn EventStore> {
    let samples = (0..n)
        .map(|s| {
            let events = (0..4u16)
                .flat_map(|y| (0..6u16).map(move |x| (x, y)))
                .enumerate()
                .map(|(i, (x, y))| {
                    let polarity = if (i + s) % 2 == 0 { Polarity::Positive } else { Polarity::Negative };
                    Event::new(x, y, 0.01 * (i + 3 * s) as f32, polarity)
                })
                .collect();
            EventSample::new(events, s % 2)
        })
        .collect();
    Arc::new(InMemoryStore::new(samples, vec!["even".into(), "odd".into()]))
}

fn loaders() -> Loaders {
    let options = LoaderOptions { batch_size: 2, num_workers: 0, pin_memory: true, shuffle: true, seed: 0 };
    Loaders {
        training: Loader::new(store(4), options, Device::default()),
        validation: Loader::new(store(2), options, Device::default()),
        testing: Loader::new(store(2), options, Device::default()),
    }
}

#[test]
fn model_parameters_survive_a_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = best_checkpoint_path(dir.path());
    let source = model(1, 2);
    Checkpoint { state_dict: source.state_dict(), iteration: 1234, min_val_loss: 0.6931 }.save(&path).unwrap();

    let loaded = Checkpoint::load(&path).unwrap();
    assert_eq!(loaded.iteration, 1234);
    assert_eq!(loaded.min_val_loss, 0.6931);

    let mut target = model(2, 2);
    assert_ne!(bits(&target.state_dict()), bits(&source.state_dict()));
    target.load_state_dict(&loaded.state_dict).unwrap();
    assert_eq!(bits(&target.state_dict()), bits(&source.state_dict()));
}

#[test]
fn mismatched_models_refuse_the_state_dict() {
    let source = model(1, 2);
    let mut other = model(3, 5);
    let before = bits(&other.state_dict());
    let err = other.load_state_dict(&source.state_dict()).unwrap_err();
    assert!(matches!(err, CheckpointError::StateDictMismatch(ref msg) if msg.contains("classifier.fc")));
    assert_eq!(bits(&other.state_dict()), before);
}

#[test]
fn training_resumes_from_a_periodic_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let options = TrainerOptions {
        num_epochs: 2,
        save_every_n_epochs: 1,
        log_dir: dir.path().to_path_buf(),
        precision: PrecisionMode::Full,
        continue_from: None,
        progress: false,
    };
    let mut trainer = Trainer::new(
        model(0, 2),
        Adam::new(1e-3, PrecisionMode::Full),
        loaders(),
        JsonlSink::create(dir.path()).unwrap(),
        options.clone(),
    );
    let first = trainer.run().unwrap();
    assert_eq!(first.state.iteration, 4);
    assert!(best_checkpoint_path(dir.path()).exists());

    let resume_from = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("checkpoint_00004_"))
        .unwrap();
    let saved = Checkpoint::load(&resume_from).unwrap();

    let mut resumed = Trainer::new(
        model(9, 2),
        Adam::new(1e-3, PrecisionMode::Full),
        loaders(),
        JsonlSink::create(dir.path()).unwrap(),
        TrainerOptions { num_epochs: 4, continue_from: Some(resume_from), ..options },
    );
    let mut state = resumed.advance().unwrap();
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(bits(&resumed.model().state_dict()), bits(&saved.state_dict));
    while state != ControllerState::Done {
        state = resumed.advance().unwrap();
    }
    assert_eq!(resumed.state().iteration, 8);
    assert!(resumed.state().min_validation_loss <= saved.min_val_loss);
}
