use std::sync::Arc;

use evquant_core::checkpoint::{Checkpoint, best_checkpoint_path};
use evquant_core::dataset::{EventStore, InMemoryStore};
use evquant_core::loader::{Loader, LoaderOptions};
use evquant_core::metrics::RecordingSink;
use evquant_core::nn::ParameterSet;
use evquant_core::optimizer::Adam;
use evquant_core::precision::round_to_half;
use evquant_core::trainer::{Loaders, Trainer, TrainerOptions};
use evquant_core::{Device, Event, EventSample, ModelConfig, Polarity, PrecisionMode, QuantizedClassifier};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn tiny_model() -> QuantizedClassifier {
    let config = ModelConfig {
        height: 4,
        width: 6,
        bins: 3,
        value_layer_widths: vec![1, 8, 1],
        pooled_grid: 2,
        head_hidden: 8,
        ..ModelConfig::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    QuantizedClassifier::new(&config, 2, &mut rng)
}

fn store(n: usize) -> Arc<dyn EventStore> {
    let samples = (0..n)
        .map(|s| {
            let events = (0..4u16)
                .flat_map(|y| (0..6u16).map(move |x| (x, y)))
                .enumerate()
                .map(|(i, (x, y))| {
                    let polarity = if (i + s) % 3 == 0 { Polarity::Negative } else { Polarity::Positive };
                    Event::new(x, y, 0.02 * (i + s) as f32, polarity)
                })
                .collect();
            EventSample::new(events, s % 2)
        })
        .collect();
    Arc::new(InMemoryStore::new(samples, vec!["even".into(), "odd".into()]))
}

fn loader(n: usize) -> Loader {
    let options = LoaderOptions { batch_size: 2, num_workers: 0, pin_memory: false, shuffle: true, seed: 3 };
    Loader::new(store(n), options, Device::default())
}

fn assert_on_half_grid(model: &QuantizedClassifier) {
    for (name, tensor) in model.state_dict() {
        for &v in &tensor.data {
            assert!(v.is_finite(), "{name}: {v}");
            assert_eq!(v.to_bits(), round_to_half(v).to_bits(), "{name}: {v} is not a binary16 value");
        }
    }
}

#[test]
fn half_precision_epoch_keeps_parameters_on_the_binary16_grid() {
    let dir = tempfile::tempdir().unwrap();
    let options = TrainerOptions {
        num_epochs: 1,
        save_every_n_epochs: 1,
        log_dir: dir.path().to_path_buf(),
        precision: PrecisionMode::Half,
        continue_from: None,
        progress: false,
    };
    let mut trainer = Trainer::new(
        tiny_model(),
        Adam::new(1e-3, PrecisionMode::Half),
        Loaders { training: loader(4), validation: loader(2), testing: loader(2) },
        RecordingSink::default(),
        options,
    );
    let report = trainer.run().unwrap();

    assert_eq!(report.state.iteration, 2);
    let epoch = &report.epochs[0];
    for summary in [epoch.training, epoch.validation, epoch.testing] {
        assert!(summary.loss.is_finite(), "{:?} loss {}", summary.phase, summary.loss);
        assert!((0.0..=1.0).contains(&summary.accuracy));
    }
    assert!(epoch.new_best);
    assert_on_half_grid(trainer.model());

    let best = Checkpoint::load(&best_checkpoint_path(dir.path())).unwrap();
    assert_eq!(best.state_dict, trainer.model().state_dict());
}
