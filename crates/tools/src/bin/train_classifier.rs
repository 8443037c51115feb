//! イベントカメラ分類器の学習。
//!
//! N-Caltech101 形式（クラスごとのディレクトリに `.npy` イベント列）の
//! 学習・検証・テストセットから、学習可能な量子化層付き分類器を学習する。
//!
//! # 使用例
//!
//! ```shell
//! cargo run -p evquant-tools --release --bin train_classifier -- \
//!   --training_dataset data/N-Caltech101/training \
//!   --validation_dataset data/N-Caltech101/validation \
//!   --testing_dataset data/N-Caltech101/testing \
//!   --log_dir runs/$(date +%Y%m%d_%H%M%S) \
//!   --batch_size 4 --num_epochs 30
//! ```
//!
//! 再開するときは `--continue_from runs/.../checkpoint_00237_0.6123.ckpt` を渡す。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use evquant_core::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_DEVICE, DEFAULT_LR, DEFAULT_NUM_EPOCHS, DEFAULT_NUM_WORKERS,
    DEFAULT_SAVE_EVERY_N_EPOCHS,
};
use evquant_core::dataset::{EventStore, NCaltech101};
use evquant_core::loader::{Loader, LoaderOptions};
use evquant_core::metrics::{JsonlSink, MetricsSink};
use evquant_core::optimizer::Adam;
use evquant_core::params::GLOBAL_SEED;
use evquant_core::trainer::{Loaders, Trainer, TrainerOptions};
use evquant_core::{ModelConfig, QuantizedClassifier, TrainConfig};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(about = "Train classifier using a learnt quantization layer.")]
struct Cli {
    /// Validation dataset directory (one sub-directory per class)
    #[arg(long = "validation_dataset", alias = "validation-dataset")]
    validation_dataset: PathBuf,

    /// Training dataset directory; its classes define the label set
    #[arg(long = "training_dataset", alias = "training-dataset")]
    training_dataset: PathBuf,

    /// Testing dataset directory
    #[arg(long = "testing_dataset", alias = "testing-dataset")]
    testing_dataset: PathBuf,

    /// Output directory for checkpoints and metrics (created if absent)
    #[arg(long = "log_dir", alias = "log-dir")]
    log_dir: PathBuf,

    /// Compute device: cpu or cpu:N
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Prefetch worker threads per loader (0 loads on the training thread)
    #[arg(long = "num_workers", alias = "num-workers", default_value_t = DEFAULT_NUM_WORKERS)]
    num_workers: usize,

    #[arg(long = "pin_memory", alias = "pin-memory", default_value_t = true, action = ArgAction::Set)]
    pin_memory: bool,

    #[arg(long = "batch_size", alias = "batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Initial learning rate (halved every 10 epochs)
    #[arg(long, default_value_t = DEFAULT_LR)]
    lr: f32,

    #[arg(long = "num_epochs", alias = "num-epochs", default_value_t = DEFAULT_NUM_EPOCHS)]
    num_epochs: usize,

    #[arg(long = "save_every_n_epochs", alias = "save-every-n-epochs", default_value_t = DEFAULT_SAVE_EVERY_N_EPOCHS)]
    save_every_n_epochs: usize,

    /// Checkpoint to resume from
    #[arg(long = "continue_from", alias = "continue-from")]
    continue_from: Option<PathBuf>,

    /// Train with half-precision parameters and activations
    #[arg(long = "use_hp", alias = "use-hp")]
    use_hp: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> TrainConfig {
        TrainConfig {
            validation_dataset: self.validation_dataset,
            training_dataset: self.training_dataset,
            testing_dataset: self.testing_dataset,
            log_dir: self.log_dir,
            device: self.device,
            num_workers: self.num_workers,
            pin_memory: self.pin_memory,
            batch_size: self.batch_size,
            lr: self.lr,
            num_epochs: self.num_epochs,
            save_every_n_epochs: self.save_every_n_epochs,
            continue_from: self.continue_from,
            use_hp: self.use_hp,
        }
    }
}

fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .format(|buf, record| writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args()))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    if let Err(err) = run(cli) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config().validate()?;
    log::info!("Starting training with\n{}", config.banner());

    let model_config = ModelConfig::default();
    model_config.validate()?;
    let device = config.device()?;

    let training = NCaltech101::new(&config.training_dataset)
        .with_context(|| format!("failed to index {}", config.training_dataset.display()))?;
    let classes = training.classes().to_vec();
    let validation = NCaltech101::with_classes(&config.validation_dataset, &classes)
        .with_context(|| format!("failed to index {}", config.validation_dataset.display()))?;
    let testing = NCaltech101::with_classes(&config.testing_dataset, &classes)
        .with_context(|| format!("failed to index {}", config.testing_dataset.display()))?;
    log::info!(
        "{} classes; {} training, {} validation, {} testing samples",
        classes.len(),
        training.len(),
        validation.len(),
        testing.len()
    );

    let mut rng = ChaCha8Rng::seed_from_u64(GLOBAL_SEED);
    let mut model = QuantizedClassifier::new(&model_config, classes.len(), &mut rng);
    if config.continue_from.is_none() {
        model.init_kernel(&model_config, &mut rng);
    }
    let optimizer = Adam::new(config.lr, config.precision());

    let loaders = Loaders {
        training: Loader::new(Arc::new(training), LoaderOptions::from_config(&config, GLOBAL_SEED), device),
        validation: Loader::new(Arc::new(validation), LoaderOptions::from_config(&config, GLOBAL_SEED + 1), device),
        testing: Loader::new(Arc::new(testing), LoaderOptions::from_config(&config, GLOBAL_SEED + 2), device),
    };

    let mut sink = JsonlSink::create(&config.log_dir)
        .with_context(|| format!("failed to open metrics in {}", config.log_dir.display()))?;
    sink.add_record(&serde_json::json!({
        "kind": "config",
        "config": &config,
        "model": &model_config,
        "classes": &classes,
    }))?;

    let mut trainer = Trainer::new(model, optimizer, loaders, sink, TrainerOptions::from_config(&config));
    let report = trainer.run()?;

    log::info!(
        "Finished {} epochs at iteration {}; best validation loss {:.4}",
        report.epochs.len(),
        report.state.iteration,
        report.state.min_validation_loss
    );
    Ok(())
}
