//! The training state machine.
//!
//! One epoch runs `TrainingPhase -> ValidationPhase -> Checkpointing ->
//! TestingPhase`; epochs before the resume point are never entered.

use super::state::{Phase, TrainingState, resume_start_epoch};
use crate::checkpoint::{Checkpoint, best_checkpoint_path, periodic_checkpoint_path};
use crate::config::{TrainConfig, positive};
use crate::error::{Error, Result};
use crate::events::EventBatch;
use crate::loader::Loader;
use crate::loss::{cross_entropy_grad, cross_entropy_loss_and_accuracy};
use crate::metrics::MetricsSink;
use crate::model::EventClassifier;
use crate::optimizer::{ExponentialDecay, Optimizer};
use crate::precision::PrecisionMode;
use crate::tensor::Representation;
use crate::visualize::create_image;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};

/// Loss, accuracy and representation of one non-empty batch
#[derive(Clone, Debug)]
pub struct BatchOutcome {
    pub loss: f64,
    pub accuracy: f64,
    pub representation: Representation,
}

/// Run one batch through the model.
///
/// A batch without events is skipped and yields `None`. With an optimizer
/// the gradients are reset, back-propagated and applied; without one the
/// parameters are left untouched.
pub fn process_batch<M: EventClassifier>(
    model: &mut M,
    optimizer: Option<&mut dyn Optimizer>,
    batch: &EventBatch,
    precision: PrecisionMode,
) -> Result<Option<BatchOutcome>> {
    if batch.is_empty() {
        return Ok(None);
    }
    let labels = batch.labels();
    let outcome = match optimizer {
        Some(optimizer) => {
            model.zero_grad();
            let output = model.forward(batch, precision)?;
            let metrics = cross_entropy_loss_and_accuracy(&output.logits, labels)?;
            let grad = cross_entropy_grad(&output.logits, labels)?;
            model.backward(batch, &output, &grad, precision)?;
            optimizer.step(model);
            BatchOutcome { loss: metrics.loss, accuracy: metrics.accuracy, representation: output.representation }
        }
        None => {
            let output = model.forward(batch, precision)?;
            let metrics = cross_entropy_loss_and_accuracy(&output.logits, labels)?;
            BatchOutcome { loss: metrics.loss, accuracy: metrics.accuracy, representation: output.representation }
        }
    };
    Ok(Some(outcome))
}

/// Mean loss and accuracy of one phase
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseSummary {
    pub phase: Phase,
    /// Sum over processed batches divided by the loader length; NaN when no
    /// batch was processed
    pub loss: f64,
    pub accuracy: f64,
    /// Batches in the pass, empty ones included
    pub batches: usize,
    /// Non-empty batches actually evaluated
    pub processed: usize,
}

/// Running sums of one phase
#[derive(Debug, Default)]
pub struct PhaseAccumulator {
    loss_sum: f64,
    accuracy_sum: f64,
    processed: usize,
    last_representation: Option<Representation>,
}

impl PhaseAccumulator {
    pub fn add(&mut self, outcome: BatchOutcome) {
        self.loss_sum += outcome.loss;
        self.accuracy_sum += outcome.accuracy;
        self.processed += 1;
        self.last_representation = Some(outcome.representation);
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Mean over the batches seen so far, for progress display
    pub fn running_loss(&self) -> f64 {
        if self.processed == 0 { f64::NAN } else { self.loss_sum / self.processed as f64 }
    }

    /// Divide by `batches` and hand back the last representation
    pub fn finish(self, phase: Phase, batches: usize) -> (PhaseSummary, Option<Representation>) {
        let (loss, accuracy) = if self.processed == 0 {
            (f64::NAN, f64::NAN)
        } else {
            (self.loss_sum / batches as f64, self.accuracy_sum / batches as f64)
        };
        let summary = PhaseSummary { phase, loss, accuracy, batches, processed: self.processed };
        (summary, self.last_representation)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Iteration counter after the training phase
    pub iteration: u64,
    pub training: PhaseSummary,
    pub validation: PhaseSummary,
    pub testing: PhaseSummary,
    /// Validation loss improved and `model_best` was rewritten
    pub new_best: bool,
    /// Files written during checkpointing, in write order
    pub checkpoints: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingReport {
    pub start_epoch: usize,
    pub state: TrainingState,
    pub epochs: Vec<EpochSummary>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControllerState {
    Initializing,
    TrainingPhase { epoch: usize },
    ValidationPhase { epoch: usize },
    Checkpointing { epoch: usize, validation_loss: f64 },
    TestingPhase { epoch: usize },
    Done,
}

pub struct Loaders {
    pub training: Loader,
    pub validation: Loader,
    pub testing: Loader,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainerOptions {
    pub num_epochs: usize,
    pub save_every_n_epochs: usize,
    pub log_dir: PathBuf,
    pub precision: PrecisionMode,
    pub continue_from: Option<PathBuf>,
    /// Draw progress bars on stderr
    pub progress: bool,
}

impl TrainerOptions {
    pub fn from_config(config: &TrainConfig) -> Self {
        Self {
            num_epochs: config.num_epochs,
            save_every_n_epochs: config.save_every_n_epochs.max(1),
            log_dir: config.log_dir.clone(),
            precision: config.precision(),
            continue_from: config.continue_from.clone(),
            progress: true,
        }
    }
}

/// Phase results collected while an epoch is in flight
#[derive(Default)]
struct EpochProgress {
    iteration: u64,
    training: Option<PhaseSummary>,
    validation: Option<PhaseSummary>,
    new_best: bool,
    checkpoints: Vec<PathBuf>,
}

pub struct Trainer<M, O, S> {
    model: M,
    optimizer: O,
    scheduler: ExponentialDecay,
    loaders: Loaders,
    sink: S,
    options: TrainerOptions,
    state: TrainingState,
    controller: ControllerState,
    start_epoch: usize,
    progress: EpochProgress,
    epochs: Vec<EpochSummary>,
}

impl<M: EventClassifier, O: Optimizer, S: MetricsSink> Trainer<M, O, S> {
    pub fn new(model: M, optimizer: O, loaders: Loaders, sink: S, options: TrainerOptions) -> Self {
        Self {
            model,
            optimizer,
            scheduler: ExponentialDecay::default(),
            loaders,
            sink,
            options,
            state: TrainingState::new(),
            controller: ControllerState::Initializing,
            start_epoch: 0,
            progress: EpochProgress::default(),
            epochs: Vec::new(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: ExponentialDecay) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn controller_state(&self) -> ControllerState {
        self.controller
    }

    /// First epoch that is actually run (valid after initialization)
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Drive the state machine to `Done`
    pub fn run(&mut self) -> Result<TrainingReport> {
        while self.advance()? != ControllerState::Done {}
        Ok(TrainingReport { start_epoch: self.start_epoch, state: self.state, epochs: self.epochs.clone() })
    }

    /// Execute the current state and move to the next one
    pub fn advance(&mut self) -> Result<ControllerState> {
        let next = match self.controller {
            ControllerState::Initializing => {
                self.initialize()?;
                self.epoch_entry(self.start_epoch)
            }
            ControllerState::TrainingPhase { epoch } => {
                self.progress = EpochProgress::default();
                let summary = self.run_phase(Phase::Training, epoch)?;
                self.progress.iteration = self.state.iteration;
                self.progress.training = Some(summary);
                if self.scheduler.decays_after(epoch) {
                    self.scheduler.step(&mut self.optimizer);
                    log::info!("Learning rate decayed to {:e}", self.optimizer.get_lr());
                }
                ControllerState::ValidationPhase { epoch }
            }
            ControllerState::ValidationPhase { epoch } => {
                let summary = self.run_phase(Phase::Validation, epoch)?;
                self.progress.validation = Some(summary);
                ControllerState::Checkpointing { epoch, validation_loss: summary.loss }
            }
            ControllerState::Checkpointing { epoch, validation_loss } => {
                self.checkpoint(epoch, validation_loss)?;
                ControllerState::TestingPhase { epoch }
            }
            ControllerState::TestingPhase { epoch } => {
                let testing = self.run_phase(Phase::Testing, epoch)?;
                self.sink.flush()?;
                let progress = std::mem::take(&mut self.progress);
                if let (Some(training), Some(validation)) = (progress.training, progress.validation) {
                    self.epochs.push(EpochSummary {
                        epoch,
                        iteration: progress.iteration,
                        training,
                        validation,
                        testing,
                        new_best: progress.new_best,
                        checkpoints: progress.checkpoints,
                    });
                }
                self.epoch_entry(epoch + 1)
            }
            ControllerState::Done => ControllerState::Done,
        };
        self.controller = next;
        Ok(next)
    }

    fn epoch_entry(&self, epoch: usize) -> ControllerState {
        if epoch < self.options.num_epochs {
            ControllerState::TrainingPhase { epoch }
        } else {
            ControllerState::Done
        }
    }

    fn initialize(&mut self) -> Result<()> {
        positive("save_every_n_epochs", self.options.save_every_n_epochs)?;
        if self.loaders.training.is_empty() {
            return Err(Error::EmptyTrainingSet);
        }

        if let Some(path) = &self.options.continue_from {
            let checkpoint = Checkpoint::load(path)?;
            self.model.load_state_dict(&checkpoint.state_dict)?;
            self.state = TrainingState::from_checkpoint(&checkpoint);
            self.start_epoch = resume_start_epoch(self.state.iteration, self.loaders.training.len());
            log::info!(
                "Resuming from {} at iteration {} (min validation loss {:.4}), starting at epoch {}",
                path.display(),
                self.state.iteration,
                self.state.min_validation_loss,
                self.start_epoch
            );
        }

        self.model.cast_parameters(self.options.precision);

        log::info!(
            "Training {} epochs, {} batches per epoch, {} parameters, lr {:e}, {:?} precision",
            self.options.num_epochs,
            self.loaders.training.len(),
            self.model.parameter_count(),
            self.optimizer.get_lr(),
            self.options.precision
        );
        self.sink.add_record(&serde_json::json!({
            "kind": "run",
            "ts": chrono::Utc::now().to_rfc3339(),
            "num_epochs": self.options.num_epochs,
            "save_every_n_epochs": self.options.save_every_n_epochs,
            "start_epoch": self.start_epoch,
            "iteration": self.state.iteration,
            "min_validation_loss": finite_or_null(self.state.min_validation_loss),
            "lr": self.optimizer.get_lr(),
            "precision": self.options.precision,
            "parameters": self.model.parameter_count(),
            "num_classes": self.model.num_classes(),
            "batches": {
                "training": self.loaders.training.len(),
                "validation": self.loaders.validation.len(),
                "testing": self.loaders.testing.len(),
            },
            "log_dir": self.options.log_dir.display().to_string(),
        }))?;
        Ok(())
    }

    fn run_phase(&mut self, phase: Phase, epoch: usize) -> Result<PhaseSummary> {
        let Self { model, optimizer, loaders, sink, options, state, .. } = self;
        let loader = match phase {
            Phase::Training => &mut loaders.training,
            Phase::Validation => &mut loaders.validation,
            Phase::Testing => &mut loaders.testing,
        };
        let batches = loader.len();
        log::info!("{} step [{epoch:3}/{:3}]", phase.title(), options.num_epochs);
        let bar = progress_bar(batches, options.progress);

        let mut accumulator = PhaseAccumulator::default();
        for batch in loader.iter() {
            let batch = batch?;
            let optimizer: Option<&mut dyn Optimizer> =
                if phase.updates_parameters() { Some(&mut *optimizer as &mut dyn Optimizer) } else { None };
            match process_batch(model, optimizer, &batch, options.precision)? {
                Some(outcome) => {
                    if phase.updates_parameters() {
                        state.iteration += 1;
                    }
                    accumulator.add(outcome);
                    bar.set_message(format!("{:.4}", accumulator.running_loss()));
                }
                None => log::debug!("{phase}: skipping batch without events"),
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        let (summary, representation) = accumulator.finish(phase, batches);
        let tag = phase.tag();
        match phase {
            Phase::Training => log::info!(
                "Training Iteration {:5}  Loss {:.4}  Accuracy {:.4}",
                state.iteration,
                summary.loss,
                summary.accuracy
            ),
            _ => log::info!("{} Loss {:.4}  Accuracy {:.4}", phase.title(), summary.loss, summary.accuracy),
        }
        sink.add_scalar(&format!("{tag}/accuracy"), summary.accuracy, state.iteration)?;
        sink.add_scalar(&format!("{tag}/loss"), summary.loss, state.iteration)?;
        match representation {
            Some(representation) => {
                let image = create_image(&representation)?;
                sink.add_image(&format!("{tag}/representation"), &image, state.iteration)?;
            }
            None => log::warn!("{phase}: no batch with events, skipping representation image"),
        }
        Ok(summary)
    }

    fn checkpoint(&mut self, epoch: usize, validation_loss: f64) -> Result<()> {
        if self.state.observe_validation(validation_loss) {
            let path = best_checkpoint_path(&self.options.log_dir);
            self.save_checkpoint(&path)?;
            self.progress.new_best = true;
            self.progress.checkpoints.push(path);
            log::info!("New best at {validation_loss:.4}");
        }
        if epoch % self.options.save_every_n_epochs == 0 {
            let path =
                periodic_checkpoint_path(&self.options.log_dir, self.state.iteration, self.state.min_validation_loss);
            self.save_checkpoint(&path)?;
            log::info!("Saved {}", path.display());
            self.progress.checkpoints.push(path);
        }
        Ok(())
    }

    fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint {
            state_dict: self.model.state_dict(),
            iteration: self.state.iteration,
            min_val_loss: self.state.min_validation_loss,
        };
        checkpoint.save(path)?;
        Ok(())
    }
}

fn finite_or_null(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss:{msg}")
    {
        bar.set_style(style);
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventSample, Polarity};
    use crate::nn::{Parameter, ParameterSet};
    use crate::optimizer::Adam;

    /// Linear model over the event count of each sample
    struct Counter {
        w: Parameter,
    }

    impl ParameterSet for Counter {
        fn for_each_parameter(&self, f: &mut dyn FnMut(&str, &Parameter)) {
            f("w", &self.w);
        }

        fn for_each_parameter_mut(&mut self, f: &mut dyn FnMut(&str, &mut Parameter)) {
            f("w", &mut self.w);
        }
    }

    impl EventClassifier for Counter {
        type Cache = ();

        fn num_classes(&self) -> usize {
            2
        }

        fn forward(&self, batch: &EventBatch, _: PrecisionMode) -> Result<crate::model::ForwardOutput<()>> {
            let rows: Vec<Vec<f32>> =
                batch.streams().map(|s| vec![0.0, self.w.values[0] * s.len() as f32]).collect();
            let data = batch.streams().flat_map(|s| [s.len() as f32, 1.0, 0.0]).collect();
            Ok(crate::model::ForwardOutput {
                logits: crate::tensor::Logits::from_rows(&rows),
                representation: Representation::from_vec([batch.num_samples(), 3, 1, 1], data).unwrap(),
                cache: (),
            })
        }

        fn backward(
            &mut self,
            batch: &EventBatch,
            _: &crate::model::ForwardOutput<()>,
            grad: &crate::tensor::Logits,
            _: PrecisionMode,
        ) -> Result<()> {
            for (row, stream) in grad.rows().zip(batch.streams()) {
                self.w.grads[0] += row[1] * stream.len() as f32;
            }
            Ok(())
        }
    }

    fn batch(counts: &[usize]) -> EventBatch {
        let samples = counts
            .iter()
            .map(|&n| EventSample::new(vec![Event::new(0, 0, 0.0, Polarity::Positive); n], 1))
            .collect();
        EventBatch::collate(samples)
    }

    #[test]
    fn empty_batches_are_skipped_without_touching_parameters() {
        let mut model = Counter { w: Parameter::zeros(&[1]) };
        let mut adam = Adam::new(0.1, PrecisionMode::Full);
        let empty = batch(&[0, 0]);
        assert!(process_batch(&mut model, Some(&mut adam), &empty, PrecisionMode::Full).unwrap().is_none());
        assert_eq!(adam.steps(), 0);
        assert_eq!(model.w.values[0], 0.0);
    }

    #[test]
    fn training_batches_step_the_optimizer() {
        let mut model = Counter { w: Parameter::zeros(&[1]) };
        let mut adam = Adam::new(0.1, PrecisionMode::Full);
        let b = batch(&[2, 3]);
        let outcome = process_batch(&mut model, Some(&mut adam), &b, PrecisionMode::Full).unwrap().unwrap();
        assert!((outcome.loss - 2f64.ln()).abs() < 1e-9);
        assert_eq!(adam.steps(), 1);
        assert!(model.w.values[0] > 0.0);

        let before = model.w.values[0];
        process_batch(&mut model, None, &b, PrecisionMode::Full).unwrap().unwrap();
        assert_eq!(model.w.values[0], before);
    }

    #[test]
    fn accumulator_divides_by_loader_length() {
        let mut acc = PhaseAccumulator::default();
        let rep = Representation::zeros(1, 3, 1, 1);
        acc.add(BatchOutcome { loss: 1.0, accuracy: 1.0, representation: rep.clone() });
        acc.add(BatchOutcome { loss: 2.0, accuracy: 0.0, representation: rep });
        assert_eq!(acc.running_loss(), 1.5);
        let (summary, last) = acc.finish(Phase::Validation, 3);
        assert_eq!(summary.loss, 1.0);
        assert!((summary.accuracy - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!((summary.batches, summary.processed), (3, 2));
        assert!(last.is_some());

        let (summary, last) = PhaseAccumulator::default().finish(Phase::Testing, 4);
        assert!(summary.loss.is_nan());
        assert!(last.is_none());
    }
}
