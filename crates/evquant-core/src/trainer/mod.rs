//! Epoch / checkpoint / resume controller.

mod controller;
mod state;

pub use controller::{
    BatchOutcome, ControllerState, EpochSummary, Loaders, PhaseAccumulator, PhaseSummary, Trainer, TrainerOptions,
    TrainingReport, process_batch,
};
pub use state::{Phase, TrainingState, resume_start_epoch};
