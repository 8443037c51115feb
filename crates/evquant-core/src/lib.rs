//! # evquant-core
//!
//! Event-camera classifier training with a learned event quantization layer.
//!
//! ## Modules
//!
//! - `events`: events, CSR batches and devices
//! - `dataset`: labelled event stores (N-Caltech101 `.npy` layout, in-memory)
//! - `loader`: shuffling, prefetching batch loader
//! - `encoder`: quantization layer (learned value function, voxel scatter)
//! - `head`: pooled classifier head
//! - `model`: the trainable classifier
//! - `loss`: cross-entropy loss and accuracy
//! - `optimizer`: Adam and the exponential learning-rate schedule
//! - `visualize`: robust percentile normalization into RGB grids
//! - `checkpoint`: binary checkpoint files
//! - `metrics`: scalar / image sinks
//! - `trainer`: epoch / checkpoint / resume state machine

// Foundations
pub mod error;
pub mod params;
pub mod precision;
pub mod tensor;

// Data
pub mod dataset;
pub mod events;
pub mod loader;

// Model
pub mod encoder;
pub mod head;
pub mod model;
pub mod nn;

// Training
pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod trainer;
pub mod visualize;

pub use config::{ModelConfig, TrainConfig};
pub use error::{Error, Result};
pub use events::{Device, Event, EventBatch, EventSample, Polarity};
pub use model::{EventClassifier, QuantizedClassifier};
pub use precision::PrecisionMode;
pub use trainer::{Trainer, TrainerOptions, TrainingReport};
