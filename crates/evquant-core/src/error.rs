//! Error types for the training pipeline
//!
//! Each concern owns a typed error; [`Error`] unifies them for the controller.

use std::path::PathBuf;

/// Configuration validation errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// A dataset directory does not exist
    #[error("{split} dataset directory {} not found.", path.display())]
    MissingDataset { split: &'static str, path: PathBuf },

    /// The parent of the log directory does not exist
    #[error("Log directory root {} not found.", path.display())]
    MissingLogRoot { path: PathBuf },

    /// The checkpoint to resume from does not exist
    #[error("Checkpoint {} not found.", path.display())]
    MissingCheckpoint { path: PathBuf },

    /// Device identifier is not supported by this build
    #[error("Unsupported device '{0}' (expected 'cpu' or 'cpu:N')")]
    UnsupportedDevice(String),

    /// A numeric option is out of range
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Model shape parameters are inconsistent
    #[error("Invalid model configuration: {0}")]
    InvalidModel(String),

    /// Creating the log directory failed
    #[error("Failed to create log directory {}: {source}", path.display())]
    CreateLogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Event store errors
#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    /// File I/O error with the offending path
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A requested class directory is absent from the dataset root
    #[error("Class '{class}' not found under {}", root.display())]
    MissingClass { class: String, root: PathBuf },

    /// An event file is not a readable (N, 4) array
    #[error("Invalid event file {}: {reason}", path.display())]
    InvalidEventFile { path: PathBuf, reason: String },

    /// Sample index outside the store
    #[error("Sample index {index} out of range for store of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Quantization layer errors
#[derive(thiserror::Error, Debug)]
pub enum EncoderError {
    /// Event coordinate outside the sensor grid
    #[error("Event ({x}, {y}) in sample {sample} lies outside the {width}x{height} sensor")]
    EventOutOfBounds { sample: usize, x: u16, y: u16, width: usize, height: usize },

    /// Gradient tensor does not match the representation shape
    #[error("Gradient shape mismatch: expected {expected:?}, got {actual:?}")]
    GradientShape { expected: [usize; 4], actual: [usize; 4] },
}

/// Loss evaluation errors
#[derive(thiserror::Error, Debug)]
pub enum EvaluationError {
    /// Label is not a valid class index
    #[error("Label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },

    /// Logits and labels disagree on batch size
    #[error("Batch size mismatch: {logits} logit rows, {labels} labels")]
    BatchMismatch { logits: usize, labels: usize },
}

/// Checkpoint persistence errors
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Atomic rename of the temporary file failed
    #[error(transparent)]
    Persist(#[from] tempfile::PersistError),

    /// File does not start with the checkpoint magic
    #[error("Invalid checkpoint magic: {0:?}")]
    BadMagic([u8; 4]),

    /// Unknown format version
    #[error("Unsupported checkpoint version: {0}")]
    UnsupportedVersion(u32),

    /// Corrupt entry inside the parameter table
    #[error("Corrupt checkpoint entry: {0}")]
    Corrupt(String),

    /// Stored parameters do not fit the model
    #[error("State dict mismatch: {0}")]
    StateDictMismatch(String),
}

/// Visualization normalization errors
#[derive(thiserror::Error, Debug)]
pub enum NormalizeError {
    /// Channel count cannot be grouped into three display channels
    #[error("Representation has {0} channels, which is not a multiple of 3")]
    ChannelsNotMultipleOfThree(usize),

    /// Robust maximum equals robust minimum so the range is empty
    #[error("Degenerate value range in sample {sample}: 1st and 99th percentile are both {value}")]
    DegenerateRange { sample: usize, value: f32 },

    /// Representation holds no samples or no pixels
    #[error("Representation is empty")]
    EmptyRepresentation,
}

/// Metrics sink errors
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Image encoding error
    #[error("Image encoding failed: {0}")]
    Image(String),
}

/// Top-level error for the training pipeline
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A prefetch worker disconnected before delivering its batch
    #[error("Loader worker for batch {batch} terminated unexpectedly")]
    LoaderDisconnected { batch: usize },

    /// The training split yields no batches
    #[error("Training dataset is empty")]
    EmptyTrainingSet,
}

/// Result type for training operations
pub type Result<T> = std::result::Result<T, Error>;
