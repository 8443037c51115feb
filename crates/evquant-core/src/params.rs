//! Fixed hyper-parameters of the event classifier and its training loop.

// Sensor geometry (N-Caltech101)
pub const SENSOR_HEIGHT: usize = 180;
pub const SENSOR_WIDTH: usize = 240;

// Quantization layer
pub const TEMPORAL_BINS: usize = 9;
pub const VALUE_LAYER_WIDTHS: [usize; 4] = [1, 30, 30, 1];
pub const LEAKY_RELU_SLOPE: f32 = 0.1;

// Trilinear kernel fit performed once at model construction
pub const KERNEL_INIT_STEPS: usize = 1000;
pub const KERNEL_INIT_SAMPLES: usize = 2000;
pub const KERNEL_INIT_LR: f32 = 1e-2;

// Classifier head
pub const POOLED_GRID: usize = 4;
pub const HEAD_HIDDEN: usize = 64;

// Optimizer
pub const ADAM_BETA1: f32 = 0.9;
pub const ADAM_BETA2: f32 = 0.999;
pub const ADAM_EPSILON_FULL: f32 = 1e-8;
pub const ADAM_EPSILON_HALF: f32 = 1e-4;

// Learning-rate decay: multiply by gamma after every DECAY_EVERY epochs
pub const LR_DECAY_GAMMA: f32 = 0.5;
pub const LR_DECAY_EVERY: usize = 10;

// Visualization
pub const ROBUST_MIN_PERCENTILE: f64 = 1.0;
pub const ROBUST_MAX_PERCENTILE: f64 = 99.0;
pub const GRID_IMAGES_PER_ROW: usize = 8;
pub const GRID_PADDING: usize = 2;

// Largest finite binary16 value
pub const HALF_MAX: f32 = 65504.0;

// Timestamp normalization floor
pub const TIME_EPSILON: f32 = 1e-6;

pub const GLOBAL_SEED: u64 = 0;

pub const BEST_CHECKPOINT_NAME: &str = "model_best.ckpt";
pub const CHECKPOINT_EXTENSION: &str = "ckpt";
pub const METRICS_FILE_NAME: &str = "metrics.jsonl";
pub const IMAGE_DIR_NAME: &str = "images";
