//! Run configuration and model shape parameters.

use crate::error::ConfigError;
use crate::events::Device;
use crate::params::{
    HEAD_HIDDEN, KERNEL_INIT_LR, KERNEL_INIT_SAMPLES, KERNEL_INIT_STEPS, LEAKY_RELU_SLOPE, POOLED_GRID,
    SENSOR_HEIGHT, SENSOR_WIDTH, TEMPORAL_BINS, VALUE_LAYER_WIDTHS,
};
use crate::precision::PrecisionMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_DEVICE: &str = "cpu";
pub const DEFAULT_NUM_WORKERS: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 4;
pub const DEFAULT_LR: f32 = 1e-4;
pub const DEFAULT_NUM_EPOCHS: usize = 30;
pub const DEFAULT_SAVE_EVERY_N_EPOCHS: usize = 5;

/// Immutable settings of one training run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub validation_dataset: PathBuf,
    pub training_dataset: PathBuf,
    pub testing_dataset: PathBuf,
    pub log_dir: PathBuf,
    pub device: String,
    pub num_workers: usize,
    pub pin_memory: bool,
    pub batch_size: usize,
    pub lr: f32,
    pub num_epochs: usize,
    pub save_every_n_epochs: usize,
    pub continue_from: Option<PathBuf>,
    pub use_hp: bool,
}

impl TrainConfig {
    /// Configuration with default hyper-parameters for the given paths
    pub fn new(
        training_dataset: impl Into<PathBuf>,
        validation_dataset: impl Into<PathBuf>,
        testing_dataset: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            validation_dataset: validation_dataset.into(),
            training_dataset: training_dataset.into(),
            testing_dataset: testing_dataset.into(),
            log_dir: log_dir.into(),
            device: DEFAULT_DEVICE.to_string(),
            num_workers: DEFAULT_NUM_WORKERS,
            pin_memory: true,
            batch_size: DEFAULT_BATCH_SIZE,
            lr: DEFAULT_LR,
            num_epochs: DEFAULT_NUM_EPOCHS,
            save_every_n_epochs: DEFAULT_SAVE_EVERY_N_EPOCHS,
            continue_from: None,
            use_hp: false,
        }
    }

    /// Check paths and values, creating `log_dir` once its parent is known
    /// to exist
    pub fn validate(self) -> Result<Self, ConfigError> {
        for (split, path) in [
            ("Validation", &self.validation_dataset),
            ("Training", &self.training_dataset),
            ("Testing", &self.testing_dataset),
        ] {
            if !path.is_dir() {
                return Err(ConfigError::MissingDataset { split, path: path.clone() });
            }
        }

        let root = match self.log_dir.parent() {
            Some(p) if p.as_os_str().is_empty() => PathBuf::from("."),
            Some(p) => p.to_path_buf(),
            None => self.log_dir.clone(),
        };
        if !root.is_dir() {
            return Err(ConfigError::MissingLogRoot { path: root });
        }

        if let Some(ckpt) = &self.continue_from {
            if !ckpt.is_file() {
                return Err(ConfigError::MissingCheckpoint { path: ckpt.clone() });
            }
        }

        self.device()?;
        positive("batch_size", self.batch_size)?;
        positive("num_epochs", self.num_epochs)?;
        positive("save_every_n_epochs", self.save_every_n_epochs)?;
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::InvalidValue { field: "lr", reason: format!("{} is not positive", self.lr) });
        }

        fs::create_dir_all(&self.log_dir)
            .map_err(|source| ConfigError::CreateLogDir { path: self.log_dir.clone(), source })?;
        Ok(self)
    }

    pub fn device(&self) -> Result<Device, ConfigError> {
        self.device.parse()
    }

    pub fn precision(&self) -> PrecisionMode {
        PrecisionMode::from_use_hp(self.use_hp)
    }

    /// Human-readable dump, one `key: value` per line
    pub fn banner(&self) -> String {
        let mut out = String::from("----------------------------\n");
        out.push_str(&format!("validation_dataset: {}\n", self.validation_dataset.display()));
        out.push_str(&format!("training_dataset: {}\n", self.training_dataset.display()));
        out.push_str(&format!("testing_dataset: {}\n", self.testing_dataset.display()));
        out.push_str(&format!("log_dir: {}\n", self.log_dir.display()));
        out.push_str(&format!("device: {}\n", self.device));
        out.push_str(&format!("num_workers: {}\n", self.num_workers));
        out.push_str(&format!("pin_memory: {}\n", self.pin_memory));
        out.push_str(&format!("batch_size: {}\n", self.batch_size));
        out.push_str(&format!("lr: {}\n", self.lr));
        out.push_str(&format!("num_epochs: {}\n", self.num_epochs));
        out.push_str(&format!("save_every_n_epochs: {}\n", self.save_every_n_epochs));
        match &self.continue_from {
            Some(p) => out.push_str(&format!("continue_from: {}\n", p.display())),
            None => out.push_str("continue_from: None\n"),
        }
        out.push_str(&format!("use_hp: {}\n", self.use_hp));
        out.push_str("----------------------------");
        out
    }
}

pub(crate) fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue { field, reason: "must be at least 1".into() });
    }
    Ok(())
}

/// Shape parameters of [`crate::model::QuantizedClassifier`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub height: usize,
    pub width: usize,
    /// Temporal bins per polarity
    pub bins: usize,
    /// Value MLP widths including the scalar input and output
    pub value_layer_widths: Vec<usize>,
    pub leaky_slope: f32,
    pub pooled_grid: usize,
    pub head_hidden: usize,
    pub kernel_init_steps: usize,
    pub kernel_init_samples: usize,
    pub kernel_init_lr: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            height: SENSOR_HEIGHT,
            width: SENSOR_WIDTH,
            bins: TEMPORAL_BINS,
            value_layer_widths: VALUE_LAYER_WIDTHS.to_vec(),
            leaky_slope: LEAKY_RELU_SLOPE,
            pooled_grid: POOLED_GRID,
            head_hidden: HEAD_HIDDEN,
            kernel_init_steps: KERNEL_INIT_STEPS,
            kernel_init_samples: KERNEL_INIT_SAMPLES,
            kernel_init_lr: KERNEL_INIT_LR,
        }
    }
}

impl ModelConfig {
    pub fn channels(&self) -> usize {
        2 * self.bins
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bins < 2 {
            return Err(ConfigError::InvalidModel(format!("bins must be at least 2, got {}", self.bins)));
        }
        if self.channels() % 3 != 0 {
            return Err(ConfigError::InvalidModel(format!(
                "2 * bins = {} channels cannot be shown as RGB",
                self.channels()
            )));
        }
        if self.height == 0 || self.width == 0 || self.pooled_grid == 0 || self.head_hidden == 0 {
            return Err(ConfigError::InvalidModel("dimensions must be non-zero".into()));
        }
        let widths = &self.value_layer_widths;
        if widths.len() < 2 || widths[0] != 1 || widths[widths.len() - 1] != 1 || widths.contains(&0) {
            return Err(ConfigError::InvalidModel(format!("value layer widths {widths:?} must map 1 -> 1")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs() -> (tempfile::TempDir, TrainConfig) {
        let root = tempfile::tempdir().unwrap();
        for split in ["train", "val", "test"] {
            fs::create_dir(root.path().join(split)).unwrap();
        }
        let config = TrainConfig::new(
            root.path().join("train"),
            root.path().join("val"),
            root.path().join("test"),
            root.path().join("logs"),
        );
        (root, config)
    }

    #[test]
    fn defaults_match_documented_values() {
        let (_root, config) = dirs();
        assert_eq!(config.device, "cpu");
        assert_eq!(config.num_workers, 4);
        assert!(config.pin_memory);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.lr, 1e-4);
        assert_eq!(config.num_epochs, 30);
        assert_eq!(config.save_every_n_epochs, 5);
        assert!(config.continue_from.is_none());
        assert!(!config.use_hp);
    }

    #[test]
    fn validation_creates_log_dir() {
        let (_root, config) = dirs();
        let config = config.validate().unwrap();
        assert!(config.log_dir.is_dir());
    }

    #[test]
    fn missing_paths_are_reported() {
        let (root, mut config) = dirs();
        config.testing_dataset = root.path().join("nope");
        let err = config.clone().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingDataset { split: "Testing", .. }));
        assert!(err.to_string().contains("not found"));

        let (root, mut config) = dirs();
        config.log_dir = root.path().join("missing").join("logs");
        assert!(matches!(config.validate(), Err(ConfigError::MissingLogRoot { .. })));

        let (root, mut config) = dirs();
        config.continue_from = Some(root.path().join("ckpt.ckpt"));
        assert!(matches!(config.validate(), Err(ConfigError::MissingCheckpoint { .. })));
    }

    #[test]
    fn bad_values_are_rejected() {
        let (_root, mut config) = dirs();
        config.device = "cuda:0".into();
        assert!(matches!(config.clone().validate(), Err(ConfigError::UnsupportedDevice(_))));
        config.device = "cpu".into();
        config.batch_size = 0;
        assert!(matches!(config.clone().validate(), Err(ConfigError::InvalidValue { field: "batch_size", .. })));
        config.batch_size = 1;
        config.lr = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { field: "lr", .. })));
    }

    #[test]
    fn serde_round_trip_and_banner() {
        let (_root, config) = dirs();
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        let banner = config.banner();
        assert!(banner.contains("batch_size: 4"));
        assert!(banner.contains("continue_from: None"));
    }

    #[test]
    fn model_config_checks() {
        assert!(ModelConfig::default().validate().is_ok());
        assert_eq!(ModelConfig::default().channels(), 18);
        let odd = ModelConfig { bins: 4, ..ModelConfig::default() };
        assert!(odd.validate().is_err());
        let flat = ModelConfig { value_layer_widths: vec![1, 30, 2], ..ModelConfig::default() };
        assert!(flat.validate().is_err());
    }
}
