pub mod dataset;
pub mod eval;
pub mod loader;
pub mod optim;
pub mod sources;
pub mod summary;
pub mod train;

pub use dataset::{DatasetKind, FlowDataset, InMemoryDataset, Sample, Split};
pub use eval::{evaluate, evaluate_model, EvalReport};
pub use loader::{build_loader, Batch, CropType, DataLoader, EpochCursor, SampleTransform};
pub use optim::{build_optimizer, StepOptimizer};
pub use summary::{FileSummaryWriter, SummaryWriter};
pub use train::{TrainReport, Trainer};

pub use flow_core::RUN_CONFIG_FILE;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flow_core::{LossConfig, NetConfig, OptimizerConfig, Resize};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub dataset: DatasetKind,
    pub dataset_dir: PathBuf,
    pub crop_type: CropType,
    /// `[height, width]`
    pub crop_shape: Option<[usize; 2]>,
    /// `[height, width]`; exclusive with `resize_scale`.
    pub resize_shape: Option<[usize; 2]>,
    pub resize_scale: Option<f64>,
    /// Threads decoding samples; 0 uses the global rayon pool.
    pub num_workers: usize,
    pub batch_size: usize,
    /// Per-channel mean/std normalization of the input frames.
    pub input_norm: bool,
    pub net: NetConfig,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,
    pub total_step: usize,
    /// Checkpoints, summaries and `config.json` go here. Must be set explicitly.
    pub log_dir: PathBuf,
    pub summary_interval: usize,
    pub log_interval: usize,
    pub checkpoint_interval: usize,
    /// Samples per level rendered in image summaries.
    pub max_output: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::FlyingChairs,
            dataset_dir: PathBuf::new(),
            crop_type: CropType::Random,
            crop_shape: Some([384, 448]),
            resize_shape: None,
            resize_scale: None,
            num_workers: 8,
            batch_size: 8,
            input_norm: false,
            net: NetConfig::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            total_step: 200_000,
            log_dir: PathBuf::new(),
            summary_interval: 100,
            log_interval: 100,
            checkpoint_interval: 100,
            max_output: 3,
        }
    }
}

impl TrainerConfig {
    /// Everything that can be checked before the first step.
    pub fn validate(&self) -> Result<()> {
        self.net.validate()?;
        self.loss.validate(self.net.num_levels)?;
        let resize = Resize::from_options(self.resize_shape, self.resize_scale)?;

        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        for (name, value) in [
            ("summary_interval", self.summary_interval),
            ("log_interval", self.log_interval),
            ("checkpoint_interval", self.checkpoint_interval),
        ] {
            if value == 0 {
                bail!("{} must be at least 1", name);
            }
        }
        if self.log_dir.as_os_str().is_empty() {
            bail!("log_dir must be set");
        }
        if let Some([h, w]) = self.crop_shape {
            if h == 0 || w == 0 {
                bail!("crop_shape must be positive, got {}x{}", h, w);
            }
        }

        // When the training resolution is known up front, every pyramid level must
        // pool evenly or the network and ground-truth pyramids drift apart.
        let known_shape = match resize {
            Some(Resize::Shape(shape)) => Some(shape),
            Some(Resize::Scale(_)) => None,
            None => self.crop_shape,
        };
        if let Some([h, w]) = known_shape {
            let factor = self.net.coarsest_factor();
            if h % factor != 0 || w % factor != 0 {
                bail!(
                    "training shape {}x{} is not divisible by 2^{} = {}",
                    h,
                    w,
                    self.net.num_levels,
                    factor
                );
            }
        }
        Ok(())
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read training config {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse training config {:?}", path))
    }

    /// Reads the `config.json` stored alongside `checkpoint`.
    pub fn for_checkpoint<P: AsRef<Path>>(checkpoint: P) -> Result<Self> {
        let checkpoint = checkpoint.as_ref();
        let dir = checkpoint.parent().unwrap_or_else(|| Path::new("."));
        let path = dir.join(RUN_CONFIG_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read run config {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TrainerConfig {
        TrainerConfig {
            log_dir: PathBuf::from("runs/test"),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate_once_log_dir_is_set() {
        valid().validate().unwrap();
        assert!(TrainerConfig::default().validate().is_err());
    }

    #[test]
    fn rejects_weight_level_mismatch() {
        let mut config = valid();
        config.loss.weights.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_both_resize_options() {
        let config = TrainerConfig {
            resize_shape: Some([256, 256]),
            resize_scale: Some(0.5),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shapes_that_do_not_pool_evenly() {
        let config = TrainerConfig {
            crop_shape: Some([384, 440]),
            ..valid()
        };
        assert!(config.validate().is_err());

        let resized = TrainerConfig {
            crop_shape: Some([100, 100]),
            resize_shape: Some([128, 192]),
            ..valid()
        };
        resized.validate().unwrap();
    }

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let yaml = "dataset: SintelClean\ndataset_dir: /data/sintel\nlog_dir: runs/a\nbatch_size: 4\nloss:\n  mode: PyramidL1\n  weights: [1.0, 0.32, 0.08, 0.02, 0.01, 0.005]\n  epsilon: 0.01\n  q: 0.4\n";
        let config: TrainerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.dataset, DatasetKind::SintelClean);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.total_step, 200_000);
        assert_eq!(config.loss.mode, flow_core::LossMode::PyramidL1);
        config.validate().unwrap();
    }
}
