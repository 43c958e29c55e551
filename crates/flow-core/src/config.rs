use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Number of pyramid levels, and therefore of supervised flow levels.
    pub num_levels: usize,
    /// Feature channels per pyramid level, finest first.
    pub lv_chs: Vec<i64>,
    /// Maximum displacement (in feature pixels) searched by the cost volume.
    pub search_range: i64,
    /// Build a cost volume between source and (warped) target features.
    /// When disabled, the warped target features are fed to the estimator directly.
    pub use_correlation: bool,
    /// Apply a leaky ReLU on top of the cost volume.
    pub corr_activation: bool,
    /// Warp target features with the upsampled coarser flow before matching.
    pub use_warping_layer: bool,
    /// Refine the finest flow with the dilated context network.
    pub use_context_network: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            num_levels: 6,
            lv_chs: vec![16, 32, 64, 96, 128, 192],
            search_range: 4,
            use_correlation: true,
            corr_activation: false,
            use_warping_layer: false,
            use_context_network: false,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_levels == 0 {
            return Err(FlowError::Config("num_levels must be at least 1".into()));
        }
        if self.lv_chs.len() != self.num_levels {
            return Err(FlowError::Config(format!(
                "lv_chs has {} entries but num_levels is {}",
                self.lv_chs.len(),
                self.num_levels
            )));
        }
        if self.lv_chs.iter().any(|&c| c <= 0) {
            return Err(FlowError::Config("lv_chs must be positive".into()));
        }
        if self.search_range < 0 {
            return Err(FlowError::Config("search_range must be non-negative".into()));
        }
        Ok(())
    }

    /// Linear downsampling factor between the input and the coarsest level.
    pub fn coarsest_factor(&self) -> usize {
        1 << self.num_levels
    }
}

/// What the trained parameters need to be rebuilt at inference time.
/// Deserializes from a full training `config.json`; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub net: NetConfig,
    #[serde(default)]
    pub input_norm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMode {
    L1,
    L2,
    PyramidL1,
    PyramidL2,
}

impl LossMode {
    pub fn is_pyramid(self) -> bool {
        matches!(self, LossMode::PyramidL1 | LossMode::PyramidL2)
    }
}

impl FromStr for LossMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "L1" => Ok(LossMode::L1),
            "L2" => Ok(LossMode::L2),
            "PyramidL1" => Ok(LossMode::PyramidL1),
            "PyramidL2" => Ok(LossMode::PyramidL2),
            other => Err(FlowError::Config(format!(
                "unknown loss '{}', expected one of L1, L2, PyramidL1, PyramidL2",
                other
            ))),
        }
    }
}

impl fmt::Display for LossMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub mode: LossMode,
    /// One weight per pyramid level, coarsest first.
    pub weights: Vec<f64>,
    /// Robust penalty offset.
    pub epsilon: f64,
    /// Robust penalty exponent.
    pub q: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            mode: LossMode::L2,
            weights: vec![1.0, 0.32, 0.08, 0.02, 0.01, 0.005],
            epsilon: 0.02,
            q: 0.4,
        }
    }
}

impl LossConfig {
    pub fn validate(&self, num_levels: usize) -> Result<()> {
        if self.weights.len() != num_levels {
            return Err(FlowError::Config(format!(
                "{} level weights given for {} pyramid levels",
                self.weights.len(),
                num_levels
            )));
        }
        if self.weights.iter().any(|&w| !(w > 0.0)) {
            return Err(FlowError::Config("level weights must be positive".into()));
        }
        if self.epsilon < 0.0 || !(self.q > 0.0) {
            return Err(FlowError::Config(format!(
                "robust penalty needs epsilon >= 0 and q > 0 (got epsilon={}, q={})",
                self.epsilon, self.q
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SGD" | "Sgd" | "sgd" => Ok(OptimizerKind::Sgd),
            "Adam" | "adam" => Ok(OptimizerKind::Adam),
            other => Err(FlowError::Config(format!(
                "unknown optimizer '{}', expected SGD or Adam",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    /// SGD momentum.
    pub momentum: f64,
    /// Adam second-moment decay.
    pub beta: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 4e-4,
            momentum: 4e-4,
            beta: 0.99,
            weight_decay: 4e-4,
        }
    }
}
