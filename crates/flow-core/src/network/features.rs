use tch::{nn, Tensor};

use super::leaky_relu;

/// Two 3x3 convolutions per level; the first halves the resolution.
#[derive(Debug)]
pub struct FeatureLevel {
    down: nn::Conv2D,
    conv: nn::Conv2D,
}

impl FeatureLevel {
    pub fn new(vs: &nn::Path, in_ch: i64, out_ch: i64) -> Self {
        let down = nn::conv2d(
            vs / "down",
            in_ch,
            out_ch,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );
        let conv = nn::conv2d(
            vs / "conv",
            out_ch,
            out_ch,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );
        Self { down, conv }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        leaky_relu(&leaky_relu(&x.apply(&self.down)).apply(&self.conv))
    }
}

/// Feature pyramid shared by both frames.
#[derive(Debug)]
pub struct FeaturePyramid {
    levels: Vec<FeatureLevel>,
}

impl FeaturePyramid {
    pub fn new(vs: &nn::Path, lv_chs: &[i64]) -> Self {
        let mut levels = Vec::with_capacity(lv_chs.len());
        let mut in_ch = 3;
        for (i, &out_ch) in lv_chs.iter().enumerate() {
            levels.push(FeatureLevel::new(&(vs / i), in_ch, out_ch));
            in_ch = out_ch;
        }
        Self { levels }
    }

    /// Returns features finest first: entry `i` is at `1 / 2^(i+1)` resolution.
    pub fn forward(&self, x: &Tensor) -> Vec<Tensor> {
        let mut out = Vec::with_capacity(self.levels.len());
        let mut x = x.shallow_clone();
        for level in &self.levels {
            x = level.forward(&x);
            out.push(x.shallow_clone());
        }
        out
    }
}
