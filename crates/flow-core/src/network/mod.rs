//! PWC-style coarse-to-fine flow network.

pub mod correlation;
pub mod estimator;
pub mod features;
pub mod warp;

use tch::{nn, Kind, Tensor};

use crate::config::NetConfig;
use crate::error::Result;
use correlation::cost_volume;
use estimator::{ContextNetwork, FlowEstimator};
use features::FeaturePyramid;
use warp::warp;

pub(crate) fn leaky_relu(x: &Tensor) -> Tensor {
    x.maximum(&(x * 0.1))
}

/// What a flow model returns for one batch of frame pairs.
#[derive(Debug)]
pub struct FlowOutput {
    /// Full-resolution flow, `[B, 2, H, W]`.
    pub flow: Tensor,
    /// Predicted pyramid, coarsest first.
    pub pyramid: Vec<Tensor>,
}

/// Any network that maps a `[B, 3, H, W]` frame pair to flow at several resolutions.
pub trait FlowModel {
    fn forward(&self, src: &Tensor, tgt: &Tensor) -> FlowOutput;
}

/// Flow is kept in full-resolution pixel units at every level, matching the
/// average-pooled ground truth. Level `l` (0 = finest) is `2^(l+1)` times
/// smaller than the input, so warping divides by that factor.
#[derive(Debug)]
pub struct PwcNet {
    features: FeaturePyramid,
    estimators: Vec<FlowEstimator>,
    context: Option<ContextNetwork>,
    pub config: NetConfig,
}

impl PwcNet {
    pub fn new(vs: &nn::Path, config: &NetConfig) -> Result<Self> {
        config.validate()?;
        let features = FeaturePyramid::new(&(vs / "features"), &config.lv_chs);

        let mut estimators = Vec::with_capacity(config.num_levels);
        for (l, &ch) in config.lv_chs.iter().enumerate() {
            let matching = if config.use_correlation {
                correlation::num_channels(config.search_range)
            } else {
                ch
            };
            estimators.push(FlowEstimator::new(&(vs / "estimator" / l), matching + ch + 2));
        }

        let context = if config.use_context_network {
            Some(ContextNetwork::new(
                &(vs / "context"),
                FlowEstimator::hidden_channels() + 2,
            ))
        } else {
            None
        };

        Ok(Self {
            features,
            estimators,
            context,
            config: config.clone(),
        })
    }
}

impl FlowModel for PwcNet {
    fn forward(&self, src: &Tensor, tgt: &Tensor) -> FlowOutput {
        let size = src.size();
        let (b, h, w) = (size[0], size[2], size[3]);
        let f1 = self.features.forward(src);
        let f2 = self.features.forward(tgt);

        let mut pyramid = Vec::with_capacity(self.config.num_levels);
        let mut flow: Option<Tensor> = None;

        for l in (0..self.config.num_levels).rev() {
            let (x1, x2) = (&f1[l], &f2[l]);
            let lsize = x1.size();
            let (lh, lw) = (lsize[2], lsize[3]);
            let factor = (1i64 << (l + 1)) as f64;

            let up = match &flow {
                Some(coarser) => {
                    coarser.upsample_bilinear2d([lh, lw], false, None::<f64>, None::<f64>)
                }
                None => Tensor::zeros([b, 2, lh, lw], (Kind::Float, src.device())),
            };

            let x2 = if self.config.use_warping_layer && flow.is_some() {
                warp(x2, &(&up / factor))
            } else {
                x2.shallow_clone()
            };

            let matching = if self.config.use_correlation {
                let cv = cost_volume(x1, &x2, self.config.search_range);
                if self.config.corr_activation {
                    leaky_relu(&cv)
                } else {
                    cv
                }
            } else {
                x2
            };

            let input = Tensor::cat(&[&matching, x1, &up], 1);
            let (hidden, residual) = self.estimators[l].forward(&input);
            let mut level_flow = up + residual;

            if l == 0 {
                if let Some(context) = &self.context {
                    let refine = context.forward(&Tensor::cat(&[&hidden, &level_flow], 1));
                    level_flow = level_flow + refine;
                }
            }

            pyramid.push(level_flow.shallow_clone());
            flow = Some(level_flow);
        }

        let finest = pyramid[pyramid.len() - 1].shallow_clone();
        let full = finest.upsample_bilinear2d([h, w], false, None::<f64>, None::<f64>);
        FlowOutput {
            flow: full,
            pyramid,
        }
    }
}

unsafe impl Send for PwcNet {}
unsafe impl Sync for PwcNet {}
