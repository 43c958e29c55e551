use tch::{Kind, Tensor};

use crate::config::{LossConfig, LossMode};
use crate::error::{FlowError, Result};

/// Mean absolute error over every pixel and channel.
pub fn l1_loss(pred: &Tensor, gt: &Tensor) -> Tensor {
    (pred - gt).abs().mean(Kind::Float)
}

/// Mean squared error over every pixel and channel.
pub fn l2_loss(pred: &Tensor, gt: &Tensor) -> Tensor {
    (pred - gt).pow_tensor_scalar(2.0).mean(Kind::Float)
}

/// Mean end-point error: Euclidean norm of the displacement error, averaged over pixels.
pub fn end_point_error(pred: &Tensor, gt: &Tensor) -> Tensor {
    (pred - gt)
        .pow_tensor_scalar(2.0)
        .sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float)
        .sqrt()
        .mean(Kind::Float)
}

/// Rejects pyramids that differ in depth or in any level's shape.
pub fn check_alignment(pred: &[Tensor], gt: &[Tensor]) -> Result<()> {
    if pred.len() != gt.len() {
        return Err(FlowError::PyramidAlignment(format!(
            "predicted pyramid has {} levels, ground truth has {}",
            pred.len(),
            gt.len()
        )));
    }
    for (level, (p, g)) in pred.iter().zip(gt).enumerate() {
        if p.size() != g.size() {
            return Err(FlowError::PyramidAlignment(format!(
                "level {}: predicted shape {:?} vs ground truth {:?}",
                level,
                p.size(),
                g.size()
            )));
        }
    }
    Ok(())
}

/// Turns a predicted/ground-truth pair into one scalar training loss.
#[derive(Debug, Clone)]
pub struct LossAggregator {
    config: LossConfig,
}

impl LossAggregator {
    /// Validates the weights against the pyramid depth once, up front.
    pub fn new(config: LossConfig, num_levels: usize) -> Result<Self> {
        config.validate(num_levels)?;
        Ok(Self { config })
    }

    pub fn mode(&self) -> LossMode {
        self.config.mode
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// `flow`/`flow_gt` are full resolution `[B, 2, H, W]`; the pyramids are coarsest first.
    pub fn compute(
        &self,
        flow: &Tensor,
        flow_gt: &Tensor,
        pyramid: &[Tensor],
        gt_pyramid: &[Tensor],
    ) -> Result<Tensor> {
        match self.config.mode {
            LossMode::L1 => {
                check_full_resolution(flow, flow_gt)?;
                Ok(l1_loss(flow, flow_gt))
            }
            LossMode::L2 => {
                check_full_resolution(flow, flow_gt)?;
                Ok(l2_loss(flow, flow_gt))
            }
            LossMode::PyramidL2 => self.pyramid_loss(pyramid, gt_pyramid, |diff| {
                diff.pow_tensor_scalar(2.0)
                    .sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float)
            }),
            LossMode::PyramidL1 => {
                let (epsilon, q) = (self.config.epsilon, self.config.q);
                self.pyramid_loss(pyramid, gt_pyramid, move |diff| {
                    (diff.abs().sum_dim_intlist(Some(&[1i64][..]), false, Kind::Float) + epsilon)
                        .pow_tensor_scalar(q)
                })
            }
        }
    }

    /// Weighted sum over levels of the per-pixel penalty averaged over pixels.
    fn pyramid_loss<F>(&self, pyramid: &[Tensor], gt_pyramid: &[Tensor], penalty: F) -> Result<Tensor>
    where
        F: Fn(&Tensor) -> Tensor,
    {
        check_alignment(pyramid, gt_pyramid)?;
        if pyramid.len() != self.config.weights.len() {
            return Err(FlowError::PyramidAlignment(format!(
                "{} levels supplied for {} level weights",
                pyramid.len(),
                self.config.weights.len()
            )));
        }

        let terms: Vec<Tensor> = pyramid
            .iter()
            .zip(gt_pyramid)
            .zip(&self.config.weights)
            .map(|((pred, gt), &w)| penalty(&(pred - gt)).mean(Kind::Float) * w)
            .collect();
        Ok(Tensor::stack(&terms, 0).sum(Kind::Float))
    }
}

fn check_full_resolution(flow: &Tensor, flow_gt: &Tensor) -> Result<()> {
    if flow.size() != flow_gt.size() {
        return Err(FlowError::PyramidAlignment(format!(
            "full-resolution flow shape {:?} vs ground truth {:?}",
            flow.size(),
            flow_gt.size()
        )));
    }
    Ok(())
}
