use anyhow::Result;
use flow_core::{OptimizerConfig, OptimizerKind};
use tch::nn::{self, OptimizerConfig as _};

/// The two calls the training loop makes on an optimizer around `backward`.
pub trait StepOptimizer {
    fn zero_grad(&mut self);
    fn step(&mut self);
}

impl StepOptimizer for nn::Optimizer {
    fn zero_grad(&mut self) {
        nn::Optimizer::zero_grad(self)
    }

    fn step(&mut self) {
        nn::Optimizer::step(self)
    }
}

pub fn build_optimizer(vs: &nn::VarStore, config: &OptimizerConfig) -> Result<nn::Optimizer> {
    let optimizer = match config.kind {
        OptimizerKind::Adam => nn::adam(0.9, config.beta, config.weight_decay).build(vs, config.lr)?,
        OptimizerKind::Sgd => {
            nn::sgd(config.momentum, 0.0, config.weight_decay, false).build(vs, config.lr)?
        }
    };
    log::info!("optimizer: {:?} lr={}", config.kind, config.lr);
    Ok(optimizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn descends(kind: OptimizerKind) {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().ones("w", &[1]);
        let config = OptimizerConfig {
            kind,
            lr: 0.1,
            ..Default::default()
        };
        let mut opt = build_optimizer(&vs, &config).unwrap();
        let before = w.double_value(&[0]);
        let loss = (&w * &w).sum(Kind::Float);
        StepOptimizer::zero_grad(&mut opt);
        loss.backward();
        StepOptimizer::step(&mut opt);
        assert!(w.double_value(&[0]) < before);
    }

    #[test]
    fn adam_takes_a_step() {
        descends(OptimizerKind::Adam);
    }

    #[test]
    fn sgd_takes_a_step() {
        descends(OptimizerKind::Sgd);
    }
}
