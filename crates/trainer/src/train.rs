use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use flow_core::flow_vis::{flow_to_color, side_by_side};
use flow_core::loss::{l1_loss, l2_loss};
use flow_core::transforms::{frame_from_tensor, normalize_frames};
use flow_core::{
    build_flow_pyramid, save_checkpoint, FlowField, FlowModel, LossAggregator, PwcNet, RUN_CONFIG_FILE,
};
use image::RgbImage;
use tch::{nn, Device, Tensor};

use crate::loader::{Batch, DataLoader, EpochCursor};
use crate::optim::{build_optimizer, StepOptimizer};
use crate::summary::SummaryWriter;
use crate::TrainerConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Steps run, skipped ones included.
    pub steps: usize,
    pub optimizer_steps: usize,
    /// Batches dropped because they held fewer than `batch_size` samples.
    pub skipped_batches: usize,
    pub epochs: usize,
    pub last_loss: Option<f64>,
}

pub struct Trainer<M = PwcNet, O = nn::Optimizer> {
    config: TrainerConfig,
    model: M,
    optimizer: O,
    loss: LossAggregator,
    device: Device,
    vs: nn::VarStore,
    forward_time: Duration,
    backward_time: Duration,
    timed_steps: u32,
}

impl Trainer {
    pub fn new(config: TrainerConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let model = PwcNet::new(&vs.root(), &config.net)?;
        let optimizer = build_optimizer(&vs, &config.optimizer)?;
        log::info!(
            "PWC network: {} levels, {} variables",
            config.net.num_levels,
            vs.variables().len()
        );
        Self::from_parts(config, vs, model, optimizer, device)
    }
}

impl<M: FlowModel, O: StepOptimizer> Trainer<M, O> {
    /// `model` must have been built on `vs`; checkpoints save `vs`.
    pub fn from_parts(
        config: TrainerConfig,
        vs: nn::VarStore,
        model: M,
        optimizer: O,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let loss = LossAggregator::new(config.loss.clone(), config.net.num_levels)?;
        Ok(Self {
            config,
            model,
            optimizer,
            loss,
            device,
            vs,
            forward_time: Duration::ZERO,
            backward_time: Duration::ZERO,
            timed_steps: 0,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Forward time summed over every optimizer step so far.
    pub fn forward_time(&self) -> Duration {
        self.forward_time
    }

    pub fn backward_time(&self) -> Duration {
        self.backward_time
    }

    pub fn timed_steps(&self) -> u32 {
        self.timed_steps
    }

    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.config.log_dir.join(format!("{}.safetensors", step))
    }

    pub fn train(
        &mut self,
        loader: &DataLoader,
        summary: &mut dyn SummaryWriter,
    ) -> Result<TrainReport> {
        if loader.num_samples() < self.config.batch_size {
            bail!(
                "dataset holds {} samples, fewer than batch_size {}; no batch could ever be trained on",
                loader.num_samples(),
                self.config.batch_size
            );
        }
        let log_dir = self.config.log_dir.clone();
        fs::create_dir_all(&log_dir).with_context(|| format!("Failed to create {:?}", log_dir))?;
        let config_path = log_dir.join(RUN_CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(&self.config)?)
            .with_context(|| format!("Failed to write {:?}", config_path))?;

        log::info!(
            "training for {} steps, {} batches per epoch, logging to {:?}",
            self.config.total_step,
            loader.len(),
            log_dir
        );

        let mut cursor = EpochCursor::new(loader.clone());
        let mut report = TrainReport::default();

        for step in 1..=self.config.total_step {
            report.steps = step;
            let batch = cursor.next_batch()?;
            if batch.len() != self.config.batch_size {
                report.skipped_batches += 1;
                log::debug!(
                    "step {}: skipping batch of {} (batch_size {})",
                    step,
                    batch.len(),
                    self.config.batch_size
                );
                continue;
            }

            let loss = self.train_step(&batch, step, summary)?;
            report.optimizer_steps += 1;
            report.last_loss = Some(loss);

            if step % self.config.checkpoint_interval == 0 {
                let path = self.checkpoint_path(step);
                save_checkpoint(&self.vs, &path)
                    .with_context(|| format!("Failed to save checkpoint {:?}", path))?;
                log::info!("saved checkpoint {:?}", path);
            }

            if step % self.config.log_interval == 0 {
                // Running averages since the start of training.
                let n = self.timed_steps.max(1);
                log::info!(
                    "step {:>7} | loss {:.4} | forward {:.1} ms | backward {:.1} ms | epoch {}",
                    step,
                    loss,
                    (self.forward_time / n).as_secs_f64() * 1e3,
                    (self.backward_time / n).as_secs_f64() * 1e3,
                    cursor.epoch()
                );
            }
        }

        report.epochs = cursor.epoch();
        log::info!(
            "training done: {} optimizer steps, {} skipped batches, {} epochs",
            report.optimizer_steps,
            report.skipped_batches,
            report.epochs
        );
        Ok(report)
    }

    fn train_step(
        &mut self,
        batch: &Batch,
        step: usize,
        summary: &mut dyn SummaryWriter,
    ) -> Result<f64> {
        let batch = batch.to_device(self.device);
        let (src, tgt) = if self.config.input_norm {
            (normalize_frames(&batch.src), normalize_frames(&batch.tgt))
        } else {
            (batch.src.shallow_clone(), batch.tgt.shallow_clone())
        };
        let gt_pyramid = build_flow_pyramid(&batch.flow, self.config.net.num_levels);

        let start = Instant::now();
        let output = self.model.forward(&src, &tgt);
        let loss = self
            .loss
            .compute(&output.flow, &batch.flow, &output.pyramid, &gt_pyramid)?;
        self.forward_time += start.elapsed();

        let start = Instant::now();
        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();
        self.backward_time += start.elapsed();
        self.timed_steps += 1;

        let loss = loss.double_value(&[]);
        if step % self.config.summary_interval == 0 {
            tch::no_grad(|| self.write_summaries(&batch, &output.pyramid, &gt_pyramid, loss, step, summary))?;
        }
        Ok(loss)
    }

    fn write_summaries(
        &self,
        batch: &Batch,
        pyramid: &[Tensor],
        gt_pyramid: &[Tensor],
        loss: f64,
        step: usize,
        summary: &mut dyn SummaryWriter,
    ) -> Result<()> {
        let shown = batch.len().min(self.config.max_output) as i64;

        for (k, (pred, gt)) in pyramid.iter().zip(gt_pyramid).enumerate() {
            summary.scalar_summary(&format!("L1-loss-lv{}", k), l1_loss(pred, gt).double_value(&[]), step)?;
            summary.scalar_summary(&format!("L2-loss-lv{}", k), l2_loss(pred, gt).double_value(&[]), step)?;

            let mut images = Vec::with_capacity(shown as usize);
            for i in 0..shown {
                let pred = flow_to_color(&FlowField::from_tensor(&pred.get(i))?);
                let gt = flow_to_color(&FlowField::from_tensor(&gt.get(i))?);
                images.push(side_by_side(&pred, &gt));
            }
            summary.image_summary(&format!("flow&gt-lv{}", k), &images, step)?;
        }
        summary.scalar_summary("loss", loss, step)?;

        let frames = (0..shown)
            .map(|i| {
                let src = frame_from_tensor(&batch.src.get(i))?;
                let tgt = frame_from_tensor(&batch.tgt.get(i))?;
                Ok(side_by_side(&src, &tgt))
            })
            .collect::<Result<Vec<RgbImage>>>()?;
        summary.image_summary("src & tgt", &frames, step)?;
        Ok(())
    }
}
