use std::path::Path;

use anyhow::{bail, Result};
use flow_core::loss::end_point_error;
use flow_core::transforms::normalize_frames;
use flow_core::{load_checkpoint, FlowModel, PwcNet};
use tch::{nn, Device};

use crate::dataset::Split;
use crate::loader::{build_loader, DataLoader};
use crate::TrainerConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub samples: usize,
    /// Mean end-point error in pixels, averaged over samples.
    pub mean_epe: f64,
}

/// Loads `checkpoint` with the run config stored next to it and scores it on the
/// test split of the dataset it was trained on.
pub fn evaluate<P: AsRef<Path>>(checkpoint: P, device: Device) -> Result<EvalReport> {
    let checkpoint = checkpoint.as_ref();
    let config = TrainerConfig::for_checkpoint(checkpoint)?;

    let mut vs = nn::VarStore::new(device);
    let model = PwcNet::new(&vs.root(), &config.net)?;
    load_checkpoint(&mut vs, checkpoint)?;
    log::info!("evaluating {:?} on {} test split", checkpoint, config.dataset);

    let loader = build_loader(&config, Split::Test)?;
    evaluate_model(&model, &loader, config.input_norm, device)
}

pub fn evaluate_model<M: FlowModel>(
    model: &M,
    loader: &DataLoader,
    input_norm: bool,
    device: Device,
) -> Result<EvalReport> {
    let mut samples = 0usize;
    let mut total = 0f64;
    tch::no_grad(|| -> Result<()> {
        for batch in loader.iter() {
            let batch = batch?.to_device(device);
            let (src, tgt) = if input_norm {
                (normalize_frames(&batch.src), normalize_frames(&batch.tgt))
            } else {
                (batch.src.shallow_clone(), batch.tgt.shallow_clone())
            };
            let output = model.forward(&src, &tgt);
            let epe = end_point_error(&output.flow, &batch.flow).double_value(&[]);
            total += epe * batch.len() as f64;
            samples += batch.len();
        }
        Ok(())
    })?;

    if samples == 0 {
        bail!("test split is empty");
    }
    let report = EvalReport {
        samples,
        mean_epe: total / samples as f64,
    };
    log::info!("EPE {:.4} over {} samples", report.mean_epe, report.samples);
    Ok(report)
}
