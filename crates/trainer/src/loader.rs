//! Batching, shuffling and per-sample transforms.
//!
//! A [`DataLoader`] describes one pass over a dataset; [`DataLoader::iter`]
//! yields [`Batch`]es for a single epoch with a fresh shuffle. Samples of a
//! batch are decoded in parallel on a rayon pool, the training loop itself
//! only ever sees finished batches.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use flow_core::transforms::{center_crop_offset, crop_frame, frame_to_tensor, resize_frame};
use flow_core::Resize;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tch::{Device, Tensor};

use crate::dataset::{FlowDataset, Sample, Split};
use crate::TrainerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropType {
    Random,
    Center,
}

impl FromStr for CropType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(CropType::Random),
            "center" => Ok(CropType::Center),
            other => bail!("unknown crop type '{}', expected random or center", other),
        }
    }
}

impl fmt::Display for CropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CropType::Random => f.write_str("random"),
            CropType::Center => f.write_str("center"),
        }
    }
}

/// Crop, then resize. Frames and flow always receive the same window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTransform {
    pub crop: Option<(CropType, [usize; 2])>,
    pub resize: Option<Resize>,
}

impl SampleTransform {
    pub fn apply(&self, sample: Sample) -> Result<Sample> {
        let Sample {
            mut src,
            mut tgt,
            mut flow,
        } = sample;

        if let Some((kind, crop)) = self.crop {
            let (h, w) = (flow.height(), flow.width());
            let (top, left) = match kind {
                CropType::Center => center_crop_offset(h, w, crop)?,
                CropType::Random => {
                    let [th, tw] = crop;
                    if th > h || tw > w {
                        bail!("crop {}x{} is larger than the {}x{} sample", th, tw, h, w);
                    }
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(0..=h - th), rng.gen_range(0..=w - tw))
                }
            };
            src = crop_frame(&src, top, left, crop[0], crop[1]);
            tgt = crop_frame(&tgt, top, left, crop[0], crop[1]);
            flow = flow.crop(top, left, crop[0], crop[1])?;
        }

        if let Some(resize) = self.resize {
            let (h, w) = resize.target(flow.height(), flow.width());
            src = resize_frame(&src, h, w);
            tgt = resize_frame(&tgt, h, w);
            flow = flow.resize(h, w);
        }

        Ok(Sample { src, tgt, flow })
    }
}

/// A stacked batch on the CPU: frames `[B, 3, H, W]` in `[0, 1]`, flow `[B, 2, H, W]`.
#[derive(Debug)]
pub struct Batch {
    pub src: Tensor,
    pub tgt: Tensor,
    pub flow: Tensor,
    /// Dataset indices of the samples, in batch order.
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            src: self.src.to_device(device),
            tgt: self.tgt.to_device(device),
            flow: self.flow.to_device(device),
            indices: self.indices.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<dyn FlowDataset>,
    batch_size: usize,
    shuffle: bool,
    transform: SampleTransform,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader")
            .field("samples", &self.dataset.len())
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .field("transform", &self.transform)
            .finish()
    }
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn FlowDataset>,
        batch_size: usize,
        shuffle: bool,
        transform: SampleTransform,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if dataset.is_empty() {
            bail!("dataset is empty");
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            transform,
            pool: None,
        })
    }

    /// Decodes samples on a dedicated pool of `workers` threads; 0 keeps the global pool.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        self.pool = if workers == 0 {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("loader-{}", i))
                .build()
                .context("Failed to build loader thread pool")?;
            Some(Arc::new(pool))
        };
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// Batches per epoch, counting a trailing partial batch.
    pub fn len(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// One epoch, shuffled afresh when shuffling is on.
    pub fn iter(&self) -> Batches {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut rand::thread_rng());
        }
        Batches {
            loader: self.clone(),
            order,
            position: 0,
        }
    }

    fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let load = || -> Result<Vec<Sample>> {
            indices
                .par_iter()
                .map(|&i| {
                    let sample = self
                        .dataset
                        .get(i)
                        .with_context(|| format!("Failed to load sample {}", i))?;
                    self.transform.apply(sample)
                })
                .collect()
        };
        let samples = match &self.pool {
            Some(pool) => pool.install(load)?,
            None => load()?,
        };
        stack_samples(samples, indices.to_vec())
    }
}

fn stack_samples(samples: Vec<Sample>, indices: Vec<usize>) -> Result<Batch> {
    let first = samples.first().ok_or_else(|| anyhow!("cannot stack an empty batch"))?;
    let shape = (first.flow.width(), first.flow.height());
    for (sample, index) in samples.iter().zip(&indices) {
        sample.validate()?;
        if (sample.flow.width(), sample.flow.height()) != shape {
            bail!(
                "sample {} is {}x{} but the batch is {}x{}; configure a crop or resize",
                index,
                sample.flow.width(),
                sample.flow.height(),
                shape.0,
                shape.1
            );
        }
    }

    let src: Vec<Tensor> = samples.iter().map(|s| frame_to_tensor(&s.src)).collect();
    let tgt: Vec<Tensor> = samples.iter().map(|s| frame_to_tensor(&s.tgt)).collect();
    let flow: Vec<Tensor> = samples.iter().map(|s| s.flow.to_tensor()).collect();
    Ok(Batch {
        src: Tensor::stack(&src, 0),
        tgt: Tensor::stack(&tgt, 0),
        flow: Tensor::stack(&flow, 0),
        indices,
    })
}

/// Iterator over the batches of one epoch.
pub struct Batches {
    loader: DataLoader,
    order: Vec<usize>,
    position: usize,
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let indices = &self.order[self.position..end];
        self.position = end;
        Some(self.loader.load_batch(indices))
    }
}

/// Endless batch source for a step-driven loop. A new epoch, with a new
/// shuffle, starts exactly when the previous one runs out.
pub struct EpochCursor {
    loader: DataLoader,
    batches: Option<Batches>,
    epoch: usize,
}

impl EpochCursor {
    pub fn new(loader: DataLoader) -> Self {
        Self {
            loader,
            batches: None,
            epoch: 0,
        }
    }

    /// Epochs started so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        if let Some(batches) = self.batches.as_mut() {
            if let Some(batch) = batches.next() {
                return batch;
            }
        }
        let mut batches = self.loader.iter();
        self.epoch += 1;
        log::debug!("starting epoch {}", self.epoch);
        let batch = batches
            .next()
            .ok_or_else(|| anyhow!("loader produced no batches"))?;
        self.batches = Some(batches);
        batch
    }
}

/// Training batches are shuffled and cropped as configured; test batches are
/// centre-cropped in order.
pub fn build_loader(config: &TrainerConfig, split: Split) -> Result<DataLoader> {
    let dataset = config.dataset.open(&config.dataset_dir, split)?;
    let (crop_type, shuffle) = match split {
        Split::Train => (config.crop_type, true),
        Split::Test => (CropType::Center, false),
    };
    let transform = SampleTransform {
        crop: config.crop_shape.map(|shape| (crop_type, shape)),
        resize: Resize::from_options(config.resize_shape, config.resize_scale)?,
    };
    DataLoader::new(dataset, config.batch_size, shuffle, transform)?.with_workers(config.num_workers)
}
