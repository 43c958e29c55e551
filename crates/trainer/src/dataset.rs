use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use flow_core::FlowField;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::sources::{self, SintelPass};

/// One frame pair with its ground-truth flow, before any crop or resize.
#[derive(Debug, Clone)]
pub struct Sample {
    pub src: RgbImage,
    pub tgt: RgbImage,
    pub flow: FlowField,
}

impl Sample {
    pub fn validate(&self) -> Result<()> {
        let (w, h) = self.src.dimensions();
        if self.tgt.dimensions() != (w, h) {
            bail!(
                "source is {}x{} but target is {:?}",
                w,
                h,
                self.tgt.dimensions()
            );
        }
        if (self.flow.width(), self.flow.height()) != (w as usize, h as usize) {
            bail!(
                "flow is {}x{} but frames are {}x{}",
                self.flow.width(),
                self.flow.height(),
                w,
                h
            );
        }
        Ok(())
    }
}

pub trait FlowDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples held in memory. Handy for synthetic data and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl FlowDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("sample {} out of range ({} samples)", index, self.samples.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Test,
}

impl FromStr for Split {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            other => bail!("unknown split '{}', expected train or test", other),
        }
    }
}

/// Every dataset the trainer knows how to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    FlyingChairs,
    FlyingThings,
    SintelFinal,
    SintelClean,
    #[serde(rename = "KITTI")]
    Kitti,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 5] = [
        DatasetKind::FlyingChairs,
        DatasetKind::FlyingThings,
        DatasetKind::SintelFinal,
        DatasetKind::SintelClean,
        DatasetKind::Kitti,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DatasetKind::FlyingChairs => "FlyingChairs",
            DatasetKind::FlyingThings => "FlyingThings",
            DatasetKind::SintelFinal => "SintelFinal",
            DatasetKind::SintelClean => "SintelClean",
            DatasetKind::Kitti => "KITTI",
        }
    }

    /// Indexes the dataset stored under `root`.
    pub fn open(self, root: &Path, split: Split) -> Result<Arc<dyn FlowDataset>> {
        if root.as_os_str().is_empty() {
            bail!("dataset_dir must be set for {}", self.name());
        }
        let dataset = match self {
            DatasetKind::FlyingChairs => sources::flying_chairs(root, split)?,
            DatasetKind::FlyingThings => sources::flying_things(root, split)?,
            DatasetKind::SintelFinal => sources::sintel(root, SintelPass::Final, split)?,
            DatasetKind::SintelClean => sources::sintel(root, SintelPass::Clean, split)?,
            DatasetKind::Kitti => sources::kitti(root, split)?,
        };
        log::info!(
            "{} {:?} split: {} samples under {:?}",
            self.name(),
            split,
            dataset.len(),
            root
        );
        Ok(Arc::new(dataset))
    }
}

impl FromStr for DatasetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        DatasetKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = DatasetKind::ALL.iter().map(|k| k.name()).collect();
                anyhow!("unknown dataset '{}', expected one of {}", s, names.join(", "))
            })
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
