//! On-disk layouts of the supported optical-flow datasets.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flow_core::{flow_io, FlowField};

use crate::dataset::{FlowDataset, Sample, Split};

/// Datasets without an official split hold out every tenth pair for testing.
const HOLDOUT_EVERY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SintelPass {
    Clean,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFormat {
    /// Middlebury `.flo`.
    Flo,
    /// Portable float map (FlyingThings3D).
    Pfm,
    /// 16-bit PNG with validity in the blue channel (KITTI).
    KittiPng,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairPaths {
    pub src: PathBuf,
    pub tgt: PathBuf,
    pub flow: PathBuf,
}

/// A list of frame-pair/flow files sharing one flow encoding.
#[derive(Debug, Clone)]
pub struct FileDataset {
    pairs: Vec<PairPaths>,
    format: FlowFormat,
}

impl FileDataset {
    pub fn new(pairs: Vec<PairPaths>, format: FlowFormat) -> Self {
        Self { pairs, format }
    }

    pub fn pairs(&self) -> &[PairPaths] {
        &self.pairs
    }
}

impl FlowDataset for FileDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let paths = self
            .pairs
            .get(index)
            .with_context(|| format!("sample {} out of range", index))?;
        let src = image::open(&paths.src)
            .with_context(|| format!("Failed to read {:?}", paths.src))?
            .to_rgb8();
        let tgt = image::open(&paths.tgt)
            .with_context(|| format!("Failed to read {:?}", paths.tgt))?
            .to_rgb8();
        let flow = match self.format {
            FlowFormat::Flo => flow_io::read_flo(&paths.flow)?,
            FlowFormat::Pfm => read_pfm_flow(&paths.flow)?,
            FlowFormat::KittiPng => read_kitti_flow(&paths.flow)?,
        };
        let sample = Sample { src, tgt, flow };
        sample
            .validate()
            .with_context(|| format!("inconsistent sample {:?}", paths.src))?;
        Ok(sample)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {:?}", dir))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

fn holdout<T>(items: Vec<T>, split: Split) -> Vec<T> {
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| (i % HOLDOUT_EVERY == 0) == (split == Split::Test))
        .map(|(_, item)| item)
        .collect()
}

/// `<root>/data/NNNNN_img1.ppm`, `NNNNN_img2.ppm`, `NNNNN_flow.flo`, split by
/// `<root>/FlyingChairs_train_val.txt` (1 = train, 2 = validation) when present.
pub fn flying_chairs(root: &Path, split: Split) -> Result<FileDataset> {
    let data = root.join("data");
    let mut pairs = Vec::new();
    for path in sorted_entries(&data)? {
        let name = file_name(&path);
        if let Some(prefix) = name.strip_suffix("_img1.ppm") {
            pairs.push(PairPaths {
                src: path.clone(),
                tgt: data.join(format!("{}_img2.ppm", prefix)),
                flow: data.join(format!("{}_flow.flo", prefix)),
            });
        }
    }

    let split_file = root.join("FlyingChairs_train_val.txt");
    let pairs = if split_file.exists() {
        let content = fs::read_to_string(&split_file)
            .with_context(|| format!("Failed to read {:?}", split_file))?;
        let labels: Vec<&str> = content.split_whitespace().collect();
        if labels.len() != pairs.len() {
            bail!(
                "{:?} lists {} samples but {} were found",
                split_file,
                labels.len(),
                pairs.len()
            );
        }
        let wanted = if split == Split::Train { "1" } else { "2" };
        pairs
            .into_iter()
            .zip(labels)
            .filter(|(_, label)| *label == wanted)
            .map(|(pair, _)| pair)
            .collect()
    } else {
        holdout(pairs, split)
    };
    Ok(FileDataset::new(pairs, FlowFormat::Flo))
}

/// `<root>/training/<pass>/<scene>/frame_NNNN.png` with flow in
/// `<root>/training/flow/<scene>/frame_NNNN.flo`, named after the first frame.
pub fn sintel(root: &Path, pass: SintelPass, split: Split) -> Result<FileDataset> {
    let pass_dir = root.join("training").join(match pass {
        SintelPass::Clean => "clean",
        SintelPass::Final => "final",
    });
    let flow_dir = root.join("training").join("flow");

    let mut pairs = Vec::new();
    for scene in sorted_entries(&pass_dir)? {
        if !scene.is_dir() {
            continue;
        }
        let frames: Vec<PathBuf> = sorted_entries(&scene)?
            .into_iter()
            .filter(|p| file_name(p).ends_with(".png"))
            .collect();
        for window in frames.windows(2) {
            let stem = window[0].file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            pairs.push(PairPaths {
                src: window[0].clone(),
                tgt: window[1].clone(),
                flow: flow_dir.join(file_name(&scene)).join(format!("{}.flo", stem)),
            });
        }
    }
    Ok(FileDataset::new(holdout(pairs, split), FlowFormat::Flo))
}

/// KITTI 2015: `<root>/training/image_2/NNNNNN_10.png` and `_11.png`, flow in
/// `<root>/training/flow_occ/NNNNNN_10.png`.
pub fn kitti(root: &Path, split: Split) -> Result<FileDataset> {
    let training = root.join("training");
    let images = training.join("image_2");
    let mut pairs = Vec::new();
    for flow in sorted_entries(&training.join("flow_occ"))? {
        if let Some(id) = file_name(&flow).strip_suffix("_10.png") {
            pairs.push(PairPaths {
                src: images.join(format!("{}_10.png", id)),
                tgt: images.join(format!("{}_11.png", id)),
                flow: flow.clone(),
            });
        }
    }
    Ok(FileDataset::new(holdout(pairs, split), FlowFormat::KittiPng))
}

/// FlyingThings3D clean pass, left camera, forward flow. TRAIN and TEST are the
/// dataset's own directories.
pub fn flying_things(root: &Path, split: Split) -> Result<FileDataset> {
    let part = if split == Split::Train { "TRAIN" } else { "TEST" };
    let frames_root = root.join("frames_cleanpass").join(part);
    let flow_root = root.join("optical_flow").join(part);

    let mut pairs = Vec::new();
    for letter in sorted_entries(&frames_root)? {
        if !letter.is_dir() {
            continue;
        }
        for sequence in sorted_entries(&letter)? {
            let left = sequence.join("left");
            if !left.is_dir() {
                continue;
            }
            let flow_dir = flow_root
                .join(file_name(&letter))
                .join(file_name(&sequence))
                .join("into_future")
                .join("left");
            let frames: Vec<PathBuf> = sorted_entries(&left)?
                .into_iter()
                .filter(|p| file_name(p).ends_with(".png"))
                .collect();
            for window in frames.windows(2) {
                let stem = window[0].file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                pairs.push(PairPaths {
                    src: window[0].clone(),
                    tgt: window[1].clone(),
                    flow: flow_dir.join(format!("OpticalFlowIntoFuture_{}_L.pfm", stem)),
                });
            }
        }
    }
    Ok(FileDataset::new(pairs, FlowFormat::Pfm))
}

/// Reads the first two channels of a PFM file as flow. Rows are stored bottom-up;
/// a negative scale marks little-endian data.
pub fn read_pfm_flow(path: &Path) -> Result<FlowField> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;

    let mut pos = 0;
    let mut tokens = Vec::with_capacity(4);
    while tokens.len() < 4 {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if start == pos {
            bail!("truncated PFM header in {:?}", path);
        }
        tokens.push(std::str::from_utf8(&bytes[start..pos])?.to_owned());
    }
    // Exactly one whitespace byte separates the header from the payload.
    pos += 1;

    let channels = match tokens[0].as_str() {
        "PF" => 3,
        "Pf" => bail!("{:?} is a single-channel PFM, flow needs two", path),
        other => bail!("{:?} is not a PFM file (magic '{}')", path, other),
    };
    let width: usize = tokens[1].parse().context("bad PFM width")?;
    let height: usize = tokens[2].parse().context("bad PFM height")?;
    let scale: f32 = tokens[3].parse().context("bad PFM scale")?;
    let little_endian = scale < 0.0;

    let values = width
        .checked_mul(height)
        .filter(|&p| p > 0 && p <= flow_io::MAX_FLO_PIXELS)
        .map(|p| p * channels)
        .with_context(|| format!("{:?} declares an impossible {}x{} PFM", path, width, height))?;
    let payload = bytes.get(pos..).unwrap_or_default();
    if payload.len() / 4 < values {
        bail!(
            "{:?} holds {} payload bytes, {}x{}x{} floats need more",
            path,
            payload.len(),
            width,
            height,
            channels
        );
    }

    let mut floats = vec![0f32; values];
    if little_endian {
        LittleEndian::read_f32_into(&payload[..values * 4], &mut floats);
    } else {
        BigEndian::read_f32_into(&payload[..values * 4], &mut floats);
    }
    let mut flow = FlowField::zeros(width, height);
    for (row, line) in floats.chunks_exact(width * channels).enumerate() {
        let y = height - 1 - row;
        for (x, px) in line.chunks_exact(channels).enumerate() {
            flow.set(x, y, (px[0], px[1]));
        }
    }
    Ok(flow)
}

/// KITTI flow PNG: `(value - 2^15) / 64` in R and G, validity in B.
/// Invalid pixels come back as zero flow.
pub fn read_kitti_flow(path: &Path) -> Result<FlowField> {
    let png = image::open(path)
        .with_context(|| format!("Failed to read {:?}", path))?
        .into_rgb16();
    let (w, h) = png.dimensions();
    let mut flow = FlowField::zeros(w as usize, h as usize);
    for (x, y, pixel) in png.enumerate_pixels() {
        let [u, v, valid] = pixel.0;
        if valid > 0 {
            let decode = |raw: u16| (raw as f32 - 32768.0) / 64.0;
            flow.set(x as usize, y as usize, (decode(u), decode(v)));
        }
    }
    Ok(flow)
}
