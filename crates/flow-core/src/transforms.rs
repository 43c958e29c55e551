//! Pixel-level pre-processing shared by the training loader and inference.
//! Both paths go through these functions so that a model sees identically
//! prepared frames at deployment time.

use image::{imageops, imageops::FilterType, RgbImage};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{FlowError, Result};

pub const CHANNEL_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f64; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Resize {
    /// Absolute `[height, width]`.
    Shape([usize; 2]),
    /// Uniform factor applied to both axes.
    Scale(f64),
}

impl Resize {
    /// An absolute shape and a scale factor are mutually exclusive.
    pub fn from_options(shape: Option<[usize; 2]>, scale: Option<f64>) -> Result<Option<Self>> {
        match (shape, scale) {
            (Some(_), Some(_)) => Err(FlowError::Config(
                "resize_shape and resize_scale cannot both be set".into(),
            )),
            (Some([h, w]), None) if h == 0 || w == 0 => Err(FlowError::Config(format!(
                "resize_shape must be positive, got {}x{}",
                h, w
            ))),
            (Some(shape), None) => Ok(Some(Resize::Shape(shape))),
            (None, Some(s)) if !(s > 0.0) => Err(FlowError::Config(format!(
                "resize_scale must be positive, got {}",
                s
            ))),
            (None, Some(s)) => Ok(Some(Resize::Scale(s))),
            (None, None) => Ok(None),
        }
    }

    /// Output `(height, width)` for an input of `(height, width)`.
    pub fn target(&self, height: usize, width: usize) -> (usize, usize) {
        match *self {
            Resize::Shape([h, w]) => (h, w),
            Resize::Scale(s) => (
                ((height as f64 * s).round() as usize).max(1),
                ((width as f64 * s).round() as usize).max(1),
            ),
        }
    }
}

/// Top-left corner `(top, left)` of a centred `[height, width]` crop.
pub fn center_crop_offset(height: usize, width: usize, crop: [usize; 2]) -> Result<(usize, usize)> {
    let [th, tw] = crop;
    if th > height || tw > width {
        return Err(FlowError::Config(format!(
            "crop {}x{} is larger than the {}x{} input",
            th, tw, height, width
        )));
    }
    Ok(((height - th) / 2, (width - tw) / 2))
}

pub fn crop_frame(img: &RgbImage, top: usize, left: usize, height: usize, width: usize) -> RgbImage {
    imageops::crop_imm(img, left as u32, top as u32, width as u32, height as u32).to_image()
}

pub fn resize_frame(img: &RgbImage, height: usize, width: usize) -> RgbImage {
    if img.dimensions() == (width as u32, height as u32) {
        return img.clone();
    }
    imageops::resize(img, width as u32, height as u32, FilterType::Triangle)
}

/// Deterministic pre-processing for a frame pair: optional centre crop, then optional resize.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preprocess {
    pub crop_shape: Option<[usize; 2]>,
    pub resize: Option<Resize>,
}

impl Preprocess {
    pub fn new(
        crop_shape: Option<[usize; 2]>,
        resize_shape: Option<[usize; 2]>,
        resize_scale: Option<f64>,
    ) -> Result<Self> {
        Ok(Self {
            crop_shape,
            resize: Resize::from_options(resize_shape, resize_scale)?,
        })
    }

    pub fn apply_pair(&self, src: &RgbImage, tgt: &RgbImage) -> Result<(RgbImage, RgbImage)> {
        if src.dimensions() != tgt.dimensions() {
            return Err(FlowError::Config(format!(
                "frame sizes differ: {:?} vs {:?}",
                src.dimensions(),
                tgt.dimensions()
            )));
        }
        let (mut src, mut tgt) = (src.clone(), tgt.clone());
        if let Some(crop) = self.crop_shape {
            let (top, left) = center_crop_offset(src.height() as usize, src.width() as usize, crop)?;
            src = crop_frame(&src, top, left, crop[0], crop[1]);
            tgt = crop_frame(&tgt, top, left, crop[0], crop[1]);
        }
        if let Some(resize) = self.resize {
            let (h, w) = resize.target(src.height() as usize, src.width() as usize);
            src = resize_frame(&src, h, w);
            tgt = resize_frame(&tgt, h, w);
        }
        Ok((src, tgt))
    }
}

/// `[3, H, W]` float tensor with values in `[0, 1]`.
pub fn frame_to_tensor(img: &RgbImage) -> Tensor {
    let (w, h) = img.dimensions();
    Tensor::from_slice(img.as_raw())
        .view([h as i64, w as i64, 3])
        .permute([2, 0, 1])
        .to_kind(Kind::Float)
        / 255.0
}

/// Inverse of [`frame_to_tensor`]; values are clamped into `[0, 1]` first.
pub fn frame_from_tensor(tensor: &Tensor) -> Result<RgbImage> {
    let size = tensor.size();
    if size.len() != 3 || size[0] != 3 {
        return Err(FlowError::Config(format!(
            "expected a [3, H, W] frame tensor, got {:?}",
            size
        )));
    }
    let (h, w) = (size[1], size[2]);
    let flat = (tensor.detach().to_device(Device::Cpu).clamp(0.0, 1.0) * 255.0)
        .round()
        .to_kind(Kind::Uint8)
        .permute([1, 2, 0])
        .contiguous()
        .view([-1]);
    let raw = Vec::<u8>::try_from(&flat)?;
    RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| FlowError::Config("frame buffer does not match its dimensions".into()))
}

/// Per-channel `(x - mean) / std` on a `[B, 3, H, W]` batch, channels taken as R, G, B.
pub fn normalize_frames(frames: &Tensor) -> Tensor {
    let stats = |values: &[f64; 3]| {
        Tensor::from_slice(&values[..])
            .view([1, 3, 1, 1])
            .to_kind(frames.kind())
            .to_device(frames.device())
    };
    (frames - stats(&CHANNEL_MEAN)) / stats(&CHANNEL_STD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, (x + y) as u8]))
    }

    #[test]
    fn center_crop_offset_is_integer_halves() {
        assert_eq!(center_crop_offset(436, 1024, [384, 448]).unwrap(), (26, 288));
        assert_eq!(center_crop_offset(7, 9, [4, 4]).unwrap(), (1, 2));
        assert!(center_crop_offset(4, 4, [5, 4]).is_err());
    }

    #[test]
    fn center_crop_is_deterministic_and_shared_by_the_pair() {
        let src = gradient(20, 15);
        let tgt = gradient(20, 15);
        let pre = Preprocess::new(Some([8, 10]), None, None).unwrap();
        let (a1, b1) = pre.apply_pair(&src, &tgt).unwrap();
        let (a2, _) = pre.apply_pair(&src, &tgt).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(a1, b1);
        assert_eq!(a1.dimensions(), (10, 8));
        // (15 - 8) / 2 = 3 rows, (20 - 10) / 2 = 5 columns.
        assert_eq!(*a1.get_pixel(0, 0), Rgb([5, 3, 8]));
    }

    #[test]
    fn resize_shape_and_scale_are_exclusive() {
        assert!(matches!(
            Preprocess::new(None, Some([4, 4]), Some(0.5)),
            Err(FlowError::Config(_))
        ));
        assert!(Resize::from_options(None, Some(0.0)).is_err());
    }

    #[test]
    fn resize_targets() {
        assert_eq!(Resize::Shape([32, 48]).target(100, 200), (32, 48));
        assert_eq!(Resize::Scale(0.5).target(101, 200), (51, 100));
    }

    #[test]
    fn crop_then_scale() {
        let pre = Preprocess::new(Some([8, 8]), None, Some(0.5)).unwrap();
        let (src, tgt) = pre.apply_pair(&gradient(16, 12), &gradient(16, 12)).unwrap();
        assert_eq!(src.dimensions(), (4, 4));
        assert_eq!(tgt.dimensions(), (4, 4));
    }

    #[test]
    fn mismatched_pair_is_rejected() {
        let pre = Preprocess::default();
        assert!(pre.apply_pair(&gradient(4, 4), &gradient(5, 4)).is_err());
    }

    #[test]
    fn frame_tensor_round_trip() {
        let img = gradient(6, 5);
        let t = frame_to_tensor(&img);
        assert_eq!(t.size(), vec![3, 5, 6]);
        assert!((t.double_value(&[0, 0, 3]) - 3.0 / 255.0).abs() < 1e-6);
        assert_eq!(frame_from_tensor(&t).unwrap(), img);
    }

    #[test]
    fn normalization_uses_each_channel() {
        let values = [0.1f64, 0.5, 0.9];
        let frames = Tensor::from_slice(&values)
            .to_kind(Kind::Float)
            .view([1, 3, 1, 1])
            .repeat([1, 1, 2, 2]);
        let out = normalize_frames(&frames);
        for c in 0..3 {
            let expected = (values[c] - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
            for (y, x) in [(0, 0), (1, 1)] {
                let got = out.double_value(&[0, c as i64, y, x]);
                assert!((got - expected).abs() < 1e-5, "channel {}: {} vs {}", c, got, expected);
            }
        }
    }
}
