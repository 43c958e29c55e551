use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use flow_core::flow_io::write_flo;
use flow_core::flow_vis::flow_to_color;
use flow_core::transforms::{frame_to_tensor, normalize_frames};
use flow_core::{FlowField, FlowModel, Preprocess};
use image::RgbImage;
use tch::{Device, Tensor};

#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub src: PathBuf,
    pub tgt: PathBuf,
    /// Destination `.flo`; the colour-coded image goes next to it as `.png`.
    pub output: PathBuf,
    pub preprocess: Preprocess,
    /// Open the rendered flow in the system image viewer.
    pub show: bool,
}

pub struct Predictor<M> {
    model: M,
    device: Device,
    input_norm: bool,
}

impl<M: FlowModel> Predictor<M> {
    pub fn new(model: M, device: Device, input_norm: bool) -> Self {
        Self {
            model,
            device,
            input_norm,
        }
    }

    fn to_input(&self, frame: &RgbImage) -> Tensor {
        let x = frame_to_tensor(frame).unsqueeze(0).to_device(self.device);
        if self.input_norm {
            normalize_frames(&x)
        } else {
            x
        }
    }

    /// Flow from `src` to `tgt` at the finest predicted level.
    pub fn predict_pair(
        &self,
        src: &RgbImage,
        tgt: &RgbImage,
        preprocess: &Preprocess,
    ) -> Result<FlowField> {
        let (src, tgt) = preprocess.apply_pair(src, tgt)?;
        let (src, tgt) = (self.to_input(&src), self.to_input(&tgt));

        let output = tch::no_grad(|| self.model.forward(&src, &tgt));
        let finest = match output.pyramid.last() {
            Some(level) => level.to_device(Device::Cpu),
            None => bail!("model returned an empty pyramid"),
        };
        Ok(FlowField::from_tensor(&finest)?)
    }

    /// Reads both frames, predicts, and writes the `.flo` and `.png` outputs.
    /// Returns the path of the rendered image.
    pub fn run(&self, options: &PredictOptions) -> Result<PathBuf> {
        let src = open_rgb(&options.src)?;
        let tgt = open_rgb(&options.tgt)?;
        let flow = self.predict_pair(&src, &tgt, &options.preprocess)?;
        tracing::info!(
            "predicted {}x{} flow for {:?} -> {:?}",
            flow.width(),
            flow.height(),
            options.src,
            options.tgt
        );

        write_flo(&options.output, &flow)
            .with_context(|| format!("Failed to write {:?}", options.output))?;
        let image_path = options.output.with_extension("png");
        flow_to_color(&flow)
            .save(&image_path)
            .with_context(|| format!("Failed to write {:?}", image_path))?;
        tracing::info!("wrote {:?} and {:?}", options.output, image_path);

        if options.show {
            show_image(&image_path);
        }
        Ok(image_path)
    }
}

fn open_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("Failed to read {:?}", path))?
        .to_rgb8())
}

fn show_image(path: &Path) {
    let viewer = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    if let Err(e) = Command::new(viewer).arg(path).spawn() {
        tracing::warn!("could not open {:?} with {}: {}", path, viewer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::flow_io::read_flo;
    use flow_core::FlowOutput;
    use image::Rgb;
    use tch::Kind;

    /// Two-level model predicting `(1, -1)` everywhere.
    struct Uniform;

    impl FlowModel for Uniform {
        fn forward(&self, src: &Tensor, _tgt: &Tensor) -> FlowOutput {
            let size = src.size();
            let (b, h, w) = (size[0], size[2], size[3]);
            let level = |f: i64| {
                Tensor::from_slice(&[1.0f32, -1.0])
                    .view([1, 2, 1, 1])
                    .repeat([b, 1, h / f, w / f])
                    .to_kind(Kind::Float)
            };
            FlowOutput {
                flow: level(1),
                pyramid: vec![level(4), level(2)],
            }
        }
    }

    fn frame(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn returns_finest_pyramid_level() {
        let predictor = Predictor::new(Uniform, Device::Cpu, false);
        let flow = predictor
            .predict_pair(&frame(16, 8), &frame(16, 8), &Preprocess::default())
            .unwrap();
        assert_eq!((flow.width(), flow.height()), (8, 4));
        assert_eq!(flow.get(3, 2), (1.0, -1.0));
    }

    #[test]
    fn applies_crop_then_resize() {
        let predictor = Predictor::new(Uniform, Device::Cpu, true);
        let preprocess = Preprocess::new(Some([8, 8]), None, Some(2.0)).unwrap();
        let flow = predictor
            .predict_pair(&frame(20, 12), &frame(20, 12), &preprocess)
            .unwrap();
        assert_eq!((flow.width(), flow.height()), (8, 8));
    }

    #[test]
    fn frame_size_mismatch_is_an_error() {
        let predictor = Predictor::new(Uniform, Device::Cpu, false);
        assert!(predictor
            .predict_pair(&frame(8, 8), &frame(8, 4), &Preprocess::default())
            .is_err());
    }

    #[test]
    fn run_writes_flo_and_png() {
        let dir = tempfile::tempdir().unwrap();
        let (src, tgt) = (dir.path().join("a.png"), dir.path().join("b.png"));
        frame(12, 8).save(&src).unwrap();
        frame(12, 8).save(&tgt).unwrap();

        let options = PredictOptions {
            src,
            tgt,
            output: dir.path().join("out.flo"),
            preprocess: Preprocess::default(),
            show: false,
        };
        let image_path = Predictor::new(Uniform, Device::Cpu, false).run(&options).unwrap();

        assert_eq!(image_path, dir.path().join("out.png"));
        let flow = read_flo(&options.output).unwrap();
        assert_eq!((flow.width(), flow.height()), (6, 4));
        assert_eq!(image::open(&image_path).unwrap().to_rgb8().dimensions(), (6, 4));
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = PredictOptions {
            src: dir.path().join("missing.png"),
            tgt: dir.path().join("missing.png"),
            output: dir.path().join("out.flo"),
            preprocess: Preprocess::default(),
            show: false,
        };
        assert!(Predictor::new(Uniform, Device::Cpu, false).run(&options).is_err());
        assert!(!options.output.exists());
    }
}
