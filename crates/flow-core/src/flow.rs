use tch::{Device, Kind, Tensor};

use crate::error::{FlowError, Result};

/// Dense 2-channel displacement field stored row-major with interleaved `(dx, dy)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl FlowField {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height * 2 {
            return Err(FlowError::InvalidFlowFile(format!(
                "{} values do not fill a {}x{}x2 field",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self { width, height, data })
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height * 2],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, x: usize, y: usize) -> (f32, f32) {
        let i = (y * self.width + x) * 2;
        (self.data[i], self.data[i + 1])
    }

    pub fn set(&mut self, x: usize, y: usize, (dx, dy): (f32, f32)) {
        let i = (y * self.width + x) * 2;
        self.data[i] = dx;
        self.data[i + 1] = dy;
    }

    /// Copies out the `height x width` window whose top-left corner is `(top, left)`.
    pub fn crop(&self, top: usize, left: usize, height: usize, width: usize) -> Result<Self> {
        if top + height > self.height || left + width > self.width {
            return Err(FlowError::Config(format!(
                "crop {}x{} at ({}, {}) exceeds {}x{} flow",
                height, width, top, left, self.height, self.width
            )));
        }
        let mut data = Vec::with_capacity(width * height * 2);
        for y in top..top + height {
            let start = (y * self.width + left) * 2;
            data.extend_from_slice(&self.data[start..start + width * 2]);
        }
        Ok(Self { width, height, data })
    }

    /// Bilinear resize with pixel-centre alignment. Displacements are rescaled
    /// along each axis so they stay in pixels of the new grid.
    pub fn resize(&self, height: usize, width: usize) -> Self {
        if height == self.height && width == self.width {
            return self.clone();
        }
        let sy = self.height as f32 / height as f32;
        let sx = self.width as f32 / width as f32;
        let mut out = Self::zeros(width, height);
        if self.width == 0 || self.height == 0 {
            return out;
        }
        for y in 0..height {
            let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (self.height - 1) as f32);
            let y0 = fy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let wy = fy - y0 as f32;
            for x in 0..width {
                let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (self.width - 1) as f32);
                let x0 = fx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let wx = fx - x0 as f32;

                let lerp = |a: (f32, f32), b: (f32, f32), t: f32| {
                    (a.0 + (b.0 - a.0) * t, a.1 + (b.1 - a.1) * t)
                };
                let top = lerp(self.get(x0, y0), self.get(x1, y0), wx);
                let bottom = lerp(self.get(x0, y1), self.get(x1, y1), wx);
                let (dx, dy) = lerp(top, bottom, wy);
                out.set(x, y, (dx / sx, dy / sy));
            }
        }
        out
    }

    /// Channel-first `[2, H, W]` float tensor on the CPU.
    pub fn to_tensor(&self) -> Tensor {
        let (h, w) = (self.height as i64, self.width as i64);
        Tensor::from_slice(&self.data)
            .view([h, w, 2])
            .permute([2, 0, 1])
            .contiguous()
    }

    /// Accepts `[2, H, W]` or a single-sample `[1, 2, H, W]` tensor.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let t = match tensor.dim() {
            4 if tensor.size()[0] == 1 => tensor.squeeze_dim(0),
            3 => tensor.shallow_clone(),
            _ => {
                return Err(FlowError::InvalidFlowFile(format!(
                    "expected a [2, H, W] flow tensor, got {:?}",
                    tensor.size()
                )))
            }
        };
        let size = t.size();
        if size[0] != 2 {
            return Err(FlowError::InvalidFlowFile(format!(
                "flow tensor has {} channels, expected 2",
                size[0]
            )));
        }
        let (h, w) = (size[1] as usize, size[2] as usize);
        let flat = t
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .permute([1, 2, 0])
            .contiguous()
            .view([-1]);
        let data = Vec::<f32>::try_from(&flat)?;
        Self::new(w, h, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: usize, height: usize) -> FlowField {
        let data = (0..width * height * 2).map(|v| v as f32 * 0.5).collect();
        FlowField::new(width, height, data).unwrap()
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(FlowField::new(3, 2, vec![0.0; 11]).is_err());
    }

    #[test]
    fn crop_takes_window() {
        let flow = ramp(5, 4);
        let crop = flow.crop(1, 2, 2, 3).unwrap();
        assert_eq!((crop.width(), crop.height()), (3, 2));
        assert_eq!(crop.get(0, 0), flow.get(2, 1));
        assert_eq!(crop.get(2, 1), flow.get(4, 2));
        assert!(flow.crop(3, 0, 2, 2).is_err());
    }

    #[test]
    fn resize_rescales_displacements() {
        let mut flow = FlowField::zeros(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                flow.set(x, y, (2.0, -1.0));
            }
        }
        let small = flow.resize(2, 2);
        assert_eq!(small.get(1, 1), (1.0, -0.5));
        let wide = flow.resize(4, 8);
        assert_eq!(wide.get(7, 3), (4.0, -1.0));
    }

    #[test]
    fn tensor_layout_round_trip() {
        let flow = ramp(3, 2);
        let t = flow.to_tensor();
        assert_eq!(t.size(), vec![2, 2, 3]);
        // dx at (x=1, y=0) is element 2 of the interleaved buffer.
        assert_eq!(t.double_value(&[0, 0, 1]), 1.0);
        assert_eq!(t.double_value(&[1, 0, 1]), 1.5);
        assert_eq!(FlowField::from_tensor(&t.unsqueeze(0)).unwrap(), flow);
    }
}
