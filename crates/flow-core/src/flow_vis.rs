use image::{imageops, Rgb, RgbImage};

use crate::flow::FlowField;

/// Values above this magnitude are treated as unknown flow.
const UNKNOWN_FLOW: f32 = 1e9;

/// Middlebury colour wheel: red-yellow-green-cyan-blue-magenta segments.
fn color_wheel() -> Vec<[f32; 3]> {
    // (length, channel that changes); even segments ramp it up, odd ones down.
    const SEGMENTS: [(usize, usize); 6] = [
        (15, 1), // RY
        (6, 0),  // YG
        (4, 2),  // GC
        (11, 1), // CB
        (13, 0), // BM
        (6, 2),  // MR
    ];
    let mut wheel = Vec::with_capacity(55);
    let mut base = [1.0f32, 0.0, 0.0];
    for (i, &(len, rising)) in SEGMENTS.iter().enumerate() {
        for step in 0..len {
            let t = step as f32 / len as f32;
            let mut color = base;
            if i % 2 == 0 {
                color[rising] = t;
            } else {
                color[rising] = 1.0 - t;
            }
            wheel.push(color);
        }
        // Land exactly on the next primary/secondary colour.
        if i % 2 == 0 {
            base[rising] = 1.0;
        } else {
            base[rising] = 0.0;
        }
    }
    wheel
}

/// Colour-codes a flow field: hue is direction, saturation is magnitude
/// relative to the largest known displacement in the field.
pub fn flow_to_color(flow: &FlowField) -> RgbImage {
    let wheel = color_wheel();
    let ncols = wheel.len();

    let known = |dx: f32, dy: f32| dx.abs() < UNKNOWN_FLOW && dy.abs() < UNKNOWN_FLOW;
    let mut max_rad = 0.0f32;
    for c in flow.data().chunks_exact(2) {
        if known(c[0], c[1]) {
            max_rad = max_rad.max((c[0] * c[0] + c[1] * c[1]).sqrt());
        }
    }
    let max_rad = max_rad.max(f32::EPSILON);

    let mut img = RgbImage::new(flow.width() as u32, flow.height() as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let (dx, dy) = flow.get(x as usize, y as usize);
        if !known(dx, dy) {
            *pixel = Rgb([0, 0, 0]);
            continue;
        }
        let (u, v) = (dx / max_rad, dy / max_rad);
        let rad = (u * u + v * v).sqrt();
        let angle = (-v).atan2(-u) / std::f32::consts::PI;
        let fk = (angle + 1.0) / 2.0 * (ncols - 1) as f32;
        let k0 = (fk.floor() as usize).min(ncols - 1);
        let k1 = (k0 + 1) % ncols;
        let f = fk - k0 as f32;

        let mut rgb = [0u8; 3];
        for ch in 0..3 {
            let col = (1.0 - f) * wheel[k0][ch] + f * wheel[k1][ch];
            let col = if rad <= 1.0 {
                1.0 - rad * (1.0 - col)
            } else {
                col * 0.75
            };
            rgb[ch] = (255.0 * col).round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(rgb);
    }
    img
}

/// Places `left` and `right` next to each other; the shorter one is top-aligned.
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let height = left.height().max(right.height());
    let mut out = RgbImage::new(left.width() + right.width(), height);
    imageops::replace(&mut out, left, 0, 0);
    imageops::replace(&mut out, right, left.width() as i64, 0);
    out
}
