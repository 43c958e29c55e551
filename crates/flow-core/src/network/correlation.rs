use tch::{Kind, Tensor};

/// Cost volume between two `[B, C, H, W]` feature maps.
///
/// Channel `(dy + d) * (2d + 1) + (dx + d)` of the output holds the
/// channel-averaged product of `f1` with `f2` shifted by `(dx, dy)`, for
/// `dx, dy` in `[-d, d]`. Positions shifted outside `f2` match against zeros.
pub fn cost_volume(f1: &Tensor, f2: &Tensor, search_range: i64) -> Tensor {
    let size = f2.size();
    let (b, c, h, w) = (size[0], size[1], size[2], size[3]);
    let d = search_range;

    let padded = Tensor::zeros([b, c, h + 2 * d, w + 2 * d], (f2.kind(), f2.device()));
    let _ = padded.narrow(2, d, h).narrow(3, d, w).copy_(f2);

    let side = 2 * d + 1;
    let mut costs = Vec::with_capacity((side * side) as usize);
    for dy in 0..side {
        for dx in 0..side {
            let shifted = padded.narrow(2, dy, h).narrow(3, dx, w);
            costs.push((f1 * shifted).mean_dim(Some(&[1i64][..]), true, Kind::Float));
        }
    }
    Tensor::cat(&costs, 1)
}

pub fn num_channels(search_range: i64) -> i64 {
    (2 * search_range + 1) * (2 * search_range + 1)
}
