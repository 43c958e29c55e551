use tch::Tensor;

/// Builds the ground-truth pyramid for a `[B, 2, H, W]` flow batch.
///
/// Each level is a 2x2 average pool of the one below it. The result is ordered
/// coarsest first, so `levels[0]` is `H / 2^num_levels` and the finest entry is
/// `H / 2`. The full-resolution field itself is not part of the pyramid.
/// Odd remainders are truncated, never padded.
pub fn build_flow_pyramid(flow: &Tensor, num_levels: usize) -> Vec<Tensor> {
    let mut pyramid = Vec::with_capacity(num_levels);
    let mut x = flow.shallow_clone();
    for _ in 0..num_levels {
        x = x.avg_pool2d([2, 2], [2, 2], [0, 0], false, true, None::<i64>);
        pyramid.insert(0, x.shallow_clone());
    }
    pyramid
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn depth_and_shapes_coarsest_first() {
        let flow = Tensor::rand([2, 2, 48, 40], (Kind::Float, Device::Cpu));
        let pyramid = build_flow_pyramid(&flow, 3);
        assert_eq!(pyramid.len(), 3);
        assert_eq!(pyramid[0].size(), vec![2, 2, 6, 5]);
        assert_eq!(pyramid[1].size(), vec![2, 2, 12, 10]);
        assert_eq!(pyramid[2].size(), vec![2, 2, 24, 20]);
    }

    #[test]
    fn truncates_indivisible_dimensions() {
        let flow = Tensor::zeros([1, 2, 13, 9], (Kind::Float, Device::Cpu));
        let pyramid = build_flow_pyramid(&flow, 2);
        assert_eq!(pyramid[0].size(), vec![1, 2, 3, 2]);
        assert_eq!(pyramid[1].size(), vec![1, 2, 6, 4]);
    }

    #[test]
    fn four_by_four_into_two_levels() {
        let dx: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let dy: Vec<f32> = (0..16).map(|v| -2.0 * v as f32).collect();
        let data: Vec<f32> = dx.iter().chain(dy.iter()).copied().collect();
        let flow = Tensor::from_slice(&data).view([1, 2, 4, 4]);

        let pyramid = build_flow_pyramid(&flow, 2);
        assert_eq!(pyramid[0].size(), vec![1, 2, 1, 1]);
        assert_eq!(pyramid[1].size(), vec![1, 2, 2, 2]);

        // Top-left 2x2 block of dx is {0, 1, 4, 5}.
        let fine = &pyramid[1];
        assert!((fine.double_value(&[0, 0, 0, 0]) - 2.5).abs() < 1e-6);
        assert!((fine.double_value(&[0, 0, 0, 1]) - 4.5).abs() < 1e-6);
        assert!((fine.double_value(&[0, 0, 1, 0]) - 10.5).abs() < 1e-6);
        assert!((fine.double_value(&[0, 0, 1, 1]) - 12.5).abs() < 1e-6);
        assert!((fine.double_value(&[0, 1, 0, 0]) + 5.0).abs() < 1e-6);

        // The coarsest cell is the mean of the whole 4x4 field.
        let coarse = &pyramid[0];
        assert!((coarse.double_value(&[0, 0, 0, 0]) - 7.5).abs() < 1e-6);
        assert!((coarse.double_value(&[0, 1, 0, 0]) + 15.0).abs() < 1e-6);
    }
}
