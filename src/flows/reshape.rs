use burn::{
    config::Config,
    module::{Ignored, Module},
    tensor::{Int, Tensor, TensorData, backend::Backend},
};

use super::Transform;
use crate::error::{FlowError, raise};

fn check_divisible(context: &'static str, dims: [usize; 4], dim: usize, factor: usize) {
    if dims[dim] % factor != 0 {
        raise(Err(FlowError::NotDivisible {
            context,
            dim,
            size: dims[dim],
            factor,
        }));
    }
}

// --- SQUEEZE ---

/// Folds every 2x2 spatial block into the channel axis:
/// `(C, H, W) -> (4C, H/2, W/2)`.
#[derive(Module, Clone, Debug, Default)]
pub struct Squeeze;

impl Squeeze {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> Transform<B, 4> for Squeeze {
    fn forward_and_log_det(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let dims = x.dims();
        check_divisible("squeeze", dims, 2, 2);
        check_divisible("squeeze", dims, 3, 2);
        let [b, c, h, w] = dims;
        let y = x
            .reshape([b, c, h / 2, 2, w / 2, 2])
            .permute([0, 1, 3, 5, 2, 4])
            .reshape([b, 4 * c, h / 2, w / 2]);
        let log_det = Tensor::zeros([b], &y.device());
        (y, log_det)
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let dims = y.dims();
        check_divisible("unsqueeze", dims, 1, 4);
        let [b, c, h, w] = dims;
        let x = y
            .reshape([b, c / 4, 2, 2, h, w])
            .permute([0, 1, 4, 2, 5, 3])
            .reshape([b, c / 4, 2 * h, 2 * w]);
        let log_det = Tensor::zeros([b], &x.device());
        (x, log_det)
    }
}

// --- SPLIT / MERGE ---

/// How an image tensor is partitioned into a pass-through part `z1` and a
/// second part `z2`.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// `z1` takes the first `ceil(C/2)` channels.
    Channel,
    /// `z2` takes the first `ceil(C/2)` channels, `z1` the rest.
    ChannelInv,
    /// `z1` takes the positions with odd `c + h + w`.
    Checkerboard,
    /// `z1` takes the positions with even `c + h + w`.
    CheckerboardInv,
}

/// Partitions `(B, C, H, W)` into two tensors. Zero log-det.
#[derive(Module, Clone, Debug)]
pub struct Split {
    mode: Ignored<SplitMode>,
}

impl Split {
    pub fn new(mode: SplitMode) -> Self {
        Self { mode: Ignored(mode) }
    }

    pub fn mode(&self) -> &SplitMode {
        &self.mode.0
    }

    /// The [`Merge`] that undoes this split.
    pub fn merge(&self) -> Merge {
        Merge { split: self.clone() }
    }

    /// Channel counts of `(z1, z2)` for an input with `channels` channels.
    /// Checkerboard parts keep every channel at half the width.
    pub fn channels(&self, channels: usize) -> (usize, usize) {
        let first = channels.div_ceil(2);
        match self.mode.0 {
            SplitMode::Channel => (first, channels - first),
            SplitMode::ChannelInv => (channels - first, first),
            SplitMode::Checkerboard | SplitMode::CheckerboardInv => (channels, channels),
        }
    }

    /// Flat indices of the `z1` positions, then the `z2` positions.
    fn checkerboard_indices(&self, c: usize, h: usize, w: usize) -> (Vec<i64>, Vec<i64>) {
        let z1_parity = match self.mode.0 {
            SplitMode::Checkerboard => 1,
            _ => 0,
        };
        let mut z1 = Vec::with_capacity(c * h * w / 2);
        let mut z2 = Vec::with_capacity(c * h * w / 2);
        for ci in 0..c {
            for hi in 0..h {
                for wi in 0..w {
                    let flat = ((ci * h + hi) * w + wi) as i64;
                    if (ci + hi + wi) % 2 == z1_parity {
                        z1.push(flat);
                    } else {
                        z2.push(flat);
                    }
                }
            }
        }
        (z1, z2)
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let dims = x.dims();
        let [b, c, h, w] = dims;
        match self.mode.0 {
            SplitMode::Channel | SplitMode::ChannelInv => {
                let first = c.div_ceil(2);
                let head = x.clone().narrow(1, 0, first);
                let tail = x.narrow(1, first, c - first);
                if self.mode.0 == SplitMode::Channel {
                    (head, tail)
                } else {
                    (tail, head)
                }
            }
            SplitMode::Checkerboard | SplitMode::CheckerboardInv => {
                check_divisible("checkerboard split", dims, 3, 2);
                let device = x.device();
                let (z1_idx, z2_idx) = self.checkerboard_indices(c, h, w);
                let half = z1_idx.len();
                let flat = x.reshape([b, c * h * w]);
                let gather = |idx: Vec<i64>| {
                    Tensor::<B, 1, Int>::from_data(TensorData::new(idx, [half]), &device)
                };
                let z1 = flat.clone().select(1, gather(z1_idx));
                let z2 = flat.select(1, gather(z2_idx));
                (z1.reshape([b, c, h, w / 2]), z2.reshape([b, c, h, w / 2]))
            }
        }
    }

    /// Panics unless `z1` and `z2` could have come out of [`Split::forward`].
    fn check_parts(&self, z1: [usize; 4], z2: [usize; 4]) {
        let fits = match self.mode.0 {
            SplitMode::Channel => z1[1] >= z2[1] && z1[1] - z2[1] <= 1,
            SplitMode::ChannelInv => z2[1] >= z1[1] && z2[1] - z1[1] <= 1,
            SplitMode::Checkerboard | SplitMode::CheckerboardInv => z1[1] == z2[1],
        };
        if !fits || z1[0] != z2[0] || z1[2..] != z2[2..] {
            raise(Err(FlowError::ShapeMismatch {
                context: "merge",
                expected: z1.to_vec(),
                actual: z2.to_vec(),
            }));
        }
    }

    pub fn inverse<B: Backend>(&self, z1: Tensor<B, 4>, z2: Tensor<B, 4>) -> Tensor<B, 4> {
        self.check_parts(z1.dims(), z2.dims());
        match self.mode.0 {
            SplitMode::Channel => Tensor::cat(vec![z1, z2], 1),
            SplitMode::ChannelInv => Tensor::cat(vec![z2, z1], 1),
            SplitMode::Checkerboard | SplitMode::CheckerboardInv => {
                let [b, c, h, half_w] = z1.dims();
                let w = 2 * half_w;
                let (z1_idx, z2_idx) = self.checkerboard_indices(c, h, w);

                // Position of every flat index within the concatenation [z1, z2].
                let mut order = vec![0i64; c * h * w];
                for (pos, &flat) in z1_idx.iter().chain(&z2_idx).enumerate() {
                    order[flat as usize] = pos as i64;
                }
                let device = z1.device();
                let order = Tensor::<B, 1, Int>::from_data(TensorData::new(order, [c * h * w]), &device);
                let joined = Tensor::cat(
                    vec![z1.reshape([b, c * h * half_w]), z2.reshape([b, c * h * half_w])],
                    1,
                );
                joined.select(1, order).reshape([b, c, h, w])
            }
        }
    }
}

/// Reassembles the two parts of a [`Split`]; `inverse` splits again.
#[derive(Module, Clone, Debug)]
pub struct Merge {
    split: Split,
}

impl Merge {
    pub fn new(mode: SplitMode) -> Self {
        Split::new(mode).merge()
    }

    pub fn mode(&self) -> &SplitMode {
        self.split.mode()
    }

    pub fn forward<B: Backend>(&self, z1: Tensor<B, 4>, z2: Tensor<B, 4>) -> Tensor<B, 4> {
        self.split.inverse(z1, z2)
    }

    pub fn inverse<B: Backend>(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        self.split.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;
    use rstest::*;

    type TestBackend = NdArray<f32>;

    #[fixture]
    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    #[rstest]
    fn squeeze_folds_blocks_into_channels(device: <TestBackend as Backend>::Device) {
        let x = Tensor::<TestBackend, 1, Int>::arange(0..16, &device)
            .float()
            .reshape([1, 1, 4, 4]);
        let y = Squeeze.forward(x.clone());
        assert_eq!(y.dims(), [1, 4, 2, 2]);
        // Channel 0 holds the top-left pixel of every 2x2 block.
        let first = y.clone().narrow(1, 0, 1).into_data().to_vec::<f32>().unwrap();
        assert_eq!(first, vec![0.0, 2.0, 8.0, 10.0]);

        let (x_rec, log_det) = Squeeze.inverse_and_log_det(y);
        x_rec.into_data().assert_eq(&x.into_data(), true);
        assert_eq!(log_det.abs().max().into_scalar(), 0.0);
    }

    #[rstest]
    #[should_panic(expected = "size 5 is not divisible by 2")]
    fn squeeze_rejects_odd_sizes(device: <TestBackend as Backend>::Device) {
        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 5, 4], &device);
        let _ = Squeeze.forward(x);
    }

    #[rstest]
    #[case::channel(SplitMode::Channel, 3, [2, 1])]
    #[case::channel_inv(SplitMode::ChannelInv, 3, [1, 2])]
    #[case::checkerboard(SplitMode::Checkerboard, 3, [3, 3])]
    #[case::checkerboard_inv(SplitMode::CheckerboardInv, 2, [2, 2])]
    fn split_then_merge_restores_input(
        device: <TestBackend as Backend>::Device,
        #[case] mode: SplitMode,
        #[case] channels: usize,
        #[case] expected: [usize; 2],
    ) {
        let split = Split::new(mode);
        let merge = split.merge();
        let x = Tensor::<TestBackend, 4>::random([2, channels, 4, 6], Distribution::Default, &device);

        let (z1, z2) = split.forward(x.clone());
        assert_eq!(z1.dims()[1], expected[0]);
        assert_eq!(z2.dims()[1], expected[1]);
        assert_eq!(split.channels(channels), (expected[0], expected[1]));
        merge.forward(z1, z2).into_data().assert_eq(&x.into_data(), true);
    }

    #[rstest]
    #[case::spatial(SplitMode::Channel, [2, 3, 4, 4], [2, 3, 2, 2])]
    #[case::too_few_channels(SplitMode::Channel, [2, 1, 4, 4], [2, 3, 4, 4])]
    #[case::checkerboard(SplitMode::Checkerboard, [2, 3, 4, 2], [2, 2, 4, 2])]
    #[should_panic(expected = "shape mismatch in merge")]
    fn merge_rejects_parts_of_the_wrong_shape(
        device: <TestBackend as Backend>::Device,
        #[case] mode: SplitMode,
        #[case] first: [usize; 4],
        #[case] second: [usize; 4],
    ) {
        let z1 = Tensor::<TestBackend, 4>::zeros(first, &device);
        let z2 = Tensor::<TestBackend, 4>::zeros(second, &device);
        let _ = Merge::new(mode).forward(z1, z2);
    }

    #[rstest]
    fn checkerboard_alternates_positions(device: <TestBackend as Backend>::Device) {
        let x = Tensor::<TestBackend, 1, Int>::arange(0..8, &device)
            .float()
            .reshape([1, 2, 2, 2]);
        let (z1, z2) = Split::new(SplitMode::Checkerboard).forward(x);
        assert_eq!(z1.into_data().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 4.0, 7.0]);
        assert_eq!(z2.into_data().to_vec::<f32>().unwrap(), vec![0.0, 3.0, 5.0, 6.0]);
    }
}
