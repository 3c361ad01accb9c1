use burn::{
    config::Config,
    module::{Module, Param},
    tensor::{Distribution, Int, Tensor, TensorData, backend::Backend},
};
use nalgebra::DMatrix;

use super::Transform;
use crate::error::{FlowError, raise};

fn matrix<B: Backend>(m: &DMatrix<f64>, device: &B::Device) -> Tensor<B, 2> {
    // nalgebra stores columns first, so the transpose reads out row-major
    let values: Vec<f32> = m.transpose().iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(values, [m.nrows(), m.ncols()]), device)
}

fn vector<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 1> {
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n]), device)
}

/// `(I + a)^-1` for strictly triangular `a`, as the finite product
/// `(I - a)(I + a^2)(I + a^4)...` of the Neumann series.
fn unit_triangular_inverse<B: Backend>(a: Tensor<B, 2>, eye: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = a.dims();
    let mut result = eye.clone();
    let mut power = a.neg();
    let mut order = 1;
    while order < n {
        result = result.matmul(eye.clone() + power.clone());
        power = power.clone().matmul(power);
        order *= 2;
    }
    result
}

/// Applies a `(C, C)` matrix to the channel vector at every pixel.
fn mix_channels<B: Backend>(x: Tensor<B, 4>, weight: Tensor<B, 2>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.permute([0, 2, 3, 1])
        .reshape([b * h * w, c])
        .matmul(weight.transpose())
        .reshape([b, h, w, c])
        .permute([0, 3, 1, 2])
}

// --- INVERTIBLE 1x1 CONVOLUTION ---

#[derive(Config, Debug)]
pub struct Invertible1x1ConvConfig {
    pub channels: usize,
}

impl Invertible1x1ConvConfig {
    /// Starts from a random rotation, factored as `P L U`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Invertible1x1Conv<B> {
        let n = self.channels;
        let draw: Vec<f64> = Tensor::<B, 2>::random([n, n], Distribution::Normal(0.0, 1.0), device)
            .into_data()
            .iter::<f64>()
            .collect();
        let rotation = DMatrix::from_vec(n, n, draw).qr().q();

        // `swaps` applied to the rows of the rotation give `L U`
        let (swaps, lower, upper) = rotation.lu().unpack();
        let mut permutation = DMatrix::<f64>::identity(n, n);
        swaps.permute_rows(&mut permutation);

        let diag = upper.diagonal();
        let sign_s = diag.iter().map(|d| d.signum() as f32).collect();
        let log_s = diag.iter().map(|d| d.abs().ln() as f32).collect();
        let lower_mask = DMatrix::from_fn(n, n, |i, j| if j < i { 1.0 } else { 0.0 });
        let upper_mask = lower_mask.transpose();
        tracing::debug!(channels = n, "initialised LU-parameterised 1x1 convolution");

        Invertible1x1Conv {
            permutation: matrix(&permutation.transpose(), device),
            lower: Param::from_tensor(matrix(&lower.component_mul(&lower_mask), device)),
            upper: Param::from_tensor(matrix(&upper.component_mul(&upper_mask), device)),
            log_s: Param::from_tensor(vector(log_s, device)),
            sign_s: vector(sign_s, device),
            lower_mask: matrix(&lower_mask, device),
            upper_mask: matrix(&upper_mask, device),
            eye: matrix(&DMatrix::identity(n, n), device),
        }
    }
}

/// Glow's invertible channel mixing with weight `W = P L (U + diag(sign * exp(log_s)))`.
///
/// `P` and the signs stay fixed; the strictly triangular parts of `L` and `U`
/// and `log_s` are trained. `log|det W| = sum(log_s)`, applied at every pixel.
#[derive(Module, Debug)]
pub struct Invertible1x1Conv<B: Backend> {
    permutation: Tensor<B, 2>,
    lower: Param<Tensor<B, 2>>,
    upper: Param<Tensor<B, 2>>,
    log_s: Param<Tensor<B, 1>>,
    sign_s: Tensor<B, 1>,
    lower_mask: Tensor<B, 2>,
    upper_mask: Tensor<B, 2>,
    eye: Tensor<B, 2>,
}

impl<B: Backend> Invertible1x1Conv<B> {
    pub fn channels(&self) -> usize {
        self.eye.dims()[0]
    }

    fn lower_strict(&self) -> Tensor<B, 2> {
        self.lower.val() * self.lower_mask.clone()
    }

    fn upper_strict(&self) -> Tensor<B, 2> {
        self.upper.val() * self.upper_mask.clone()
    }

    /// The mixing matrix `W`.
    pub fn weight(&self) -> Tensor<B, 2> {
        let l = self.lower_strict() + self.eye.clone();
        let d = self.sign_s.clone() * self.log_s.val().exp();
        let u = self.upper_strict() + self.eye.clone() * d.unsqueeze::<2>();
        self.permutation.clone().matmul(l).matmul(u)
    }

    /// `W^-1 = U^-1 L^-1 P^T`, exact up to rounding.
    pub fn inverse_weight(&self) -> Tensor<B, 2> {
        let n = self.channels();
        let inv_d = self.sign_s.clone() * self.log_s.val().neg().exp();
        let l_inv = unit_triangular_inverse(self.lower_strict(), self.eye.clone());
        // U = D (I + D^-1 M), so U^-1 = (I + D^-1 M)^-1 D^-1.
        let scaled = self.upper_strict() * inv_d.clone().reshape([n, 1]);
        let u_inv = unit_triangular_inverse(scaled, self.eye.clone()) * inv_d.reshape([1, n]);
        u_inv.matmul(l_inv).matmul(self.permutation.clone().transpose())
    }

    fn log_det(&self, dims: [usize; 4]) -> Tensor<B, 1> {
        let [batch, _, h, w] = dims;
        self.log_s
            .val()
            .sum()
            .mul_scalar((h * w) as f64)
            .repeat_dim(0, batch)
    }

    fn check_channels(&self, dims: [usize; 4]) {
        if dims[1] != self.channels() {
            raise(Err(FlowError::ShapeMismatch {
                context: "invertible 1x1 convolution",
                expected: vec![self.channels()],
                actual: vec![dims[1]],
            }));
        }
    }
}

impl<B: Backend> Transform<B, 4> for Invertible1x1Conv<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let dims = x.dims();
        self.check_channels(dims);
        (mix_channels(x, self.weight()), self.log_det(dims))
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let dims = y.dims();
        self.check_channels(dims);
        (mix_channels(y, self.inverse_weight()), self.log_det(dims).neg())
    }
}

// --- PERMUTE ---

#[derive(Config, Debug, PartialEq, Eq)]
pub enum PermuteMode {
    /// Exchange the two halves of the feature vector.
    Swap,
    /// A random permutation drawn once at construction.
    Shuffle,
}

/// Fixed reordering of vector features. Volume preserving.
#[derive(Module, Clone, Debug)]
pub struct Permute {
    order: Vec<usize>,
    inverse: Vec<usize>,
}

impl Permute {
    pub fn new<B: Backend>(dim: usize, mode: PermuteMode, device: &B::Device) -> Self {
        match mode {
            PermuteMode::Swap => Self::swap(dim),
            PermuteMode::Shuffle => {
                let keys: Vec<f64> = Tensor::<B, 1>::random([dim], Distribution::Default, device)
                    .into_data()
                    .iter::<f64>()
                    .collect();
                let mut order: Vec<usize> = (0..dim).collect();
                order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
                Self::with_order(order)
            }
        }
    }

    /// Moves the second half of the features in front of the first.
    pub fn swap(dim: usize) -> Self {
        let half = dim / 2;
        Self::with_order((half..dim).chain(0..half).collect())
    }

    /// Output feature `i` is input feature `order[i]`.
    pub fn from_order(order: Vec<usize>) -> crate::error::Result<Self> {
        let mut seen = vec![false; order.len()];
        for &i in &order {
            if i >= order.len() || seen[i] {
                return Err(FlowError::InvalidConfig(format!(
                    "{order:?} is not a permutation"
                )));
            }
            seen[i] = true;
        }
        Ok(Self::with_order(order))
    }

    fn with_order(order: Vec<usize>) -> Self {
        let mut inverse = vec![0; order.len()];
        for (i, &j) in order.iter().enumerate() {
            inverse[j] = i;
        }
        Self { order, inverse }
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn apply<B: Backend>(x: Tensor<B, 2>, order: &[usize]) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [batch, dim] = x.dims();
        if dim != order.len() {
            raise(Err(FlowError::ShapeMismatch {
                context: "permute",
                expected: vec![order.len()],
                actual: vec![dim],
            }));
        }
        let device = x.device();
        let index: Vec<i64> = order.iter().map(|&i| i as i64).collect();
        let index = Tensor::<B, 1, Int>::from_data(TensorData::new(index, [dim]), &device);
        (x.select(1, index), Tensor::zeros([batch], &device))
    }
}

impl<B: Backend> Transform<B, 2> for Permute {
    fn forward_and_log_det(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        Self::apply(x, &self.order)
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        Self::apply(y, &self.inverse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rstest::*;

    type TestBackend = NdArray<f32>;

    #[fixture]
    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    fn max_abs<const D: usize>(x: Tensor<TestBackend, D>) -> f32 {
        x.abs().max().into_scalar()
    }

    #[rstest]
    #[case::pair(2)]
    #[case::rgb_squeezed(12)]
    #[case::odd(5)]
    fn lu_weight_is_inverted_exactly(device: <TestBackend as Backend>::Device, #[case] channels: usize) {
        let conv = Invertible1x1ConvConfig::new(channels).init::<TestBackend>(&device);
        let product = conv.weight().matmul(conv.inverse_weight());
        let eye = matrix::<TestBackend>(&DMatrix::identity(channels, channels), &device);
        assert!(max_abs(product - eye) < 1e-4);
    }

    #[rstest]
    #[case::pair(2)]
    #[case::rgb_squeezed(12)]
    fn initial_weight_is_a_rotation(device: <TestBackend as Backend>::Device, #[case] channels: usize) {
        let conv = Invertible1x1ConvConfig::new(channels).init::<TestBackend>(&device);
        let weight = conv.weight();
        let gram = weight.clone().matmul(weight.transpose());
        let eye = matrix::<TestBackend>(&DMatrix::identity(channels, channels), &device);
        assert!(max_abs(gram - eye) < 1e-4, "P L U does not rebuild an orthogonal matrix");
    }

    #[test]
    fn matrices_are_uploaded_row_major() {
        let device = Default::default();
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = matrix::<TestBackend>(&m, &device);
        assert_eq!(t.dims(), [2, 3]);
        assert_eq!(t.into_data().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[rstest]
    fn random_rotation_has_unit_determinant(device: <TestBackend as Backend>::Device) {
        let conv = Invertible1x1ConvConfig::new(6).init::<TestBackend>(&device);
        let log_det = conv.log_s.val().sum().into_scalar();
        assert!(log_det.abs() < 1e-4, "log|det| of a rotation should vanish, got {log_det}");
    }

    #[rstest]
    fn conv_round_trip(device: <TestBackend as Backend>::Device) {
        let mut conv = Invertible1x1ConvConfig::new(4).init::<TestBackend>(&device);
        conv.log_s = Param::from_tensor(Tensor::from_floats([0.3, -0.2, 0.1, 0.5], &device));
        let x = Tensor::random([2, 4, 3, 3], Distribution::Normal(0.0, 1.0), &device);

        let (y, ld_fwd) = conv.forward_and_log_det(x.clone());
        let (x_rec, ld_inv) = conv.inverse_and_log_det(y);
        assert!(max_abs(x_rec - x) < 1e-4);
        assert!(max_abs(ld_fwd.clone() + ld_inv) < 1e-5);
        assert!(max_abs(ld_fwd.sub_scalar(0.7 * 9.0)) < 1e-4);
    }

    #[rstest]
    #[case::swap(PermuteMode::Swap)]
    #[case::shuffle(PermuteMode::Shuffle)]
    fn permute_round_trip(device: <TestBackend as Backend>::Device, #[case] mode: PermuteMode) {
        let permute = Permute::new::<TestBackend>(5, mode, &device);
        let x = Tensor::<TestBackend, 2>::random([3, 5], Distribution::Default, &device);
        let (y, log_det) = permute.forward_and_log_det(x.clone());
        assert_eq!(max_abs(log_det), 0.0);
        permute.inverse(y).into_data().assert_eq(&x.into_data(), true);
    }

    #[test]
    fn swap_moves_second_half_first() {
        assert_eq!(Permute::swap(4).order(), &[2, 3, 0, 1]);
        assert_eq!(Permute::swap(5).order(), &[2, 3, 4, 0, 1]);
        assert!(Permute::from_order(vec![0, 0, 1]).is_err());
        assert!(Permute::from_order(vec![2, 0, 1]).is_ok());
    }
}
