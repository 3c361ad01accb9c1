use burn::tensor::{Tensor, TensorData, activation, backend::Backend};
use std::f64::consts::PI;

use crate::utils::{log_sum_exp_dim, sum_except_batch};

/// Density a flow is fitted to by the reverse objectives. May be unnormalised.
pub trait Target<B: Backend, const D: usize> {
    fn log_prob(&self, z: Tensor<B, D>) -> Tensor<B, 1>;
}

/// Standard Gaussian over any event shape; the VAE prior.
#[derive(Clone, Debug, Default)]
pub struct StandardNormal;

impl<B: Backend, const D: usize> Target<B, D> for StandardNormal {
    fn log_prob(&self, z: Tensor<B, D>) -> Tensor<B, 1> {
        let dims = z.dims();
        let dim: usize = dims[1..].iter().product();
        let log_norm = -0.5 * dim as f64 * (2.0 * PI).ln();
        sum_except_batch(z.powf_scalar(2.0))
            .mul_scalar(-0.5)
            .add_scalar(log_norm)
    }
}

/// Equal-weight Gaussians evenly spaced on a circle of radius 2.
#[derive(Clone, Debug)]
pub struct CircularGaussianMixture {
    n_modes: usize,
    scale: f64,
}

impl CircularGaussianMixture {
    pub fn new(n_modes: usize) -> Self {
        // Neighbouring modes overlap by a fixed fraction regardless of count.
        let scale = 2.0 / 3.0 * (PI / n_modes as f64).sin();
        Self { n_modes, scale }
    }

    fn centers(&self) -> Vec<f32> {
        (0..self.n_modes)
            .flat_map(|i| {
                let angle = 2.0 * PI * i as f64 / self.n_modes as f64;
                [(2.0 * angle.sin()) as f32, (2.0 * angle.cos()) as f32]
            })
            .collect()
    }
}

impl Default for CircularGaussianMixture {
    fn default() -> Self {
        Self::new(8)
    }
}

impl<B: Backend> Target<B, 2> for CircularGaussianMixture {
    fn log_prob(&self, z: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch, _] = z.dims();
        let centers = Tensor::<B, 2>::from_data(
            TensorData::new(self.centers(), [self.n_modes, 2]),
            &z.device(),
        );
        let dist = (z.unsqueeze_dim::<3>(1) - centers.unsqueeze::<3>())
            .powf_scalar(2.0)
            .sum_dim(2)
            .reshape([batch, self.n_modes])
            .div_scalar(2.0 * self.scale * self.scale);
        let log_norm = (2.0 * PI * self.scale * self.scale * self.n_modes as f64).ln();
        log_sum_exp_dim(dist.neg(), 1)
            .reshape([batch])
            .sub_scalar(log_norm)
    }
}

/// Unnormalised bimodal "two moons" density in the plane.
#[derive(Clone, Debug, Default)]
pub struct TwoMoons;

impl<B: Backend> Target<B, 2> for TwoMoons {
    fn log_prob(&self, z: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch, _] = z.dims();
        let a = z.clone().narrow(1, 0, 1).reshape([batch]).abs();
        let radius = z.powf_scalar(2.0).sum_dim(1).reshape([batch]).sqrt();

        let ring = radius.sub_scalar(2.0).div_scalar(0.2).powf_scalar(2.0).mul_scalar(-0.5);
        let lobes = a.clone().sub_scalar(2.0).div_scalar(0.3).powf_scalar(2.0).mul_scalar(-0.5);
        let join = activation::softplus(a.mul_scalar(-4.0 / 0.09), 1.0);
        ring + lobes + join
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn standard_normal_matches_closed_form() {
        let device = Default::default();
        let z = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0, 0.0], [1.0, -1.0, 2.0]], &device);
        let log_p = Target::log_prob(&StandardNormal, z)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let norm = -1.5 * (2.0 * std::f32::consts::PI).ln();
        assert!((log_p[0] - norm).abs() < 1e-5);
        assert!((log_p[1] - (norm - 3.0)).abs() < 1e-5);
    }

    #[test]
    fn mixture_peaks_on_the_modes() {
        let device = Default::default();
        let target = CircularGaussianMixture::new(8);
        // (0, 2) is the first mode, the origin sits between all of them.
        let z = Tensor::<TestBackend, 2>::from_floats([[0.0, 2.0], [0.0, 0.0]], &device);
        let log_p = target.log_prob(z).into_data().to_vec::<f32>().unwrap();
        assert!(log_p[0] > log_p[1] + 5.0, "{log_p:?}");
    }

    #[test]
    fn mixture_is_rotation_symmetric() {
        let device = Default::default();
        let target = CircularGaussianMixture::new(4);
        let z = Tensor::<TestBackend, 2>::from_floats(
            [[0.3, 1.5], [1.5, -0.3], [-0.3, -1.5], [-1.5, 0.3]],
            &device,
        );
        let log_p = target.log_prob(z).into_data().to_vec::<f32>().unwrap();
        for value in &log_p[1..] {
            assert!((value - log_p[0]).abs() < 1e-4, "{log_p:?}");
        }
    }

    #[test]
    fn two_moons_prefers_the_ring() {
        let device = Default::default();
        let z = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 0.0], [5.0, 5.0]], &device);
        let log_p = TwoMoons.log_prob(z).into_data().to_vec::<f32>().unwrap();
        assert!(log_p[0] > log_p[1]);
        assert!(log_p[0] > log_p[2]);
    }
}
