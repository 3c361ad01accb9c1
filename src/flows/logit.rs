use burn::{
    module::Module,
    tensor::{Tensor, activation, backend::Backend},
};

use super::Transform;
use crate::utils::sum_except_batch;

/// Maps data in `[0, 1]` to the real line: `z = logit(alpha + (1 - 2 alpha) x)`.
///
/// `alpha` keeps the boundary pixels away from the singularities of the logit.
#[derive(Module, Clone, Debug)]
pub struct Logit {
    alpha: f64,
}

impl Logit {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl Default for Logit {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl<B: Backend, const D: usize> Transform<B, D> for Logit {
    fn forward_and_log_det(&self, x: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, 1>) {
        let squeeze = 1.0 - 2.0 * self.alpha;
        let event: usize = x.dims()[1..].iter().product();

        let x = x.mul_scalar(squeeze).add_scalar(self.alpha);
        let log_x = x.clone().log();
        let log_one_minus_x = x.neg().add_scalar(1.0).log();
        let log_det = sum_except_batch(log_x.clone() + log_one_minus_x.clone())
            .neg()
            .add_scalar(event as f64 * squeeze.ln());
        (log_x - log_one_minus_x, log_det)
    }

    fn inverse_and_log_det(&self, z: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, 1>) {
        let squeeze = 1.0 - 2.0 * self.alpha;
        let event: usize = z.dims()[1..].iter().product();

        let log_det = sum_except_batch(
            activation::log_sigmoid(z.clone()) + activation::log_sigmoid(z.clone().neg()),
        )
        .sub_scalar(event as f64 * squeeze.ln());
        let x = activation::sigmoid(z)
            .sub_scalar(self.alpha)
            .div_scalar(squeeze);
        (x, log_det)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn logit_round_trip_on_unit_interval() {
        let device = Default::default();
        let logit = Logit::default();
        let x = Tensor::<TestBackend, 4>::random([3, 1, 4, 4], Distribution::Uniform(0.0, 1.0), &device);

        let (z, ld_fwd) = logit.forward_and_log_det(x.clone());
        let (x_rec, ld_inv) = logit.inverse_and_log_det(z);
        assert!((x_rec - x).abs().max().into_scalar() < 1e-4);
        assert!((ld_fwd + ld_inv).abs().max().into_scalar() < 1e-3);
    }

    #[test]
    fn midpoint_maps_to_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::full([2, 3], 0.5, &device);
        let z = Logit::new(0.1).forward(x);
        assert!(z.abs().max().into_scalar() < 1e-6);
    }
}
