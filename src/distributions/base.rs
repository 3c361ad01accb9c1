use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    tensor::{Distribution, Int, Tensor, backend::Backend},
};

use super::gaussian_log_prob;
use crate::error::{FlowError, raise};
use crate::utils::{batch_shape, check_labels};

/// Sampling and log-density evaluation of an unconditional base distribution.
pub trait BaseDistribution<B: Backend, const D: usize> {
    /// Log-density of `z`, shape `(batch,)`.
    fn log_prob(&self, z: Tensor<B, D>) -> Tensor<B, 1>;

    /// Draws `num_samples` points together with their log-density.
    fn sample(&self, num_samples: usize) -> (Tensor<B, D>, Tensor<B, 1>);
}

/// Base distribution keyed by an integer class label per sample.
///
/// A temperature `t` rescales the spread of the distribution by `t`; `None`
/// leaves it as trained.
pub trait ClassCondDistribution<B: Backend, const D: usize> {
    fn log_prob_with_temperature(
        &self,
        z: Tensor<B, D>,
        y: Tensor<B, 1, Int>,
        temperature: Option<f64>,
    ) -> Tensor<B, 1>;

    /// Draws one point per label in `y`; `y` must hold `num_samples` labels.
    fn sample_with_temperature(
        &self,
        num_samples: usize,
        y: Tensor<B, 1, Int>,
        temperature: Option<f64>,
    ) -> (Tensor<B, D>, Tensor<B, 1>);

    fn log_prob(&self, z: Tensor<B, D>, y: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.log_prob_with_temperature(z, y, None)
    }

    fn sample(&self, num_samples: usize, y: Tensor<B, 1, Int>) -> (Tensor<B, D>, Tensor<B, 1>) {
        self.sample_with_temperature(num_samples, y, None)
    }
}

fn check_event_shape<const D: usize>(context: &'static str, dims: [usize; D], shape: &[usize]) {
    if dims[1..] != *shape {
        raise(Err(FlowError::ShapeMismatch {
            context,
            expected: shape.to_vec(),
            actual: dims[1..].to_vec(),
        }));
    }
}

// --- DIAGONAL GAUSSIAN ---

#[derive(Config, Debug)]
pub struct DiagGaussianConfig {
    /// Event shape, e.g. `[2]` for points in the plane or `[C, H, W]` for images.
    pub shape: Vec<usize>,
    #[config(default = true)]
    pub trainable: bool,
}

impl DiagGaussianConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DiagGaussian<B> {
        let dim = self.shape.iter().product();
        let loc = Param::from_tensor(Tensor::zeros([dim], device)).set_require_grad(self.trainable);
        let log_scale =
            Param::from_tensor(Tensor::zeros([dim], device)).set_require_grad(self.trainable);

        DiagGaussian {
            loc,
            log_scale,
            shape: Ignored(self.shape.clone()),
        }
    }
}

/// Multivariate Gaussian with diagonal covariance and learnable mean and log-scale.
#[derive(Module, Debug)]
pub struct DiagGaussian<B: Backend> {
    pub loc: Param<Tensor<B, 1>>,
    pub log_scale: Param<Tensor<B, 1>>,
    shape: Ignored<Vec<usize>>,
}

impl<B: Backend> DiagGaussian<B> {
    pub fn shape(&self) -> &[usize] {
        &self.shape.0
    }

    fn dim(&self) -> usize {
        self.shape.0.iter().product()
    }
}

impl<B: Backend, const D: usize> BaseDistribution<B, D> for DiagGaussian<B> {
    fn log_prob(&self, z: Tensor<B, D>) -> Tensor<B, 1> {
        let dims = z.dims();
        check_event_shape("diagonal Gaussian log_prob", dims, self.shape());
        let z = z.reshape([dims[0], self.dim()]);
        let loc = self.loc.val().unsqueeze::<2>();
        let log_scale = self.log_scale.val().unsqueeze::<2>();
        let eps = (z - loc) * log_scale.clone().neg().exp();
        gaussian_log_prob(eps, log_scale)
    }

    fn sample(&self, num_samples: usize) -> (Tensor<B, D>, Tensor<B, 1>) {
        let loc = self.loc.val().unsqueeze::<2>();
        let log_scale = self.log_scale.val().unsqueeze::<2>();
        let eps = Tensor::<B, 2>::random(
            [num_samples, self.dim()],
            Distribution::Normal(0.0, 1.0),
            &loc.device(),
        );
        let z = loc + log_scale.clone().exp() * eps.clone();
        let log_p = gaussian_log_prob(eps, log_scale);
        (z.reshape(batch_shape::<D>(num_samples, self.shape())), log_p)
    }
}

// --- CLASS-CONDITIONAL DIAGONAL GAUSSIAN ---

#[derive(Config, Debug)]
pub struct ClassCondDiagGaussianConfig {
    pub shape: Vec<usize>,
    pub num_classes: usize,
}

impl ClassCondDiagGaussianConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassCondDiagGaussian<B> {
        let dim = self.shape.iter().product();
        ClassCondDiagGaussian {
            loc: Param::from_tensor(Tensor::zeros([self.num_classes, dim], device)),
            log_scale: Param::from_tensor(Tensor::zeros([self.num_classes, dim], device)),
            shape: Ignored(self.shape.clone()),
            num_classes: self.num_classes,
        }
    }
}

/// Diagonal Gaussian with one mean and log-scale vector per class.
#[derive(Module, Debug)]
pub struct ClassCondDiagGaussian<B: Backend> {
    /// `(num_classes, d)`
    pub loc: Param<Tensor<B, 2>>,
    /// `(num_classes, d)`
    pub log_scale: Param<Tensor<B, 2>>,
    shape: Ignored<Vec<usize>>,
    num_classes: usize,
}

impl<B: Backend> ClassCondDiagGaussian<B> {
    pub fn shape(&self) -> &[usize] {
        &self.shape.0
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn dim(&self) -> usize {
        self.shape.0.iter().product()
    }

    /// Per-sample `(loc, log_scale)`, each `(batch, d)`; a temperature `t`
    /// widens the distribution by adding `ln t` to the log-scale.
    fn params(&self, y: Tensor<B, 1, Int>, temperature: Option<f64>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let loc = self.loc.val().select(0, y.clone());
        let log_scale = self.log_scale.val().select(0, y);
        match temperature {
            Some(t) => (loc, log_scale.add_scalar(t.ln())),
            None => (loc, log_scale),
        }
    }
}

impl<B: Backend, const D: usize> ClassCondDistribution<B, D> for ClassCondDiagGaussian<B> {
    fn log_prob_with_temperature(
        &self,
        z: Tensor<B, D>,
        y: Tensor<B, 1, Int>,
        temperature: Option<f64>,
    ) -> Tensor<B, 1> {
        let dims = z.dims();
        check_event_shape("class-conditional Gaussian log_prob", dims, self.shape());
        raise(check_labels(&y, dims[0], self.num_classes));
        let z = z.reshape([dims[0], self.dim()]);
        let (loc, log_scale) = self.params(y, temperature);
        let eps = (z - loc) * log_scale.clone().neg().exp();
        gaussian_log_prob(eps, log_scale)
    }

    fn sample_with_temperature(
        &self,
        num_samples: usize,
        y: Tensor<B, 1, Int>,
        temperature: Option<f64>,
    ) -> (Tensor<B, D>, Tensor<B, 1>) {
        raise(check_labels(&y, num_samples, self.num_classes));
        let (loc, log_scale) = self.params(y, temperature);
        let eps = Tensor::<B, 2>::random(
            [num_samples, self.dim()],
            Distribution::Normal(0.0, 1.0),
            &loc.device(),
        );
        let z = loc + log_scale.clone().exp() * eps.clone();
        let log_p = gaussian_log_prob(eps, log_scale);
        (z.reshape(batch_shape::<D>(num_samples, self.shape())), log_p)
    }
}
