use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig, Relu},
    tensor::{Distribution, Tensor, backend::Backend},
};
use std::f64::consts::PI;

use crate::error::raise;
use crate::utils::check_batch;

/// Amortised posterior `q(z | x)` of a flow VAE.
pub trait Encoder<B: Backend> {
    /// Draws `num_samples` latents per input.
    ///
    /// Returns `z` of shape `(batch, num_samples, latent_dim)` and its
    /// log-density `(batch, num_samples)`.
    fn sample(&self, x: Tensor<B, 2>, num_samples: usize) -> (Tensor<B, 3>, Tensor<B, 2>);

    /// Log-density of `z: (batch, num_samples, latent_dim)` given `x: (batch, input_dim)`.
    fn log_prob(&self, z: Tensor<B, 3>, x: Tensor<B, 2>) -> Tensor<B, 2>;
}

// --- CONFIG ---

#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub input_dim: usize,

    /// Hidden layer sizes, e.g. `vec![512, 256]` gives
    /// Input -> 512 -> 256 -> (mu, logvar).
    #[config(default = "vec![512, 256]")]
    pub hidden_dims: Vec<usize>,

    pub latent_dim: usize,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> NnDiagGaussian<B> {
        let mut layers = Vec::new();
        let mut current_dim = self.input_dim;

        for &dim in &self.hidden_dims {
            layers.push(LinearConfig::new(current_dim, dim).init(device));
            current_dim = dim;
        }

        // The last hidden width feeds both distribution heads
        let fc_mu = LinearConfig::new(current_dim, self.latent_dim).init(device);
        let fc_logvar = LinearConfig::new(current_dim, self.latent_dim).init(device);

        NnDiagGaussian {
            layers,
            fc_mu,
            fc_logvar,
            activation: Relu::new(),
        }
    }
}

// --- ENCODER ---

/// Diagonal Gaussian posterior whose mean and log-variance come from a
/// fully connected network.
#[derive(Module, Debug)]
pub struct NnDiagGaussian<B: Backend> {
    layers: Vec<Linear<B>>,
    fc_mu: Linear<B>,
    fc_logvar: Linear<B>,
    activation: Relu,
}

impl<B: Backend> NnDiagGaussian<B> {
    /// Returns `(mu, logvar)`, each `(batch, latent_dim)`.
    pub fn forward(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut x = x;
        for layer in &self.layers {
            x = layer.forward(x);
            x = self.activation.forward(x);
        }

        let mu = self.fc_mu.forward(x.clone());
        let logvar = self.fc_logvar.forward(x);
        (mu, logvar)
    }

    pub fn latent_dim(&self) -> usize {
        self.fc_mu.weight.val().dims()[1]
    }
}

/// `log N(z; mu, exp(logvar))` summed over the last axis, all inputs `(batch, k, d)`.
fn log_normal<B: Backend>(eps: Tensor<B, 3>, logvar: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, k, dim] = eps.dims();
    let log_norm = -0.5 * dim as f64 * (2.0 * PI).ln();
    (logvar + eps.powf_scalar(2.0))
        .sum_dim(2)
        .reshape([batch, k])
        .mul_scalar(-0.5)
        .add_scalar(log_norm)
}

impl<B: Backend> Encoder<B> for NnDiagGaussian<B> {
    fn sample(&self, x: Tensor<B, 2>, num_samples: usize) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let (mu, logvar) = self.forward(x);
        let [batch, dim] = mu.dims();
        let mu = mu.unsqueeze_dim::<3>(1);
        let logvar = logvar.unsqueeze_dim::<3>(1);

        // Reparameterisation: z = mu + std * eps keeps the draw differentiable
        let eps = Tensor::<B, 3>::random(
            [batch, num_samples, dim],
            Distribution::Normal(0.0, 1.0),
            &mu.device(),
        );
        let std = logvar.clone().mul_scalar(0.5).exp();
        let z = mu + std * eps.clone();
        let log_q = log_normal(eps, logvar.repeat_dim(1, num_samples));
        (z, log_q)
    }

    fn log_prob(&self, z: Tensor<B, 3>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, num_samples, _] = z.dims();
        raise(check_batch("encoder log_prob", batch, x.dims()[0]));
        let (mu, logvar) = self.forward(x);
        let mu = mu.unsqueeze_dim::<3>(1);
        let logvar = logvar.unsqueeze_dim::<3>(1).repeat_dim(1, num_samples);
        let eps = (z - mu) * logvar.clone().mul_scalar(-0.5).exp();
        log_normal(eps, logvar)
    }
}
