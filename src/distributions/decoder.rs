use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{Linear, LinearConfig, Relu},
    tensor::{Tensor, activation, backend::Backend},
};
use std::f64::consts::PI;

use crate::error::raise;
use crate::utils::check_batch;

/// Likelihood `p(x | z)` of a flow VAE.
pub trait Decoder<B: Backend> {
    /// Log-likelihood of `x: (batch, data_dim)` under each of the
    /// `num_samples` latents in `z: (batch, num_samples, latent_dim)`.
    /// Returns `(batch, num_samples)`.
    fn log_prob(&self, x: Tensor<B, 2>, z: Tensor<B, 3>) -> Tensor<B, 2>;
}

/// Observation model on top of the decoder network.
#[derive(Config, Debug, PartialEq)]
pub enum Likelihood {
    /// Diagonal Gaussian; the network predicts mean and log-scale.
    Gaussian,
    /// Independent Bernoulli per coordinate; the network predicts logits.
    Bernoulli,
}

// --- CONFIG ---

#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub latent_dim: usize,

    /// Hidden sizes, applied in reverse so the decoder mirrors an encoder
    /// built from the same list: Latent -> 256 -> 512 -> Output.
    #[config(default = "vec![512, 256]")]
    pub hidden_dims: Vec<usize>,

    pub output_dim: usize,

    #[config(default = "Likelihood::Gaussian")]
    pub likelihood: Likelihood,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> NnDecoder<B> {
        let mut layers = Vec::new();
        let mut current_dim = self.latent_dim;

        for &dim in self.hidden_dims.iter().rev() {
            layers.push(LinearConfig::new(current_dim, dim).init(device));
            current_dim = dim;
        }

        let head_dim = match self.likelihood {
            Likelihood::Gaussian => 2 * self.output_dim,
            Likelihood::Bernoulli => self.output_dim,
        };
        let output_layer = LinearConfig::new(current_dim, head_dim).init(device);

        NnDecoder {
            layers,
            output_layer,
            activation: Relu::new(),
            likelihood: Ignored(self.likelihood.clone()),
            output_dim: self.output_dim,
        }
    }
}

// --- DECODER ---

#[derive(Module, Debug)]
pub struct NnDecoder<B: Backend> {
    layers: Vec<Linear<B>>,
    output_layer: Linear<B>,
    activation: Relu,
    likelihood: Ignored<Likelihood>,
    output_dim: usize,
}

impl<B: Backend> NnDecoder<B> {
    fn head(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = z;
        for layer in &self.layers {
            x = layer.forward(x);
            x = self.activation.forward(x);
        }
        self.output_layer.forward(x)
    }

    /// Mean reconstruction for latents `(batch, latent_dim)`.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let out = self.head(z);
        match self.likelihood.0 {
            Likelihood::Gaussian => out.narrow(1, 0, self.output_dim),
            Likelihood::Bernoulli => activation::sigmoid(out),
        }
    }

    pub fn likelihood(&self) -> &Likelihood {
        &self.likelihood.0
    }
}

impl<B: Backend> Decoder<B> for NnDecoder<B> {
    fn log_prob(&self, x: Tensor<B, 2>, z: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, num_samples, latent_dim] = z.dims();
        raise(check_batch("decoder log_prob", batch, x.dims()[0]));
        let n = batch * num_samples;
        let d = self.output_dim;

        let out = self.head(z.reshape([n, latent_dim]));
        // Repeat each input once per latent draw, matching z's flattened order
        let x = x.unsqueeze_dim::<3>(1).repeat_dim(1, num_samples).reshape([n, d]);

        let log_p = match self.likelihood.0 {
            Likelihood::Gaussian => {
                let mean = out.clone().narrow(1, 0, d);
                let log_scale = out.narrow(1, d, d);
                let eps = (x - mean) * log_scale.clone().neg().exp();
                (log_scale + eps.powf_scalar(2.0).mul_scalar(0.5))
                    .sum_dim(1)
                    .neg()
                    .sub_scalar(0.5 * d as f64 * (2.0 * PI).ln())
            }
            Likelihood::Bernoulli => {
                let on = x.clone() * activation::log_sigmoid(out.clone());
                let off = x.neg().add_scalar(1.0) * activation::log_sigmoid(out.neg());
                (on + off).sum_dim(1)
            }
        };
        log_p.reshape([batch, num_samples])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;
    use rstest::rstest;

    type TestBackend = NdArray<f32>;

    #[rstest]
    #[case::gaussian(Likelihood::Gaussian)]
    #[case::bernoulli(Likelihood::Bernoulli)]
    fn log_prob_has_one_value_per_draw(#[case] likelihood: Likelihood) {
        let device = Default::default();
        let decoder = DecoderConfig::new(3, 10)
            .with_hidden_dims(vec![8, 16])
            .with_likelihood(likelihood)
            .init::<TestBackend>(&device);
        let x = Tensor::random([5, 10], Distribution::Default, &device);
        let z = Tensor::random([5, 4, 3], Distribution::Normal(0.0, 1.0), &device);

        let log_p = decoder.log_prob(x, z.clone());
        assert_eq!(log_p.dims(), [5, 4]);
        assert_eq!(decoder.forward(z.reshape([20, 3])).dims(), [20, 10]);
    }

    #[test]
    fn bernoulli_reconstruction_is_a_probability() {
        let device = Default::default();
        let decoder = DecoderConfig::new(2, 6)
            .with_likelihood(Likelihood::Bernoulli)
            .with_hidden_dims(vec![4])
            .init::<TestBackend>(&device);
        let z = Tensor::random([7, 2], Distribution::Normal(0.0, 3.0), &device);
        let recon = decoder.forward(z);
        assert!(recon.clone().min().into_scalar() >= 0.0);
        assert!(recon.max().into_scalar() <= 1.0);
    }

    #[test]
    fn bernoulli_log_likelihood_is_non_positive() {
        let device = Default::default();
        let decoder = DecoderConfig::new(2, 6)
            .with_likelihood(Likelihood::Bernoulli)
            .init::<TestBackend>(&device);
        let x = Tensor::random([3, 6], Distribution::Bernoulli(0.5), &device);
        let z = Tensor::random([3, 2, 2], Distribution::Normal(0.0, 1.0), &device);
        assert!(decoder.log_prob(x, z).max().into_scalar() <= 0.0);
    }
}
