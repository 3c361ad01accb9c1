use burn::{
    module::{Ignored, Module},
    tensor::{Tensor, backend::Backend},
};

use crate::distributions::{Decoder, Encoder, StandardNormal, Target};
use crate::flows::{VectorFlow, forward_stack};
use crate::utils::log_sum_exp_dim;

/// Variational autoencoder whose posterior is refined by a flow.
///
/// Latents drawn from the encoder are pushed through `flows` before the
/// prior and the decoder see them.
#[derive(Module, Debug)]
pub struct NormalizingFlowVAE<B: Backend, E, L> {
    prior: Ignored<StandardNormal>,
    pub encoder: E,
    pub flows: Vec<VectorFlow<B>>,
    pub decoder: L,
}

impl<B: Backend, E, L> NormalizingFlowVAE<B, E, L>
where
    E: Encoder<B> + Module<B>,
    L: Decoder<B> + Module<B>,
{
    pub fn new(encoder: E, flows: Vec<VectorFlow<B>>, decoder: L) -> Self {
        tracing::debug!(layers = flows.len(), "built flow VAE");
        Self {
            prior: Ignored(StandardNormal),
            encoder,
            flows,
            decoder,
        }
    }

    /// Importance-weighted decomposition of the ELBO for `num_samples` draws per input.
    ///
    /// Returns `z: (batch, num_samples, latent_dim)` after the flow,
    /// `log_p = log p(x | z) + log p(z)` and `log_q = log q(z | x)`, both
    /// `(batch, num_samples)`.
    pub fn forward(
        &self,
        x: Tensor<B, 2>,
        num_samples: usize,
    ) -> (Tensor<B, 3>, Tensor<B, 2>, Tensor<B, 2>) {
        let (z, log_q) = self.encoder.sample(x.clone(), num_samples);
        let [batch, _, latent_dim] = z.dims();
        let n = batch * num_samples;

        let (z, log_det) = forward_stack(&self.flows, z.reshape([n, latent_dim]));
        let log_q = log_q.reshape([n]) - log_det;
        let log_prior = self.prior.0.log_prob(z.clone());

        let z = z.reshape([batch, num_samples, latent_dim]);
        let log_p = self.decoder.log_prob(x, z.clone()) + log_prior.reshape([batch, num_samples]);
        (z, log_p, log_q.reshape([batch, num_samples]))
    }
}

/// Negative importance-weighted bound, averaged over the batch. Shape `[1]`.
pub fn iwae_loss<B: Backend>(log_p: Tensor<B, 2>, log_q: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, num_samples] = log_p.dims();
    let bound = log_sum_exp_dim(log_p - log_q, 1).sub_scalar((num_samples as f64).ln());
    bound.reshape([batch]).mean().neg()
}
