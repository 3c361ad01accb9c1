//! Base, conditional and target distributions, plus the VAE encoder/decoder.
//!
//! Every distribution reports log-densities as a `(batch,)` tensor paired
//! one-to-one with the sample batch it was given or produced.

mod base;
mod decoder;
mod encoder;
mod target;

pub use base::{
    BaseDistribution, ClassCondDiagGaussian, ClassCondDiagGaussianConfig,
    ClassCondDistribution, DiagGaussian, DiagGaussianConfig,
};
pub use decoder::{Decoder, DecoderConfig, Likelihood, NnDecoder};
pub use encoder::{Encoder, EncoderConfig, NnDiagGaussian};
pub use target::{CircularGaussianMixture, StandardNormal, Target, TwoMoons};

use burn::tensor::{Tensor, backend::Backend};
use std::f64::consts::PI;

/// Diagonal Gaussian log-density from standardised residuals.
///
/// `eps = (z - loc) / exp(log_scale)`, both `(batch, d)`; `log_scale` may
/// broadcast over the batch. Returns `(batch,)`.
pub(crate) fn gaussian_log_prob<B: Backend>(eps: Tensor<B, 2>, log_scale: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, dim] = eps.dims();
    let log_norm = -0.5 * dim as f64 * (2.0 * PI).ln();
    (log_scale + eps.powf_scalar(2.0).mul_scalar(0.5))
        .sum_dim(1)
        .reshape([batch])
        .neg()
        .add_scalar(log_norm)
}
