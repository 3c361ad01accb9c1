//! Normalizing flows on burn.
//!
//! Density models built from invertible transforms: vector flows of masked
//! affine couplings, class-conditional flows, multiscale Glow-style image
//! flows and a VAE whose posterior is refined by a flow. Every model exposes
//! exact `log_prob`, `sample` and the training objectives as tensors that
//! burn's autodiff can differentiate.

pub mod distributions;
pub mod error;
pub mod flows;
pub mod model;
pub mod nets;
pub mod utils;

pub use error::{FlowError, Result};
pub use flows::Transform;
pub use model::{ClassCondFlow, MultiscaleFlow, NormalizingFlow, NormalizingFlowVAE, iwae_loss};
