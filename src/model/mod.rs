//! Models assembled from base distributions and flow stacks.

mod flow;
mod multiscale;
mod vae;

pub use flow::{ClassCondFlow, NormalizingFlow};
pub use multiscale::MultiscaleFlow;
pub use vae::{NormalizingFlowVAE, iwae_loss};
