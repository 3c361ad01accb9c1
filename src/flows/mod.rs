//! Invertible transforms and the flow-stack bookkeeping shared by every model.
//!
//! `forward` always runs in the normalizing direction (data towards the
//! base distribution) and `inverse` in the generative direction. Each call
//! that reports a log-determinant returns it as `(batch,)`.

mod affine;
mod glow;
mod logit;
mod mixing;
mod reshape;

pub use affine::{
    ActNorm, ActNormConfig, AffineCoupling, AffineCouplingBlock, MaskedAffineFlow,
    MaskedAffineFlowConfig, ScaleMap, alternating_mask,
};
pub use glow::{GlowBlock, GlowBlockConfig};
pub use logit::Logit;
pub use mixing::{Invertible1x1Conv, Invertible1x1ConvConfig, Permute, PermuteMode};
pub use reshape::{Merge, Split, SplitMode, Squeeze};

use burn::{
    module::Module,
    tensor::{Tensor, backend::Backend},
};

/// A bijection with a tractable log-determinant Jacobian.
///
/// For every valid `x`: `inverse(forward(x)) == x` and the log-det of
/// `forward` at `x` is the negation of the log-det of `inverse` at `forward(x)`.
pub trait Transform<B: Backend, const D: usize> {
    fn forward_and_log_det(&self, x: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, 1>);

    fn inverse_and_log_det(&self, y: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, 1>);

    fn forward(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.forward_and_log_det(x).0
    }

    fn inverse(&self, y: Tensor<B, D>) -> Tensor<B, D> {
        self.inverse_and_log_det(y).0
    }
}

/// Applies `flows` in order, summing their log-dets.
pub fn forward_stack<B, T, const D: usize>(flows: &[T], x: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, 1>)
where
    B: Backend,
    T: Transform<B, D>,
{
    let mut log_det = Tensor::zeros([x.dims()[0]], &x.device());
    let mut x = x;
    for flow in flows {
        let (y, ld) = flow.forward_and_log_det(x);
        x = y;
        log_det = log_det + ld;
    }
    (x, log_det)
}

/// Applies the inverses of `flows` in reverse order, summing their log-dets.
pub fn inverse_stack<B, T, const D: usize>(flows: &[T], y: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, 1>)
where
    B: Backend,
    T: Transform<B, D>,
{
    let mut log_det = Tensor::zeros([y.dims()[0]], &y.device());
    let mut y = y;
    for flow in flows.iter().rev() {
        let (x, ld) = flow.inverse_and_log_det(y);
        y = x;
        log_det = log_det + ld;
    }
    (y, log_det)
}

// --- VECTOR FLOWS ---

/// Layers acting on `(batch, dim)` samples.
#[derive(Module, Debug)]
pub enum VectorFlow<B: Backend> {
    MaskedAffine(MaskedAffineFlow<B>),
    Permute(Permute),
}

impl<B: Backend> Transform<B, 2> for VectorFlow<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        match self {
            VectorFlow::MaskedAffine(flow) => flow.forward_and_log_det(x),
            VectorFlow::Permute(flow) => flow.forward_and_log_det(x),
        }
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        match self {
            VectorFlow::MaskedAffine(flow) => flow.inverse_and_log_det(y),
            VectorFlow::Permute(flow) => flow.inverse_and_log_det(y),
        }
    }
}

impl<B: Backend> From<MaskedAffineFlow<B>> for VectorFlow<B> {
    fn from(flow: MaskedAffineFlow<B>) -> Self {
        VectorFlow::MaskedAffine(flow)
    }
}

impl<B: Backend> From<Permute> for VectorFlow<B> {
    fn from(flow: Permute) -> Self {
        VectorFlow::Permute(flow)
    }
}

// --- IMAGE FLOWS ---

/// Layers acting on `(batch, channels, height, width)` samples.
#[derive(Module, Debug)]
pub enum ImageFlow<B: Backend> {
    Glow(GlowBlock<B>),
    Coupling(AffineCouplingBlock<B>),
    ActNorm(ActNorm<B>),
    Mixing(Invertible1x1Conv<B>),
    Squeeze(Squeeze),
}

impl<B: Backend> ImageFlow<B> {
    /// Data-dependent initialisation of any `ActNorm` in this layer, given
    /// the activations `x` that reach it. Returns the layer and its output.
    pub fn init_actnorm(self, x: Tensor<B, 4>) -> (Self, Tensor<B, 4>) {
        match self {
            ImageFlow::Glow(flow) => {
                let (flow, y) = flow.init_actnorm(x);
                (ImageFlow::Glow(flow), y)
            }
            ImageFlow::ActNorm(flow) => {
                let flow = flow.init_from_data(x.clone());
                let y = flow.forward(x);
                (ImageFlow::ActNorm(flow), y)
            }
            other => {
                let y = other.forward(x);
                (other, y)
            }
        }
    }
}

impl<B: Backend> Transform<B, 4> for ImageFlow<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        match self {
            ImageFlow::Glow(flow) => flow.forward_and_log_det(x),
            ImageFlow::Coupling(flow) => flow.forward_and_log_det(x),
            ImageFlow::ActNorm(flow) => flow.forward_and_log_det(x),
            ImageFlow::Mixing(flow) => flow.forward_and_log_det(x),
            ImageFlow::Squeeze(flow) => flow.forward_and_log_det(x),
        }
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        match self {
            ImageFlow::Glow(flow) => flow.inverse_and_log_det(y),
            ImageFlow::Coupling(flow) => flow.inverse_and_log_det(y),
            ImageFlow::ActNorm(flow) => flow.inverse_and_log_det(y),
            ImageFlow::Mixing(flow) => flow.inverse_and_log_det(y),
            ImageFlow::Squeeze(flow) => flow.inverse_and_log_det(y),
        }
    }
}

impl<B: Backend> From<GlowBlock<B>> for ImageFlow<B> {
    fn from(flow: GlowBlock<B>) -> Self {
        ImageFlow::Glow(flow)
    }
}

impl<B: Backend> From<AffineCouplingBlock<B>> for ImageFlow<B> {
    fn from(flow: AffineCouplingBlock<B>) -> Self {
        ImageFlow::Coupling(flow)
    }
}

impl<B: Backend> From<ActNorm<B>> for ImageFlow<B> {
    fn from(flow: ActNorm<B>) -> Self {
        ImageFlow::ActNorm(flow)
    }
}

impl<B: Backend> From<Invertible1x1Conv<B>> for ImageFlow<B> {
    fn from(flow: Invertible1x1Conv<B>) -> Self {
        ImageFlow::Mixing(flow)
    }
}

impl<B: Backend> From<Squeeze> for ImageFlow<B> {
    fn from(flow: Squeeze) -> Self {
        ImageFlow::Squeeze(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn stacks_accumulate_and_invert() {
        let device = Default::default();
        let flows: Vec<VectorFlow<TestBackend>> = vec![
            MaskedAffineFlowConfig::new(4)
                .with_hidden(vec![8])
                .with_init_zeros(false)
                .init::<TestBackend>(&device)
                .into(),
            Permute::swap(4).into(),
            MaskedAffineFlowConfig::new(4)
                .with_hidden(vec![8])
                .with_parity(1)
                .with_init_zeros(false)
                .init::<TestBackend>(&device)
                .into(),
        ];
        let x = Tensor::<TestBackend, 2>::random([6, 4], Distribution::Normal(0.0, 1.0), &device);

        let (z, ld_fwd) = forward_stack(&flows, x.clone());
        let (x_rec, ld_inv) = inverse_stack(&flows, z);
        assert!((x_rec - x).abs().max().into_scalar() < 1e-4);
        assert!((ld_fwd + ld_inv).abs().max().into_scalar() < 1e-4);
    }

    #[test]
    fn empty_stack_is_identity() {
        let device = Default::default();
        let flows: Vec<ImageFlow<TestBackend>> = Vec::new();
        let x = Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Default, &device);
        let (y, ld) = forward_stack(&flows, x.clone());
        y.into_data().assert_eq(&x.into_data(), true);
        assert_eq!(ld.dims(), [2]);
        assert_eq!(ld.abs().max().into_scalar(), 0.0);
    }
}
