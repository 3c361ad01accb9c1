use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    tensor::{Tensor, TensorData, activation, backend::Backend},
};

use super::{Merge, Split, Transform};
use crate::error::{FlowError, raise};
use crate::nets::{ConvNet2d, Mlp, MlpConfig, OutputActivation};
use crate::utils::sum_except_batch;

/// Binary mask of length `dim` with ones where `j % 2 == parity`.
pub fn alternating_mask<B: Backend>(dim: usize, parity: usize, device: &B::Device) -> Tensor<B, 1> {
    let values: Vec<f32> = (0..dim)
        .map(|j| if j % 2 == parity % 2 { 1.0 } else { 0.0 })
        .collect();
    Tensor::from_data(TensorData::new(values, [dim]), device)
}

// --- MASKED AFFINE FLOW ---

#[derive(Config, Debug)]
pub struct MaskedAffineFlowConfig {
    pub dim: usize,
    /// Hidden widths of both the scale and translation networks.
    #[config(default = "vec![64, 64]")]
    pub hidden: Vec<usize>,
    /// Which coordinates pass through unchanged: those with `j % 2 == parity`.
    #[config(default = 0)]
    pub parity: usize,
    #[config(default = 0.0)]
    pub leaky: f64,
    #[config(default = true)]
    pub init_zeros: bool,
    /// Bounded activation on the scale network, e.g. `Tanh`.
    #[config(default = "None")]
    pub scale_activation: Option<OutputActivation>,
    #[config(default = 1.0)]
    pub scale_bound: f64,
}

impl MaskedAffineFlowConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MaskedAffineFlow<B> {
        let mut layers = vec![self.dim];
        layers.extend(&self.hidden);
        layers.push(self.dim);

        let net = MlpConfig::new(layers)
            .with_leaky(self.leaky)
            .with_init_zeros(self.init_zeros);
        let t = net.init(device);
        let s = net
            .with_output_activation(self.scale_activation.clone())
            .with_output_scale(self.scale_bound)
            .init(device);

        MaskedAffineFlow {
            mask: alternating_mask(self.dim, self.parity, device),
            t,
            s,
        }
    }
}

/// Real NVP coupling on vectors: coordinates where the mask is 1 pass through
/// and condition an affine map of the rest.
#[derive(Module, Debug)]
pub struct MaskedAffineFlow<B: Backend> {
    mask: Tensor<B, 1>,
    t: Mlp<B>,
    s: Mlp<B>,
}

impl<B: Backend> MaskedAffineFlow<B> {
    /// Builds the layer from an explicit mask and networks mapping `dim -> dim`.
    pub fn new(mask: Tensor<B, 1>, t: Mlp<B>, s: Mlp<B>) -> crate::error::Result<Self> {
        let [dim] = mask.dims();
        for (name, net) in [("translation", &t), ("scale", &s)] {
            if net.input_dim() != dim || net.output_dim() != dim {
                return Err(FlowError::InvalidConfig(format!(
                    "{name} network maps {} -> {}, mask has {dim} entries",
                    net.input_dim(),
                    net.output_dim()
                )));
            }
        }
        if mask.to_data().iter::<f64>().any(|b| b != 0.0 && b != 1.0) {
            return Err(FlowError::InvalidConfig("mask must be binary".to_string()));
        }
        Ok(Self { mask, t, s })
    }

    pub fn dim(&self) -> usize {
        self.mask.dims()[0]
    }

    /// `(b, 1 - b, s(b*x), t(b*x))` with the masks broadcast over the batch.
    fn condition(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        let [_, dim] = x.dims();
        if dim != self.dim() {
            raise(Err(FlowError::ShapeMismatch {
                context: "masked affine flow",
                expected: vec![self.dim()],
                actual: vec![dim],
            }));
        }
        let b = self.mask.clone().unsqueeze::<2>();
        let inv = b.clone().neg().add_scalar(1.0);
        let masked = x * b.clone();
        let s = self.s.forward(masked.clone());
        let t = self.t.forward(masked);
        (b, inv, s, t)
    }
}

impl<B: Backend> Transform<B, 2> for MaskedAffineFlow<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (b, inv, s, t) = self.condition(x.clone());
        let y = x.clone() * b + inv.clone() * (x * s.clone().exp() + t);
        (y, sum_except_batch(inv * s))
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (b, inv, s, t) = self.condition(y.clone());
        let x = y.clone() * b + inv.clone() * (y - t) * s.clone().neg().exp();
        (x, sum_except_batch(inv * s).neg())
    }
}

// --- ACTNORM ---

#[derive(Config, Debug)]
pub struct ActNormConfig {
    pub channels: usize,
}

impl ActNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ActNorm<B> {
        ActNorm {
            log_scale: Param::from_tensor(Tensor::zeros([self.channels], device)),
            shift: Param::from_tensor(Tensor::zeros([self.channels], device)),
        }
    }
}

/// Per-channel affine normalisation `y = x * exp(s) + t`.
///
/// Starts as the identity; [`ActNorm::init_from_data`] sets it so a given
/// batch leaves with zero mean and unit variance per channel.
#[derive(Module, Debug)]
pub struct ActNorm<B: Backend> {
    pub log_scale: Param<Tensor<B, 1>>,
    pub shift: Param<Tensor<B, 1>>,
}

impl<B: Backend> ActNorm<B> {
    fn params(&self) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [c] = self.log_scale.val().dims();
        (
            self.log_scale.val().reshape([1, c, 1, 1]),
            self.shift.val().reshape([1, c, 1, 1]),
        )
    }

    fn log_det(&self, dims: [usize; 4]) -> Tensor<B, 1> {
        let [batch, _, h, w] = dims;
        self.log_scale
            .val()
            .sum()
            .mul_scalar((h * w) as f64)
            .repeat_dim(0, batch)
    }

    pub fn init_from_data(mut self, x: Tensor<B, 4>) -> Self {
        let [_, c, _, _] = x.dims();
        let per_channel = x.detach().swap_dims(0, 1).reshape([c as i32, -1]);
        let mean = per_channel.clone().mean_dim(1).reshape([c]);
        let std = per_channel.var(1).sqrt().reshape([c]);

        let log_scale = std.add_scalar(1e-6).log().neg();
        let shift = mean.neg() * log_scale.clone().exp();
        tracing::debug!(channels = c, "actnorm initialised from data");

        self.log_scale = Param::from_tensor(log_scale);
        self.shift = Param::from_tensor(shift);
        self
    }
}

impl<B: Backend> Transform<B, 4> for ActNorm<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let log_det = self.log_det(x.dims());
        let (s, t) = self.params();
        (x * s.exp() + t, log_det)
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let log_det = self.log_det(y.dims()).neg();
        let (s, t) = self.params();
        ((y - t) * s.neg().exp(), log_det)
    }
}

// --- AFFINE COUPLING ---

/// How the raw scale output of a coupling network becomes a multiplier.
#[derive(Config, Debug, PartialEq)]
pub enum ScaleMap {
    /// `y = x * exp(s) + shift`
    Exp,
    /// `y = x / sigmoid(s + 2) + shift`
    Sigmoid,
    /// `y = x * sigmoid(s + 2) + shift`
    SigmoidInv,
}

/// Affine update of `z2` with shift and scale predicted from `z1`.
///
/// The network emits interleaved `(shift, scale)` channel pairs; without
/// `scale` it emits the shift alone and the coupling is additive.
#[derive(Module, Debug)]
pub struct AffineCoupling<B: Backend> {
    param_map: ConvNet2d<B>,
    scale: bool,
    scale_map: Ignored<ScaleMap>,
}

impl<B: Backend> AffineCoupling<B> {
    pub fn new(param_map: ConvNet2d<B>, scale: bool, scale_map: ScaleMap) -> Self {
        Self {
            param_map,
            scale,
            scale_map: Ignored(scale_map),
        }
    }

    fn shift_and_scale(&self, z1: Tensor<B, 4>, z2_dims: [usize; 4]) -> (Tensor<B, 4>, Option<Tensor<B, 4>>) {
        let param = self.param_map.forward(z1);
        if !self.scale {
            return (param, None);
        }
        let [b, c, h, w] = z2_dims;
        let param = param.reshape([b, c, 2, h, w]);
        let shift = param.clone().narrow(2, 0, 1).reshape(z2_dims);
        let scale = param.narrow(2, 1, 1).reshape(z2_dims);
        (shift, Some(scale))
    }

    /// Returns the updated `z2` and the log-det of the update.
    pub fn forward(&self, z1: Tensor<B, 4>, z2: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let batch = z2.dims()[0];
        let device = z2.device();
        let (shift, scale) = self.shift_and_scale(z1, z2.dims());
        let Some(s) = scale else {
            return (z2 + shift, Tensor::zeros([batch], &device));
        };
        match self.scale_map.0 {
            ScaleMap::Exp => (z2 * s.clone().exp() + shift, sum_except_batch(s)),
            ScaleMap::Sigmoid => {
                let log_sig = activation::log_sigmoid(s.add_scalar(2.0));
                (z2 * log_sig.clone().neg().exp() + shift, sum_except_batch(log_sig).neg())
            }
            ScaleMap::SigmoidInv => {
                let log_sig = activation::log_sigmoid(s.add_scalar(2.0));
                (z2 * log_sig.clone().exp() + shift, sum_except_batch(log_sig))
            }
        }
    }

    /// Undoes [`AffineCoupling::forward`] given the same `z1`.
    pub fn inverse(&self, z1: Tensor<B, 4>, z2: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let batch = z2.dims()[0];
        let device = z2.device();
        let (shift, scale) = self.shift_and_scale(z1, z2.dims());
        let Some(s) = scale else {
            return (z2 - shift, Tensor::zeros([batch], &device));
        };
        match self.scale_map.0 {
            ScaleMap::Exp => ((z2 - shift) * s.clone().neg().exp(), sum_except_batch(s).neg()),
            ScaleMap::Sigmoid => {
                let log_sig = activation::log_sigmoid(s.add_scalar(2.0));
                ((z2 - shift) * log_sig.clone().exp(), sum_except_batch(log_sig))
            }
            ScaleMap::SigmoidInv => {
                let log_sig = activation::log_sigmoid(s.add_scalar(2.0));
                ((z2 - shift) * log_sig.clone().neg().exp(), sum_except_batch(log_sig).neg())
            }
        }
    }
}

/// Split, couple, merge: an image coupling layer over the full tensor.
#[derive(Module, Debug)]
pub struct AffineCouplingBlock<B: Backend> {
    split: Split,
    coupling: AffineCoupling<B>,
    merge: Merge,
}

impl<B: Backend> AffineCouplingBlock<B> {
    pub fn new(split: Split, coupling: AffineCoupling<B>) -> Self {
        let merge = split.merge();
        Self {
            split,
            coupling,
            merge,
        }
    }

    pub fn split(&self) -> &Split {
        &self.split
    }
}

impl<B: Backend> Transform<B, 4> for AffineCouplingBlock<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z1, z2) = self.split.forward(x);
        let (z2, log_det) = self.coupling.forward(z1.clone(), z2);
        (self.merge.forward(z1, z2), log_det)
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z1, z2) = self.merge.inverse(y);
        let (z2, log_det) = self.coupling.inverse(z1.clone(), z2);
        (self.split.inverse(z1, z2), log_det)
    }
}
