use burn::{
    config::Config,
    module::Module,
    tensor::{Tensor, backend::Backend},
};

use super::{
    ActNorm, ActNormConfig, AffineCoupling, AffineCouplingBlock, Invertible1x1Conv,
    Invertible1x1ConvConfig, ScaleMap, Split, SplitMode, Transform,
};
use crate::nets::ConvNet2dConfig;

#[derive(Config, Debug)]
pub struct GlowBlockConfig {
    pub channels: usize,
    /// Width of the two hidden layers of the coupling network.
    pub hidden_channels: usize,
    /// `false` gives an additive coupling.
    #[config(default = true)]
    pub scale: bool,
    #[config(default = "ScaleMap::Sigmoid")]
    pub scale_map: ScaleMap,
    #[config(default = "SplitMode::Channel")]
    pub split_mode: SplitMode,
    #[config(default = 0.0)]
    pub leaky: f64,
    /// Zero the last coupling layer so the block starts near the identity.
    #[config(default = true)]
    pub init_zeros: bool,
}

impl GlowBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GlowBlock<B> {
        // Mixing a single channel is a no-op, ActNorm already covers its scale
        let mixing = (self.channels > 1)
            .then(|| Invertible1x1ConvConfig::new(self.channels).init(device));

        GlowBlock {
            actnorm: ActNormConfig::new(self.channels).init(device),
            mixing,
            coupling: self.init_coupling(device),
        }
    }

    /// A channel split of a single channel leaves one side empty, so such
    /// blocks couple over a checkerboard instead.
    fn effective_split_mode(&self) -> SplitMode {
        match self.split_mode {
            SplitMode::Channel if self.channels < 2 => SplitMode::Checkerboard,
            SplitMode::ChannelInv if self.channels < 2 => SplitMode::CheckerboardInv,
            ref mode => mode.clone(),
        }
    }

    /// The coupling step alone, for stacks that interleave their own mixing.
    pub fn init_coupling<B: Backend>(&self, device: &B::Device) -> AffineCouplingBlock<B> {
        let mode = self.effective_split_mode();
        if mode != self.split_mode {
            tracing::debug!(channels = self.channels, ?mode, "channel split replaced by checkerboard");
        }
        let split = Split::new(mode);
        let (in_channels, out_channels) = split.channels(self.channels);
        let params_per_channel = if self.scale { 2 } else { 1 };

        let param_map = ConvNet2dConfig::new(vec![
            in_channels,
            self.hidden_channels,
            self.hidden_channels,
            params_per_channel * out_channels,
        ])
        .with_leaky(self.leaky)
        .with_init_zeros(self.init_zeros)
        .init(device);

        AffineCouplingBlock::new(
            split,
            AffineCoupling::new(param_map, self.scale, self.scale_map.clone()),
        )
    }
}

/// One step of Glow: ActNorm, then invertible 1x1 mixing, then an affine coupling.
#[derive(Module, Debug)]
pub struct GlowBlock<B: Backend> {
    pub actnorm: ActNorm<B>,
    pub mixing: Option<Invertible1x1Conv<B>>,
    pub coupling: AffineCouplingBlock<B>,
}

impl<B: Backend> GlowBlock<B> {
    /// Initialises the ActNorm from `x` and returns the block's output on it.
    pub fn init_actnorm(mut self, x: Tensor<B, 4>) -> (Self, Tensor<B, 4>) {
        self.actnorm = self.actnorm.init_from_data(x.clone());
        let y = self.forward(x);
        (self, y)
    }
}

impl<B: Backend> Transform<B, 4> for GlowBlock<B> {
    fn forward_and_log_det(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (mut x, mut log_det) = self.actnorm.forward_and_log_det(x);
        if let Some(mixing) = &self.mixing {
            let (y, ld) = mixing.forward_and_log_det(x);
            x = y;
            log_det = log_det + ld;
        }
        let (y, ld) = self.coupling.forward_and_log_det(x);
        (y, log_det + ld)
    }

    fn inverse_and_log_det(&self, y: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (mut y, mut log_det) = self.coupling.inverse_and_log_det(y);
        if let Some(mixing) = &self.mixing {
            let (x, ld) = mixing.inverse_and_log_det(y);
            y = x;
            log_det = log_det + ld;
        }
        let (x, ld) = self.actnorm.inverse_and_log_det(y);
        (x, log_det + ld)
    }
}
