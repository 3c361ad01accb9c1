use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        Initializer, Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    tensor::{Tensor, activation, backend::Backend},
};

// --- OUTPUT ACTIVATION ---

/// Optional bounded activation applied to the last layer of an [`Mlp`].
///
/// Bounding the log-scale output of a coupling network keeps `exp(s)` from
/// overflowing; scale it with [`MlpConfig::output_scale`].
#[derive(Config, Debug, PartialEq)]
pub enum OutputActivation {
    Tanh,
    Sigmoid,
    Relu,
}

impl OutputActivation {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            OutputActivation::Tanh => activation::tanh(x),
            OutputActivation::Sigmoid => activation::sigmoid(x),
            OutputActivation::Relu => activation::relu(x),
        }
    }
}

// --- MLP ---

#[derive(Config, Debug)]
pub struct MlpConfig {
    /// Layer widths including input and output, e.g. `[2, 64, 64, 2]`.
    pub layers: Vec<usize>,
    /// Negative slope of the hidden activations (0 gives ReLU).
    #[config(default = 0.0)]
    pub leaky: f64,
    /// Zero the last layer so the network starts out outputting zeros.
    #[config(default = false)]
    pub init_zeros: bool,
    #[config(default = "None")]
    pub output_activation: Option<OutputActivation>,
    #[config(default = 1.0)]
    pub output_scale: f64,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        assert!(
            self.layers.len() >= 2,
            "an MLP needs at least input and output widths, got {:?}",
            self.layers
        );
        let last = self.layers.len() - 2;
        let layers = self
            .layers
            .windows(2)
            .enumerate()
            .map(|(i, dims)| {
                let config = LinearConfig::new(dims[0], dims[1]);
                if i == last && self.init_zeros {
                    config.with_initializer(Initializer::Zeros).init(device)
                } else {
                    config.init(device)
                }
            })
            .collect();

        Mlp {
            layers,
            leaky: self.leaky,
            output_activation: Ignored(self.output_activation.clone()),
            output_scale: self.output_scale,
        }
    }
}

/// Fully connected network used as scale/translation map of vector couplings
/// and as encoder/decoder trunk.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
    leaky: f64,
    output_activation: Ignored<Option<OutputActivation>>,
    output_scale: f64,
}

impl<B: Backend> Mlp<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last = self.layers.len() - 1;
        let mut x = x;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = activation::leaky_relu(x, self.leaky);
            }
        }
        match &self.output_activation.0 {
            Some(output) => output.forward(x).mul_scalar(self.output_scale),
            None => x,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].weight.val().dims()[0]
    }

    pub fn output_dim(&self) -> usize {
        self.layers[self.layers.len() - 1].weight.val().dims()[1]
    }
}

// --- CONV NET ---

#[derive(Config, Debug)]
pub struct ConvNet2dConfig {
    /// Channel counts including input and output, one more than `kernel_sizes`.
    pub channels: Vec<usize>,
    #[config(default = "vec![3, 1, 3]")]
    pub kernel_sizes: Vec<usize>,
    #[config(default = 0.0)]
    pub leaky: f64,
    #[config(default = true)]
    pub init_zeros: bool,
}

impl ConvNet2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNet2d<B> {
        assert_eq!(
            self.channels.len(),
            self.kernel_sizes.len() + 1,
            "conv net needs one more channel count than kernel sizes"
        );
        let last = self.kernel_sizes.len() - 1;
        let layers = self
            .kernel_sizes
            .iter()
            .enumerate()
            .map(|(i, &k)| {
                // Odd kernels with k/2 padding keep the spatial size.
                let config = Conv2dConfig::new([self.channels[i], self.channels[i + 1]], [k, k])
                    .with_padding(PaddingConfig2d::Explicit(k / 2, k / 2));
                if i == last && self.init_zeros {
                    config.with_initializer(Initializer::Zeros).init(device)
                } else {
                    config.init(device)
                }
            })
            .collect();

        ConvNet2d {
            layers,
            leaky: self.leaky,
        }
    }
}

/// Convolutional parameter map of the Glow affine coupling.
#[derive(Module, Debug)]
pub struct ConvNet2d<B: Backend> {
    layers: Vec<Conv2d<B>>,
    leaky: f64,
}

impl<B: Backend> ConvNet2d<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let last = self.layers.len() - 1;
        let mut x = x;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = activation::leaky_relu(x, self.leaky);
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;
    use rstest::*;

    type TestBackend = NdArray<f32>;

    #[fixture]
    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    #[rstest]
    #[case::shallow(vec![2, 4, 2], 5)]
    #[case::deep(vec![10, 16, 16, 6], 3)]
    fn mlp_output_shape(
        device: <TestBackend as Backend>::Device,
        #[case] layers: Vec<usize>,
        #[case] batch: usize,
    ) {
        let mlp = MlpConfig::new(layers.clone()).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random([batch, layers[0]], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(mlp.forward(x).dims(), [batch, layers[layers.len() - 1]]);
        assert_eq!(mlp.input_dim(), layers[0]);
        assert_eq!(mlp.output_dim(), layers[layers.len() - 1]);
    }

    #[rstest]
    fn zero_init_mlp_outputs_zeros(device: <TestBackend as Backend>::Device) {
        let mlp = MlpConfig::new(vec![3, 6, 3])
            .with_init_zeros(true)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random([4, 3], Distribution::Normal(0.0, 1.0), &device);
        let max = mlp.forward(x).abs().max().into_scalar();
        assert_eq!(max, 0.0);
    }

    #[rstest]
    fn bounded_output_respects_scale(device: <TestBackend as Backend>::Device) {
        let mlp = MlpConfig::new(vec![2, 8, 2])
            .with_output_activation(Some(OutputActivation::Tanh))
            .with_output_scale(1.5)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::random([64, 2], Distribution::Normal(0.0, 100.0), &device);
        let max = mlp.forward(x).abs().max().into_scalar();
        assert!(max <= 1.5 + 1e-6, "tanh output escaped its bound: {max}");
    }

    #[rstest]
    #[case::glow_default(vec![6, 32, 32, 12], vec![3, 1, 3])]
    #[case::single_layer(vec![4, 8], vec![3])]
    fn conv_net_keeps_spatial_size(
        device: <TestBackend as Backend>::Device,
        #[case] channels: Vec<usize>,
        #[case] kernels: Vec<usize>,
    ) {
        let net = ConvNet2dConfig::new(channels.clone())
            .with_kernel_sizes(kernels)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, channels[0], 4, 6], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(net.forward(x).dims(), [2, channels[channels.len() - 1], 4, 6]);
    }

    #[rstest]
    fn zero_init_conv_net_outputs_zeros(device: <TestBackend as Backend>::Device) {
        let net = ConvNet2dConfig::new(vec![2, 8, 8, 4]).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 2, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(net.forward(x).abs().max().into_scalar(), 0.0);
    }
}
