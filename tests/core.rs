use burn::tensor::{Distribution, Int, Tensor, TensorData, backend::Backend};
use burn_ndarray::NdArray;
use rstest::*;

use nflows::distributions::{
    CircularGaussianMixture, ClassCondDiagGaussian, ClassCondDiagGaussianConfig, DecoderConfig,
    DiagGaussianConfig, EncoderConfig,
};
use nflows::flows::{
    GlowBlockConfig, ImageFlow, MaskedAffineFlowConfig, Merge, Permute, PermuteMode, SplitMode,
    Squeeze, VectorFlow,
};
use nflows::{ClassCondFlow, MultiscaleFlow, NormalizingFlow, NormalizingFlowVAE, Transform};

type TestBackend = NdArray<f32>;
type Device = <TestBackend as Backend>::Device;

#[fixture]
fn device() -> Device {
    Default::default()
}

fn max_abs(t: Tensor<TestBackend, 1>) -> f32 {
    t.abs().max().into_scalar()
}

fn vector_flows(num_layers: usize, dim: usize, device: &Device) -> Vec<VectorFlow<TestBackend>> {
    let mut flows = Vec::new();
    for i in 0..num_layers {
        flows.push(
            MaskedAffineFlowConfig::new(dim)
                .with_hidden(vec![8, 8])
                .with_parity(i % 2)
                .with_init_zeros(false)
                .init::<TestBackend>(device)
                .into(),
        );
        flows.push(Permute::new::<TestBackend>(dim, PermuteMode::Swap, device).into());
    }
    flows
}

#[rstest]
#[case(2)]
#[case(5)]
fn normalizing_flow_objectives(device: Device, #[case] num_layers: usize) {
    let model = NormalizingFlow::new(
        DiagGaussianConfig::new(vec![2]).init::<TestBackend>(&device),
        vector_flows(num_layers, 2, &device),
    );
    let target = CircularGaussianMixture::default();
    let x = Tensor::<TestBackend, 2>::random([5, 2], Distribution::Normal(0.0, 1.0), &device);

    assert_eq!(model.log_prob(x.clone()).dims(), [5]);
    let (sample, log_q) = model.sample(5);
    assert_eq!(sample.dims(), [5, 2]);
    assert_eq!(log_q.dims(), [5]);

    for loss in [
        model.forward_kld(x.clone()),
        model.reverse_kld(&target, 5, 1.0, true),
        model.reverse_kld(&target, 5, 1.0, false),
        model.reverse_alpha_div(&target, 5, 0.5, false),
        model.reverse_alpha_div(&target, 5, 0.5, true),
    ] {
        assert_eq!(loss.dims(), [1]);
        assert!(loss.into_scalar().is_finite());
    }

    let (z, ld_fwd) = model.forward_and_log_det(x.clone());
    let (x_rec, ld_inv) = model.inverse_and_log_det(z);
    assert!((x_rec - x).abs().max().into_scalar() < 1e-4);
    assert!(max_abs(ld_fwd + ld_inv) < 1e-4);
}

#[rstest]
fn class_conditional_flow_shapes(device: Device) {
    let model = ClassCondFlow::new(
        ClassCondDiagGaussianConfig::new(vec![2], 3).init::<TestBackend>(&device),
        vector_flows(2, 2, &device),
    );
    let x = Tensor::<TestBackend, 2>::random([5, 2], Distribution::Normal(0.0, 1.0), &device);
    let y = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0, 1, 2, 1, 0]), &device);

    assert_eq!(model.log_prob(x.clone(), y.clone()).dims(), [5]);
    let (sample, log_q) = model.sample(5, y.clone());
    assert_eq!(sample.dims(), [5, 2]);
    assert_eq!(log_q.dims(), [5]);
    assert_eq!(model.forward_kld(x, y).dims(), [1]);
}

/// `L` levels of two Glow blocks each over data of shape `input_shape`.
///
/// Level `i` runs at `C * 2^(L + 1 - i)` channels; level 0 keeps its whole
/// tensor as latent while every other level hands half of it back.
fn multiscale(
    levels: usize,
    num_classes: usize,
    input_shape: [usize; 3],
    device: &Device,
) -> MultiscaleFlow<TestBackend, ClassCondDiagGaussian<TestBackend>> {
    let [c, h, w] = input_shape;
    let mut bases = Vec::new();
    let mut flows = Vec::new();
    let mut merges = Vec::new();

    for i in 0..levels {
        let channels = c * 2usize.pow((levels + 1 - i) as u32);
        let mut stack: Vec<ImageFlow<TestBackend>> = vec![Squeeze.into()];
        for _ in 0..2 {
            stack.push(GlowBlockConfig::new(channels, 8).init::<TestBackend>(device).into());
        }
        flows.push(stack);

        let latent_shape = if i == 0 {
            vec![channels, h >> levels, w >> levels]
        } else {
            merges.push(Merge::new(SplitMode::Channel));
            let down = levels - i;
            vec![c << down, h >> down, w >> down]
        };
        bases.push(ClassCondDiagGaussianConfig::new(latent_shape, num_classes).init::<TestBackend>(device));
    }
    MultiscaleFlow::new(bases, flows, merges, None).unwrap()
}

#[rstest]
#[case(2, 1, [3, 8, 8])]
#[case(3, 5, [1, 16, 16])]
fn multiscale_flow_consistency(
    device: Device,
    #[case] levels: usize,
    #[case] num_classes: usize,
    #[case] input_shape: [usize; 3],
) {
    let model = multiscale(levels, num_classes, input_shape, &device);
    let labels: Vec<i64> = (0..5).map(|i| (i % num_classes) as i64).collect();
    let y = Tensor::<TestBackend, 1, Int>::from_data(TensorData::new(labels, [5]), &device);

    let (x, log_q) = model.sample(5, y.clone());
    let [c, h, w] = input_shape;
    assert_eq!(x.dims(), [5, c, h, w]);
    assert_eq!(log_q.dims(), [5]);
    assert_eq!(x.dtype(), log_q.dtype());

    let log_p = model.log_prob(x.clone(), y.clone());
    let tol = 1e-4 * (1.0 + log_q.clone().abs().max().into_scalar());
    assert!(max_abs(log_p - log_q) < tol);

    let nll = model.forward(x.clone(), y.clone());
    assert_eq!(nll.dims(), [5]);
    let kld = model.forward_kld(x, y);
    assert!(max_abs(nll.mean() - kld) < 1e-4);
}

#[rstest]
#[case(1)]
#[case(4)]
fn vae_output_shapes(device: Device, #[case] num_samples: usize) {
    let model = NormalizingFlowVAE::new(
        EncoderConfig::new(10, 3).with_hidden_dims(vec![16]).init::<TestBackend>(&device),
        vector_flows(2, 3, &device),
        DecoderConfig::new(3, 10).with_hidden_dims(vec![16]).init::<TestBackend>(&device),
    );
    let x = Tensor::<TestBackend, 2>::random([5, 10], Distribution::Normal(0.0, 1.0), &device);

    let (z, log_p, log_q) = model.forward(x, num_samples);
    assert_eq!(z.dims(), [5, num_samples, 3]);
    assert_eq!(log_p.dims(), [5, num_samples]);
    assert_eq!(log_q.dims(), [5, num_samples]);
    assert_eq!(nflows::iwae_loss(log_p, log_q).dims(), [1]);
}

#[rstest]
#[should_panic(expected = "class label out of range")]
fn out_of_range_label_panics(device: Device) {
    let model = ClassCondFlow::new(
        ClassCondDiagGaussianConfig::new(vec![2], 3).init::<TestBackend>(&device),
        vector_flows(1, 2, &device),
    );
    let x = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
    let y = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0, 3]), &device);
    let _ = model.log_prob(x, y);
}

#[rstest]
#[should_panic(expected = "not divisible by 2")]
fn odd_spatial_size_cannot_be_squeezed(device: Device) {
    let x = Tensor::<TestBackend, 4>::zeros([1, 1, 3, 4], &device);
    let _ = Transform::<TestBackend, 4>::forward(&Squeeze, x);
}
