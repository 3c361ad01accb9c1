#![recursion_limit = "256"]

use burn::tensor::ElementConversion;
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::backend::{AutodiffBackend, Backend},
};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nflows::NormalizingFlow;
use nflows::distributions::{CircularGaussianMixture, DiagGaussian, DiagGaussianConfig, TwoMoons};
use nflows::flows::{MaskedAffineFlowConfig, VectorFlow};
use nflows::nets::OutputActivation;

// --- CONFIG ---

/// Two-dimensional densities the demo can fit.
#[derive(Config, Debug, PartialEq)]
pub enum TargetKind {
    CircularMixture,
    TwoMoons,
}

#[derive(Config, Debug)]
pub struct TrainConfig {
    #[config(default = "TargetKind::TwoMoons")]
    pub target: TargetKind,
    /// Modes of the circular mixture; ignored for `TwoMoons`.
    #[config(default = 8)]
    pub num_modes: usize,
    #[config(default = 16)]
    pub num_layers: usize,
    #[config(default = "vec![64, 64]")]
    pub hidden: Vec<usize>,
    /// Bound on the log-scale of every coupling, `None` leaves it free.
    #[config(default = "Some(2.0)")]
    pub scale_bound: Option<f64>,
    #[config(default = 2000)]
    pub num_iterations: usize,
    #[config(default = 256)]
    pub num_samples: usize,
    /// Iterations over which the target weight ramps from 0 to 1.
    #[config(default = 500)]
    pub annealing_iterations: usize,
    #[config(default = false)]
    pub score_fn: bool,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 1e-5)]
    pub weight_decay: f32,
    #[config(default = 100)]
    pub log_every: usize,
}

// --- CLI ---

/// Fits a Real NVP flow to a 2-D target density by reverse KL.
#[derive(Parser, Debug)]
#[command(author, version, about = "Normalizing flow trainer")]
struct Args {
    /// JSON `TrainConfig` to start from instead of the defaults.
    #[arg(short, long)]
    config: Option<String>,

    /// Overrides the number of optimisation steps.
    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    /// Fit the circular Gaussian mixture instead of the two moons.
    #[arg(long)]
    circular: bool,

    /// Writes the effective configuration to this path as JSON.
    #[arg(long)]
    save_config: Option<String>,
}

fn build_model<B: Backend>(
    config: &TrainConfig,
    device: &B::Device,
) -> NormalizingFlow<B, DiagGaussian<B>> {
    let flows: Vec<VectorFlow<B>> = (0..config.num_layers)
        .map(|i| {
            let layer = MaskedAffineFlowConfig::new(2)
                .with_hidden(config.hidden.clone())
                .with_parity(i % 2);
            let layer = match config.scale_bound {
                Some(bound) => layer
                    .with_scale_activation(Some(OutputActivation::Tanh))
                    .with_scale_bound(bound),
                None => layer,
            };
            layer.init::<B>(device).into()
        })
        .collect();
    NormalizingFlow::new(DiagGaussianConfig::new(vec![2]).init(device), flows)
}

// --- TRAINING LOOP ---

fn training_loop<B: AutodiffBackend>(config: &TrainConfig, device: B::Device) {
    info!(?device, "using device");

    let mut model = build_model::<B>(config, &device);
    info!(params = model.num_params(), layers = config.num_layers, "model ready");

    let mut optimizer = AdamConfig::new()
        .with_weight_decay(Some(burn::optim::decay::WeightDecayConfig {
            penalty: config.weight_decay,
        }))
        .init();

    let circular = CircularGaussianMixture::new(config.num_modes);
    let mut running_loss = 0.0;
    let mut counted = 0;

    for iteration in 1..=config.num_iterations {
        let beta = if config.annealing_iterations == 0 {
            1.0
        } else {
            (iteration as f64 / config.annealing_iterations as f64).min(1.0)
        };

        let loss = match config.target {
            TargetKind::CircularMixture => {
                model.reverse_kld(&circular, config.num_samples, beta, config.score_fn)
            }
            TargetKind::TwoMoons => {
                model.reverse_kld(&TwoMoons, config.num_samples, beta, config.score_fn)
            }
        };

        let loss_val = loss.clone().into_scalar().elem::<f64>();
        if !loss_val.is_finite() {
            warn!(iteration, "non-finite loss, skipping step");
            continue;
        }
        running_loss += loss_val;
        counted += 1;

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optimizer.step(config.learning_rate, model, grads);

        if iteration % config.log_every == 0 {
            info!(
                iteration,
                beta,
                loss = running_loss / counted as f64,
                "reverse KL"
            );
            running_loss = 0.0;
            counted = 0;
        }
    }

    // Evaluate without the autodiff graph
    let model = model.valid();
    let loss = match config.target {
        TargetKind::CircularMixture => model.reverse_kld(&circular, 4 * config.num_samples, 1.0, false),
        TargetKind::TwoMoons => model.reverse_kld(&TwoMoons, 4 * config.num_samples, 1.0, false),
    };
    info!(loss = loss.into_scalar().elem::<f64>(), "final reverse KL");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::new(),
    };
    if let Some(iterations) = args.iterations {
        config.num_iterations = iterations;
    }
    if args.circular {
        config.target = TargetKind::CircularMixture;
    }
    info!(?config, "configuration");
    if let Some(path) = &args.save_config {
        config.save(path)?;
        info!(path, "saved configuration");
    }

    #[cfg(feature = "wgpu")]
    {
        use burn_wgpu::{Wgpu, WgpuDevice};
        training_loop::<burn::backend::Autodiff<Wgpu>>(&config, WgpuDevice::DefaultDevice);
    }
    #[cfg(not(feature = "wgpu"))]
    {
        use burn::backend::ndarray::{NdArray, NdArrayDevice};
        training_loop::<burn::backend::Autodiff<NdArray>>(&config, NdArrayDevice::Cpu);
    }
    Ok(())
}
