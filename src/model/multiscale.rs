use burn::{
    module::Module,
    tensor::{Int, Tensor, backend::Backend},
};

use crate::distributions::ClassCondDistribution;
use crate::error::{FlowError, Result, raise};
use crate::flows::{ImageFlow, Logit, Merge, Transform, forward_stack, inverse_stack};
use crate::utils::check_batch;

/// Multiscale image flow with one class-conditional latent per resolution.
///
/// Level 0 is the coarsest: its latent is drawn straight from `bases[0]` and
/// pushed through `flows[0]`. Every later level `i` merges the running tensor
/// with a fresh latent from `bases[i]` via `merges[i - 1]` before running
/// `flows[i]`. Each level's stack is ordered from the data side, so a level
/// that upsamples typically reads `[Squeeze, GlowBlock, ..., GlowBlock]`.
#[derive(Module, Debug)]
pub struct MultiscaleFlow<B: Backend, Q> {
    bases: Vec<Q>,
    flows: Vec<Vec<ImageFlow<B>>>,
    merges: Vec<Merge>,
    transform: Option<Logit>,
}

impl<B: Backend, Q> MultiscaleFlow<B, Q>
where
    Q: ClassCondDistribution<B, 4> + Module<B>,
{
    pub fn new(
        bases: Vec<Q>,
        flows: Vec<Vec<ImageFlow<B>>>,
        merges: Vec<Merge>,
        transform: Option<Logit>,
    ) -> Result<Self> {
        let levels = bases.len();
        if levels == 0 || flows.len() != levels || merges.len() + 1 != levels {
            return Err(FlowError::LevelMismatch {
                bases: levels,
                flows: flows.len(),
                merges: merges.len(),
            });
        }
        tracing::debug!(
            levels,
            layers = flows.iter().map(Vec::len).sum::<usize>(),
            logit = transform.is_some(),
            "built multiscale flow"
        );
        Ok(Self {
            bases,
            flows,
            merges,
            transform,
        })
    }

    pub fn levels(&self) -> usize {
        self.bases.len()
    }

    pub fn sample(&self, num_samples: usize, y: Tensor<B, 1, Int>) -> (Tensor<B, 4>, Tensor<B, 1>) {
        self.sample_with_temperature(num_samples, y, None)
    }

    /// Samples with every base widened by `temperature` (`log_scale + ln t`).
    /// The returned log-density is that of the tempered model.
    pub fn sample_with_temperature(
        &self,
        num_samples: usize,
        y: Tensor<B, 1, Int>,
        temperature: Option<f64>,
    ) -> (Tensor<B, 4>, Tensor<B, 1>) {
        let (z, log_q0) = self.bases[0].sample_with_temperature(num_samples, y.clone(), temperature);
        let (mut x, log_det) = inverse_stack(&self.flows[0], z);
        let mut log_q = log_q0 - log_det;

        for level in 1..self.levels() {
            let (latent, log_q_level) =
                self.bases[level].sample_with_temperature(num_samples, y.clone(), temperature);
            let z = self.merges[level - 1].forward(x, latent);
            let (h, log_det) = inverse_stack(&self.flows[level], z);
            x = h;
            log_q = log_q + log_q_level - log_det;
        }

        if let Some(transform) = &self.transform {
            let (h, log_det) = transform.inverse_and_log_det(x);
            x = h;
            log_q = log_q - log_det;
        }
        (x, log_q)
    }

    pub fn log_prob(&self, x: Tensor<B, 4>, y: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.log_prob_with_temperature(x, y, None)
    }

    /// Exact log-density of `x`; the reverse walk of [`MultiscaleFlow::sample`].
    pub fn log_prob_with_temperature(
        &self,
        x: Tensor<B, 4>,
        y: Tensor<B, 1, Int>,
        temperature: Option<f64>,
    ) -> Tensor<B, 1> {
        let batch = x.dims()[0];
        raise(check_batch("multiscale log_prob", batch, y.dims()[0]));
        let (mut z, mut log_p) = match &self.transform {
            Some(transform) => transform.forward_and_log_det(x),
            None => {
                let zeros = Tensor::zeros([batch], &x.device());
                (x, zeros)
            }
        };

        for level in (1..self.levels()).rev() {
            let (h, log_det) = forward_stack(&self.flows[level], z);
            let (carry, latent) = self.merges[level - 1].inverse(h);
            log_p = log_p
                + log_det
                + self.bases[level].log_prob_with_temperature(latent, y.clone(), temperature);
            z = carry;
        }

        let (h, log_det) = forward_stack(&self.flows[0], z);
        log_p + log_det + self.bases[0].log_prob_with_temperature(h, y, temperature)
    }

    /// Negative log-likelihood per sample.
    pub fn forward(&self, x: Tensor<B, 4>, y: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.log_prob(x, y).neg()
    }

    pub fn forward_kld(&self, x: Tensor<B, 4>, y: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.forward(x, y).mean()
    }

    /// Data-dependent initialisation of every `ActNorm`, walking the density
    /// path once with the batch `x`.
    pub fn init_actnorm(mut self, x: Tensor<B, 4>) -> Self {
        let mut z = match &self.transform {
            Some(transform) => transform.forward(x),
            None => x,
        };

        for level in (0..self.levels()).rev() {
            let stack = std::mem::take(&mut self.flows[level]);
            let mut initialised = Vec::with_capacity(stack.len());
            for flow in stack {
                let (flow, h) = flow.init_actnorm(z);
                z = h;
                initialised.push(flow);
            }
            self.flows[level] = initialised;
            if level > 0 {
                z = self.merges[level - 1].inverse(z).0;
            }
        }
        tracing::debug!(levels = self.levels(), "initialised actnorm layers from data");
        self
    }
}
