use burn::{
    module::{Module, ModuleDisplay},
    tensor::{Int, Tensor, backend::Backend},
};

use crate::distributions::{BaseDistribution, ClassCondDistribution, Target};
use crate::error::raise;
use crate::flows::{Transform, VectorFlow, forward_stack, inverse_stack};
use crate::utils::{check_batch, log_sum_exp};

/// `sign(alpha - 1)`, zero at `alpha == 1`.
fn alpha_sign(alpha: f64) -> f64 {
    if alpha > 1.0 {
        1.0
    } else if alpha < 1.0 {
        -1.0
    } else {
        0.0
    }
}

// --- NORMALIZING FLOW ---

/// A stack of vector flows over a base distribution `Q`.
///
/// `flows[0]` touches the data; the last flow feeds the base distribution.
#[derive(Module, Debug)]
pub struct NormalizingFlow<B: Backend, Q> {
    pub base: Q,
    pub flows: Vec<VectorFlow<B>>,
}

impl<B: Backend, Q> NormalizingFlow<B, Q>
where
    Q: BaseDistribution<B, 2> + Module<B> + ModuleDisplay,
{
    pub fn new(base: Q, flows: Vec<VectorFlow<B>>) -> Self {
        tracing::debug!(layers = flows.len(), "built normalizing flow");
        Self { base, flows }
    }

    /// Exact log-density of `x`, shape `(batch,)`.
    pub fn log_prob(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let (z, log_det) = forward_stack(&self.flows, x);
        self.base.log_prob(z) + log_det
    }

    /// Draws `num_samples` points with their model log-density.
    pub fn sample(&self, num_samples: usize) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (z, log_q) = self.base.sample(num_samples);
        let (x, log_det) = inverse_stack(&self.flows, z);
        (x, log_q - log_det)
    }

    /// `KL(p || q)` up to a constant, estimated from data samples `x`.
    pub fn forward_kld(&self, x: Tensor<B, 2>) -> Tensor<B, 1> {
        self.log_prob(x).mean().neg()
    }

    /// `KL(q || p)` estimated from `num_samples` model draws.
    ///
    /// With `score_fn` the draws are cut from the graph and the gradient of
    /// the expectation comes from the score-function identity; otherwise it
    /// flows through the reparameterised sample path. `beta` weights the
    /// target term, for annealing.
    pub fn reverse_kld<T: Target<B, 2>>(
        &self,
        target: &T,
        num_samples: usize,
        beta: f64,
        score_fn: bool,
    ) -> Tensor<B, 1> {
        let (x, log_q) = self.sample(num_samples);
        if !score_fn {
            let log_p = target.log_prob(x);
            return log_q.mean() - log_p.mean().mul_scalar(beta);
        }

        let x = x.detach();
        let log_q = self.log_prob(x.clone());
        let f = log_q.clone() - target.log_prob(x).mul_scalar(beta);
        // Zero in value; its gradient is E[f * grad log q].
        let surrogate = f.clone().detach() * (log_q.clone() - log_q.detach());
        f.mean() + surrogate.mean()
    }

    /// Reverse alpha-divergence from `num_samples` model draws.
    ///
    /// `dreg` switches to the doubly reparameterised gradient estimator, in
    /// which the density of the draws is re-evaluated through a copy of the
    /// model whose parameters are frozen.
    pub fn reverse_alpha_div<T: Target<B, 2>>(
        &self,
        target: &T,
        num_samples: usize,
        alpha: f64,
        dreg: bool,
    ) -> Tensor<B, 1> {
        let (x, log_q) = self.sample(num_samples);
        let log_p = target.log_prob(x.clone());
        if !dreg {
            return log_sum_exp((log_p - log_q).mul_scalar(alpha)).mul_scalar(alpha_sign(alpha));
        }

        let w_const = (log_p.clone() - log_q).exp().detach();
        let log_q = self.clone().no_grad().log_prob(x);
        let log_w = log_p - log_q;

        let w_alpha = w_const.powf_scalar(alpha);
        let w_alpha = w_alpha.clone() / w_alpha.mean();
        let weights = w_alpha.clone().mul_scalar(1.0 - alpha) + w_alpha.powf_scalar(2.0).mul_scalar(alpha);
        (weights * log_w).mean().mul_scalar(-alpha)
    }
}

impl<B: Backend, Q: Module<B>> Transform<B, 2> for NormalizingFlow<B, Q> {
    fn forward_and_log_det(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        forward_stack(&self.flows, x)
    }

    fn inverse_and_log_det(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        inverse_stack(&self.flows, z)
    }
}

// --- CLASS-CONDITIONAL FLOW ---

/// A vector flow whose base distribution depends on a class label.
#[derive(Module, Debug)]
pub struct ClassCondFlow<B: Backend, Q> {
    pub base: Q,
    pub flows: Vec<VectorFlow<B>>,
}

impl<B: Backend, Q> ClassCondFlow<B, Q>
where
    Q: ClassCondDistribution<B, 2> + Module<B>,
{
    pub fn new(base: Q, flows: Vec<VectorFlow<B>>) -> Self {
        tracing::debug!(layers = flows.len(), "built class-conditional flow");
        Self { base, flows }
    }

    pub fn log_prob(&self, x: Tensor<B, 2>, y: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        raise(check_batch("class-conditional log_prob", x.dims()[0], y.dims()[0]));
        let (z, log_det) = forward_stack(&self.flows, x);
        self.base.log_prob(z, y) + log_det
    }

    /// Draws one sample per label in `y`.
    pub fn sample(&self, num_samples: usize, y: Tensor<B, 1, Int>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (z, log_q) = self.base.sample(num_samples, y);
        let (x, log_det) = inverse_stack(&self.flows, z);
        (x, log_q - log_det)
    }

    pub fn forward_kld(&self, x: Tensor<B, 2>, y: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.log_prob(x, y).mean().neg()
    }
}

impl<B: Backend, Q: Module<B>> Transform<B, 2> for ClassCondFlow<B, Q> {
    fn forward_and_log_det(&self, x: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        forward_stack(&self.flows, x)
    }

    fn inverse_and_log_det(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        inverse_stack(&self.flows, z)
    }
}
