use burn::prelude::ElementConversion;
use burn::tensor::{Int, Tensor, backend::Backend};

use crate::error::{FlowError, Result};

/// Builds the full `[batch, *event_shape]` dimension array for a rank-`D` tensor.
pub fn batch_shape<const D: usize>(batch: usize, event_shape: &[usize]) -> [usize; D] {
    assert_eq!(
        event_shape.len() + 1,
        D,
        "event shape {event_shape:?} does not fit a rank-{D} tensor"
    );
    let mut dims = [batch; D];
    dims[1..].copy_from_slice(event_shape);
    dims
}

/// Sums every axis but the leading batch axis: `(batch, ...) -> (batch,)`.
pub fn sum_except_batch<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, 1> {
    let batch = x.dims()[0];
    x.reshape([batch as i32, -1]).sum_dim(1).reshape([batch])
}

/// Numerically stable `log(sum(exp(x)))` over a 1-D tensor, returned with shape `[1]`.
pub fn log_sum_exp<B: Backend>(x: Tensor<B, 1>) -> Tensor<B, 1> {
    let max = x.clone().max().detach();
    (x - max.clone()).exp().sum().log() + max
}

/// Stable log-sum-exp along `dim`; the reduced axis is kept with size 1.
pub fn log_sum_exp_dim<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize) -> Tensor<B, D> {
    let max = x.clone().max_dim(dim).detach();
    (x - max.clone()).exp().sum_dim(dim).log() + max
}

/// Checks two batch sizes agree.
pub fn check_batch(context: &'static str, left: usize, right: usize) -> Result<()> {
    if left != right {
        return Err(FlowError::BatchMismatch {
            context,
            left,
            right,
        });
    }
    Ok(())
}

/// Checks a label batch has the expected size and values in `[0, num_classes)`.
pub fn check_labels<B: Backend>(
    y: &Tensor<B, 1, Int>,
    batch: usize,
    num_classes: usize,
) -> Result<()> {
    check_batch("class labels", y.dims()[0], batch)?;
    if batch == 0 {
        return Ok(());
    }
    let min = y.clone().min().into_scalar().elem::<i64>();
    let max = y.clone().max().into_scalar().elem::<i64>();
    if min < 0 || max >= num_classes as i64 {
        return Err(FlowError::LabelOutOfRange {
            min,
            max,
            num_classes,
        });
    }
    Ok(())
}
