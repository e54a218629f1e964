//! Squeeze-and-excite channel attention.

use crate::activation::hard_sigmoid;
use crate::linear::Linear;
use crate::pool::global_average_pool;
use crate::shape::make_divisible;
use crate::utils::WeightInit;
use anyhow::{ensure, Result};
use ndarray::{Array3, ArrayView3, Axis};

/// `x * hard_sigmoid(expand(relu(reduce(avg_pool(x)))))`, with both
/// projections acting as 1x1 convolutions on the pooled vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SqueezeExcite {
    pub reduce: Linear,
    pub expand: Linear,
}

impl SqueezeExcite {
    pub fn new(channels: usize, init: &mut WeightInit) -> Self {
        let mid = squeeze_channels(channels);
        Self {
            reduce: Linear::new(channels, mid, init),
            expand: Linear::new(mid, channels, init),
        }
    }

    pub fn channels(&self) -> usize {
        self.reduce.in_features()
    }

    pub fn mid_channels(&self) -> usize {
        self.reduce.out_features()
    }

    pub fn param_count(&self) -> usize {
        self.reduce.param_count() + self.expand.param_count()
    }

    pub fn forward(&self, input: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        ensure!(
            input.len_of(Axis(0)) == self.channels(),
            "se over {} channels received {}",
            self.channels(),
            input.len_of(Axis(0))
        );
        let pooled = global_average_pool(input);
        let hidden = self.reduce.forward(pooled.view())?.mapv(|x| x.max(0.0));
        let gate = self.expand.forward(hidden.view())?.mapv(hard_sigmoid);

        let mut output = input.to_owned();
        for (mut plane, scale) in output.axis_iter_mut(Axis(0)).zip(gate.iter()) {
            plane *= *scale;
        }
        Ok(output)
    }
}

/// Width of the squeezed representation: `make_divisible(C / 4, 8)`.
pub fn squeeze_channels(channels: usize) -> usize {
    make_divisible(channels as f64 / 4.0, 8)
}
