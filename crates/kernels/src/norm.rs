//! Batch normalization in inference form.

use crate::utils::WeightInit;
use anyhow::{ensure, Result};
use ndarray::{Array1, Array3, ArrayView3, ArrayViewMut3, Axis, Zip};
use rayon::prelude::*;

pub const BATCH_NORM_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm {
    pub gamma: Array1<f32>,
    pub beta: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub epsilon: f32,
}

impl BatchNorm {
    pub fn new(channels: usize, init: &mut WeightInit) -> Self {
        Self {
            gamma: init.uniform(channels, 0.5, 1.5),
            beta: init.uniform(channels, -0.1, 0.1),
            running_mean: init.uniform(channels, -0.1, 0.1),
            running_var: init.uniform(channels, 0.5, 1.5),
            epsilon: BATCH_NORM_EPSILON,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    pub fn param_count(&self) -> usize {
        4 * self.channels()
    }

    /// Per-channel `(scale, shift)` so that `y = x * scale + shift`.
    pub fn folded(&self) -> (Array1<f32>, Array1<f32>) {
        let scale = Zip::from(&self.gamma)
            .and(&self.running_var)
            .map_collect(|gamma, var| gamma / (var + self.epsilon).sqrt());
        let shift = &self.beta - &(&self.running_mean * &scale);
        (scale, shift)
    }

    pub fn forward_inplace(&self, mut data: ArrayViewMut3<'_, f32>) -> Result<()> {
        ensure!(
            data.len_of(Axis(0)) == self.channels(),
            "batch norm over {} channels received {}",
            self.channels(),
            data.len_of(Axis(0))
        );
        let (scale, shift) = self.folded();
        data.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(channel, mut plane)| {
                let (scale, shift) = (scale[channel], shift[channel]);
                plane.mapv_inplace(|x| x * scale + shift);
            });
        Ok(())
    }

    pub fn forward(&self, data: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let mut output = data.to_owned();
        self.forward_inplace(output.view_mut())?;
        Ok(output)
    }
}
