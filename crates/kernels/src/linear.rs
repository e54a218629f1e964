//! Fully-connected layer over flat feature vectors.

use crate::utils::WeightInit;
use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// `[out_features, in_features]`, the layout Gemm expects with `transB`.
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, init: &mut WeightInit) -> Self {
        Self {
            weight: init.fan_in((out_features, in_features), in_features),
            bias: init.fan_in(out_features, in_features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.len_of(Axis(1))
    }

    pub fn out_features(&self) -> usize {
        self.weight.len_of(Axis(0))
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, input: ArrayView1<'_, f32>) -> Result<Array1<f32>> {
        ensure!(
            input.len() == self.in_features(),
            "fc expects {} features, got {}",
            self.in_features(),
            input.len()
        );
        let values: Vec<f32> = self
            .weight
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .map(|(out, row)| row.dot(&input) + self.bias[out])
            .collect();
        Ok(Array1::from(values))
    }
}
