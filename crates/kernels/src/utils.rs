//! Shared helpers for operator implementations.

use crate::shape::TensorShape;
use anyhow::{ensure, Result};
use ndarray::{Array, ArrayD, Dimension, IxDyn, ShapeBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Runtime tensor on a block's data path (no batch dimension).
pub type Tensor = ArrayD<f32>;

/// Seeded source of representative (untrained) parameters.
///
/// Latency does not depend on parameter values, but blocks built from the
/// same configuration must be identical, so every operator draws from a
/// generator seeded by its position in the block.
pub struct WeightInit {
    rng: StdRng,
}

impl WeightInit {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn fan_in<Sh, D>(&mut self, shape: Sh, fan_in: usize) -> Array<f32, D>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        self.uniform(shape, -bound, bound)
    }

    pub fn uniform<Sh, D>(&mut self, shape: Sh, low: f32, high: f32) -> Array<f32, D>
    where
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        let rng = &mut self.rng;
        Array::from_shape_simple_fn(shape, || rng.gen_range(low..high))
    }
}

/// Deterministic, non-constant input tensor for a shape.
pub fn deterministic_tensor(shape: &TensorShape) -> Tensor {
    let dims = shape.dims();
    let mut index = 0usize;
    ArrayD::from_shape_simple_fn(IxDyn(&dims), || {
        let seed = (index * 1313) ^ (index / 7 * 7331);
        index += 1;
        (seed % 17) as f32 / 8.0 - 1.0
    })
}

pub fn ensure_shape(tensor: &Tensor, expected: &TensorShape, op: &str) -> Result<()> {
    ensure!(
        tensor.shape() == expected.dims().as_slice(),
        "{op}: input tensor {:?} does not match declared shape {}",
        tensor.shape(),
        expected
    );
    Ok(())
}

pub fn ensure_arity(inputs: &[Tensor], expected: usize, op: &str) -> Result<()> {
    ensure!(
        inputs.len() == expected,
        "{op}: expected {expected} input tensor(s), got {}",
        inputs.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_init_is_reproducible_per_seed() {
        let a = WeightInit::new(7).fan_in((4, 3), 3);
        let b = WeightInit::new(7).fan_in((4, 3), 3);
        let c = WeightInit::new(8).fan_in((4, 3), 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let bound = 1.0 / 3f32.sqrt();
        assert!(a.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn deterministic_tensor_matches_shape() {
        let tensor = deterministic_tensor(&TensorShape::square(3, 5));
        assert_eq!(tensor.shape(), &[3, 5, 5]);
        assert_eq!(tensor, deterministic_tensor(&TensorShape::square(3, 5)));
    }
}
