//! Max and average pooling in ceil mode without padding.

use crate::shape::{ceil_pool_output, TensorShape};
use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2d {
    pub mode: PoolMode,
    pub kernel_size: usize,
    pub stride: usize,
}

impl Pool2d {
    pub fn new(mode: PoolMode, kernel_size: usize, stride: usize) -> Self {
        Self {
            mode,
            kernel_size,
            stride,
        }
    }

    /// Output shape, or `None` when the window does not fit.
    pub fn output_shape(&self, channels: usize, height: usize, width: usize) -> Option<TensorShape> {
        let out_h = ceil_pool_output(height, self.kernel_size, self.stride)?;
        let out_w = ceil_pool_output(width, self.kernel_size, self.stride)?;
        Some(TensorShape::spatial(channels, out_h, out_w))
    }

    /// Pools every channel plane. A window clipped by the input edge only
    /// covers its valid elements, so averages divide by that count.
    pub fn forward(&self, input: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        let shape = self
            .output_shape(channels, height, width)
            .ok_or_else(|| {
                anyhow!(
                    "pool window {} does not fit a {height}x{width} input",
                    self.kernel_size
                )
            })?;
        let dims = shape.dims();
        let (out_h, out_w) = (dims[1], dims[2]);
        let (k, stride, mode) = (self.kernel_size, self.stride, self.mode);

        let planes: Vec<Array2<f32>> = input
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|plane| {
                Array2::from_shape_fn((out_h, out_w), |(oy, ox)| {
                    let (y0, x0) = (oy * stride, ox * stride);
                    let window = plane.slice(ndarray::s![
                        y0..(y0 + k).min(height),
                        x0..(x0 + k).min(width)
                    ]);
                    match mode {
                        PoolMode::Max => window.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x)),
                        PoolMode::Avg => window.sum() / window.len() as f32,
                    }
                })
            })
            .collect();

        let mut output = Array3::zeros((channels, out_h, out_w));
        for (channel, plane) in planes.into_iter().enumerate() {
            output.index_axis_mut(Axis(0), channel).assign(&plane);
        }
        Ok(output)
    }
}

/// Mean over each channel plane.
pub fn global_average_pool(input: ArrayView3<'_, f32>) -> Array1<f32> {
    input
        .axis_iter(Axis(0))
        .map(|plane| plane.mean().unwrap_or(0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn max_pool_takes_window_maximum() {
        let input = Array3::from_shape_fn((1, 4, 4), |(_, y, x)| (y * 4 + x) as f32);
        let output = Pool2d::new(PoolMode::Max, 2, 2).forward(input.view()).unwrap();
        assert_eq!(output.dim(), (1, 2, 2));
        assert_eq!(output[[0, 0, 0]], 5.0);
        assert_eq!(output[[0, 1, 1]], 15.0);
    }

    #[test]
    fn ceil_mode_average_divides_by_valid_elements() {
        let input = Array3::from_elem((2, 3, 3), 2.0f32);
        let output = Pool2d::new(PoolMode::Avg, 2, 2).forward(input.view()).unwrap();
        assert_eq!(output.dim(), (2, 2, 2));
        // the clipped corner window holds a single element
        for value in output.iter() {
            assert_abs_diff_eq!(*value, 2.0);
        }
    }

    #[test]
    fn oversized_window_is_rejected() {
        let pool = Pool2d::new(PoolMode::Avg, 3, 1);
        assert!(pool.output_shape(4, 2, 2).is_none());
        assert!(pool.forward(Array3::<f32>::zeros((4, 2, 2)).view()).is_err());
    }

    #[test]
    fn global_average_pool_means_each_plane() {
        let input = Array3::from_shape_fn((2, 2, 2), |(c, y, x)| (c * 10 + y + x) as f32);
        let pooled = global_average_pool(input.view());
        assert_abs_diff_eq!(pooled[0], 1.0);
        assert_abs_diff_eq!(pooled[1], 11.0);
    }
}
