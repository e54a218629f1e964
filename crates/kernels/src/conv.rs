//! Convolution kernels (regular and depthwise) with same padding.

use crate::shape::{same_padding, same_padding_output, TensorShape};
use crate::utils::WeightInit;
use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Conv2d {
    /// `[out_channels, in_channels / groups, k, k]`
    pub weight: Array4<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
    /// top, left, bottom, right
    pub pads: [usize; 4],
    pub groups: usize,
}

impl Conv2d {
    /// Same-padded convolution over a spatial input; `groups == in_channels`
    /// gives the depthwise form.
    #[allow(clippy::too_many_arguments)]
    pub fn same(
        channels: usize,
        height: usize,
        width: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        init: &mut WeightInit,
    ) -> (Self, TensorShape) {
        let in_per_group = channels / groups;
        let fan_in = in_per_group * kernel_size * kernel_size;
        let weight = init.fan_in((out_channels, in_per_group, kernel_size, kernel_size), fan_in);
        let bias = init.fan_in(out_channels, fan_in);

        let (top, bottom) = same_padding(height, kernel_size, stride);
        let (left, right) = same_padding(width, kernel_size, stride);
        let output = TensorShape::spatial(
            out_channels,
            same_padding_output(height, stride),
            same_padding_output(width, stride),
        );

        let conv = Self {
            weight,
            bias,
            stride,
            pads: [top, left, bottom, right],
            groups,
        };
        (conv, output)
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.dim().2
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1 * self.groups
    }

    pub fn is_depthwise(&self) -> bool {
        self.groups > 1 && self.groups == self.in_channels()
    }

    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, input: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (channels, height, width) = input.dim();
        let (out_channels, in_per_group, k, _) = self.weight.dim();
        ensure!(
            channels == in_per_group * self.groups,
            "conv input has {} channels, weights expect {}",
            channels,
            in_per_group * self.groups
        );

        let [top, left, bottom, right] = self.pads;
        let stride = self.stride;
        let out_h = (height + top + bottom - k) / stride + 1;
        let out_w = (width + left + right - k) / stride + 1;
        let out_per_group = out_channels / self.groups;

        let planes: Vec<Array2<f32>> = (0..out_channels)
            .into_par_iter()
            .map(|oc| {
                let group = oc / out_per_group;
                let mut plane = Array2::from_elem((out_h, out_w), self.bias[oc]);
                for ic in 0..in_per_group {
                    let channel = input.index_axis(Axis(0), group * in_per_group + ic);
                    for ky in 0..k {
                        for kx in 0..k {
                            let w = self.weight[[oc, ic, ky, kx]];
                            for oy in 0..out_h {
                                let iy = (oy * stride + ky) as isize - top as isize;
                                if iy < 0 || iy >= height as isize {
                                    continue;
                                }
                                for ox in 0..out_w {
                                    let ix = (ox * stride + kx) as isize - left as isize;
                                    if ix < 0 || ix >= width as isize {
                                        continue;
                                    }
                                    plane[[oy, ox]] += w * channel[[iy as usize, ix as usize]];
                                }
                            }
                        }
                    }
                }
                plane
            })
            .collect();

        let mut output = Array3::zeros((out_channels, out_h, out_w));
        for (oc, plane) in planes.into_iter().enumerate() {
            output.index_axis_mut(Axis(0), oc).assign(&plane);
        }
        Ok(output)
    }
}
