//! Tensor shapes and the arithmetic that propagates them through operators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of one tensor on a block's data path, without the batch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum TensorShape {
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat {
        features: usize,
    },
}

impl TensorShape {
    pub fn spatial(channels: usize, height: usize, width: usize) -> Self {
        TensorShape::Spatial {
            channels,
            height,
            width,
        }
    }

    pub fn square(channels: usize, hw: usize) -> Self {
        Self::spatial(channels, hw, hw)
    }

    pub fn flat(features: usize) -> Self {
        TensorShape::Flat { features }
    }

    /// Channel count for spatial tensors, feature count for flat ones.
    pub fn channels(&self) -> usize {
        match self {
            TensorShape::Spatial { channels, .. } => *channels,
            TensorShape::Flat { features } => *features,
        }
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self, TensorShape::Spatial { .. })
    }

    pub fn dims(&self) -> Vec<usize> {
        match self {
            TensorShape::Spatial {
                channels,
                height,
                width,
            } => vec![*channels, *height, *width],
            TensorShape::Flat { features } => vec![*features],
        }
    }

    /// Dimensions with a leading batch of one, as backends expect them.
    pub fn batched_dims(&self) -> Vec<usize> {
        let mut dims = Vec::with_capacity(4);
        dims.push(1);
        dims.extend(self.dims());
        dims
    }

    pub fn with_channels(&self, channels: usize) -> Self {
        match self {
            TensorShape::Spatial { height, width, .. } => {
                Self::spatial(channels, *height, *width)
            }
            TensorShape::Flat { .. } => Self::flat(channels),
        }
    }

    pub fn element_count(&self) -> usize {
        self.dims().iter().product()
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::Spatial {
                channels,
                height,
                width,
            } => write!(f, "({channels}, {height}, {width})"),
            TensorShape::Flat { features } => write!(f, "({features})"),
        }
    }
}

/// Formats a list of shapes as `[(C, H, W), ...]`.
pub fn describe_shapes(shapes: &[TensorShape]) -> String {
    let inner = shapes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}

/// Output extent of a same-padded convolution: `ceil(size / stride)`.
pub fn same_padding_output(size: usize, stride: usize) -> usize {
    size.div_ceil(stride)
}

/// Leading and trailing zero padding that realises same padding.
pub fn same_padding(size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = same_padding_output(size, stride);
    let needed = ((output.saturating_sub(1)) * stride + kernel).saturating_sub(size);
    let leading = needed / 2;
    (leading, needed - leading)
}

/// Output extent of an unpadded ceil-mode pooling window:
/// `ceil((size - kernel) / stride) + 1`, without a last window that would
/// start past the end of the input.
///
/// Returns `None` when the window does not fit the input.
pub fn ceil_pool_output(size: usize, kernel: usize, stride: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || size < kernel {
        return None;
    }
    let mut output = (size - kernel).div_ceil(stride) + 1;
    if (output - 1) * stride >= size {
        output -= 1;
    }
    Some(output)
}

/// Rounds `value` to the nearest multiple of `divisor`, never going below
/// `divisor` or more than 10% below `value`.
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let rounded = ((value + divisor_f / 2.0) / divisor_f).floor() as usize * divisor;
    let mut result = rounded.max(divisor);
    if (result as f64) < 0.9 * value {
        result += divisor;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_keeps_or_ceils_extent() {
        assert_eq!(same_padding_output(56, 1), 56);
        assert_eq!(same_padding_output(224, 2), 112);
        assert_eq!(same_padding_output(7, 2), 4);
        assert_eq!(same_padding(56, 3, 1), (1, 1));
        assert_eq!(same_padding(224, 3, 2), (0, 1));
        assert_eq!(same_padding(56, 1, 1), (0, 0));
    }

    #[test]
    fn ceil_pool_matches_reference_values() {
        assert_eq!(ceil_pool_output(56, 2, 2), Some(28));
        assert_eq!(ceil_pool_output(7, 2, 2), Some(4));
        assert_eq!(ceil_pool_output(56, 1, 1), Some(56));
        assert_eq!(ceil_pool_output(14, 3, 2), Some(7));
        // stride larger than the window: the last window would start outside
        assert_eq!(ceil_pool_output(4, 1, 2), Some(2));
        assert_eq!(ceil_pool_output(2, 3, 1), None);
    }

    #[test]
    fn make_divisible_follows_channel_rounding() {
        assert_eq!(make_divisible(72.0 / 4.0, 8), 24);
        assert_eq!(make_divisible(960.0 / 4.0, 8), 240);
        assert_eq!(make_divisible(16.0 / 4.0, 8), 8);
        assert_eq!(make_divisible(120.0 / 4.0, 8), 32);
    }

    #[test]
    fn batched_dims_prepend_batch() {
        assert_eq!(TensorShape::square(3, 224).batched_dims(), vec![1, 3, 224, 224]);
        assert_eq!(TensorShape::flat(1280).batched_dims(), vec![1, 1280]);
        assert_eq!(TensorShape::square(144, 56).to_string(), "(144, 56, 56)");
    }
}
