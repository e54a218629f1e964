//! Data-movement and elementwise operators on whole tensors.

use crate::utils::Tensor;
use anyhow::{ensure, Context, Result};
use ndarray::{concatenate, Array1, ArrayView, Axis, IxDyn, Slice};

/// Group count used by channel shuffle.
pub const SHUFFLE_GROUPS: usize = 2;

pub fn add(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    ensure!(
        lhs.shape() == rhs.shape(),
        "add operands differ: {:?} vs {:?}",
        lhs.shape(),
        rhs.shape()
    );
    Ok(lhs + rhs)
}

/// Concatenates along the channel axis.
pub fn concat(inputs: &[Tensor]) -> Result<Tensor> {
    ensure!(!inputs.is_empty(), "concat needs at least one input");
    let views: Vec<ArrayView<'_, f32, IxDyn>> = inputs.iter().map(|t| t.view()).collect();
    concatenate(Axis(0), &views).context("concat inputs must share spatial extent")
}

/// Splits the channel axis at `first` into two tensors.
pub fn split(input: &Tensor, first: usize) -> Result<(Tensor, Tensor)> {
    let channels = input.len_of(Axis(0));
    ensure!(
        first > 0 && first < channels,
        "split point {first} must lie inside 1..{channels}"
    );
    let head = input.slice_axis(Axis(0), Slice::from(..first)).to_owned();
    let tail = input.slice_axis(Axis(0), Slice::from(first..)).to_owned();
    Ok((head, tail))
}

/// Interleaves channel groups: output channel `c` reads input channel
/// `(c % g) * (C / g) + c / g`.
pub fn channel_shuffle(input: &Tensor, groups: usize) -> Result<Tensor> {
    let channels = input.len_of(Axis(0));
    ensure!(
        groups > 0 && channels % groups == 0,
        "{channels} channels cannot be shuffled in {groups} groups"
    );
    let per_group = channels / groups;
    let mut output = input.clone();
    for channel in 0..channels {
        let source = (channel % groups) * per_group + channel / groups;
        output
            .slice_axis_mut(Axis(0), Slice::from(channel..channel + 1))
            .assign(&input.slice_axis(Axis(0), Slice::from(source..source + 1)));
    }
    Ok(output)
}

/// Flattens a tensor into a feature vector in row-major order.
pub fn flatten(input: &Tensor) -> Tensor {
    Array1::from_iter(input.iter().copied()).into_dyn()
}
