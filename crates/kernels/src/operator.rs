//! Operator units: shape propagation plus a runnable forward pass.

use crate::activation::ActivationKind;
use crate::config::{keys, KernelConfig};
use crate::conv::Conv2d;
use crate::elementwise::{self, SHUFFLE_GROUPS};
use crate::error::KernelError;
use crate::linear::Linear;
use crate::norm::BatchNorm;
use crate::pool::{Pool2d, PoolMode};
use crate::se::SqueezeExcite;
use crate::shape::{describe_shapes, TensorShape};
use crate::utils::{ensure_arity, ensure_shape, Tensor, WeightInit};
use anyhow::{Context, Result};
use ndarray::{Ix1, Ix3};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;
pub const MAX_CONCAT_INPUTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    #[serde(rename = "conv")]
    Conv,
    #[serde(rename = "dwconv")]
    DwConv,
    #[serde(rename = "bn")]
    BatchNorm,
    #[serde(rename = "relu")]
    Relu,
    #[serde(rename = "relu6")]
    Relu6,
    #[serde(rename = "hswish")]
    Hswish,
    #[serde(rename = "maxpool")]
    MaxPool,
    #[serde(rename = "avgpool")]
    AvgPool,
    #[serde(rename = "se")]
    SqueezeExcite,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "concat")]
    Concat,
    #[serde(rename = "split")]
    Split,
    #[serde(rename = "fc")]
    Fc,
    #[serde(rename = "channel-shuffle")]
    ChannelShuffle,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 14] = [
        OperatorKind::Conv,
        OperatorKind::DwConv,
        OperatorKind::BatchNorm,
        OperatorKind::Relu,
        OperatorKind::Relu6,
        OperatorKind::Hswish,
        OperatorKind::MaxPool,
        OperatorKind::AvgPool,
        OperatorKind::SqueezeExcite,
        OperatorKind::Add,
        OperatorKind::Concat,
        OperatorKind::Split,
        OperatorKind::Fc,
        OperatorKind::ChannelShuffle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Conv => "conv",
            OperatorKind::DwConv => "dwconv",
            OperatorKind::BatchNorm => "bn",
            OperatorKind::Relu => "relu",
            OperatorKind::Relu6 => "relu6",
            OperatorKind::Hswish => "hswish",
            OperatorKind::MaxPool => "maxpool",
            OperatorKind::AvgPool => "avgpool",
            OperatorKind::SqueezeExcite => "se",
            OperatorKind::Add => "add",
            OperatorKind::Concat => "concat",
            OperatorKind::Split => "split",
            OperatorKind::Fc => "fc",
            OperatorKind::ChannelShuffle => "channel-shuffle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Config keys read when instantiating this operator.
    pub fn config_keys(&self) -> &'static [&'static str] {
        match self {
            OperatorKind::Conv => &[keys::COUT, keys::KERNEL_SIZE, keys::STRIDES],
            OperatorKind::DwConv => &[keys::KERNEL_SIZE, keys::STRIDES],
            OperatorKind::MaxPool | OperatorKind::AvgPool => {
                &[keys::KERNEL_SIZE, keys::POOL_STRIDES]
            }
            OperatorKind::Fc => &[keys::COUT],
            _ => &[],
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operator needs to know about the block it is placed in.
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub kernel_type: &'a str,
    pub config: &'a KernelConfig,
    /// Seeds the representative parameters; blocks use the operator position.
    pub seed: u64,
}

impl<'a> OpContext<'a> {
    pub fn new(kernel_type: &'a str, config: &'a KernelConfig, seed: u64) -> Self {
        Self {
            kernel_type,
            config,
            seed,
        }
    }
}

/// Runnable transform with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Conv(Conv2d),
    BatchNorm(BatchNorm),
    Activation(ActivationKind),
    Pool(Pool2d),
    SqueezeExcite(SqueezeExcite),
    Add,
    Concat,
    Split { first: usize },
    Linear(Linear),
    ChannelShuffle { groups: usize },
}

impl Operator {
    pub fn param_count(&self) -> usize {
        match self {
            Operator::Conv(conv) => conv.param_count(),
            Operator::BatchNorm(bn) => bn.param_count(),
            Operator::SqueezeExcite(se) => se.param_count(),
            Operator::Linear(fc) => fc.param_count(),
            _ => 0,
        }
    }

    fn summary(&self) -> String {
        match self {
            Operator::Conv(conv) => format!(
                "k={} s={} groups={}",
                conv.kernel_size(),
                conv.stride,
                conv.groups
            ),
            Operator::Pool(pool) => format!("k={} s={}", pool.kernel_size, pool.stride),
            Operator::SqueezeExcite(se) => format!("mid={}", se.mid_channels()),
            Operator::Split { first } => format!("first={first}"),
            Operator::ChannelShuffle { groups } => format!("groups={groups}"),
            _ => String::new(),
        }
    }
}

/// One operator placed in a block, with the shapes it consumes and emits.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorUnit {
    pub kind: OperatorKind,
    pub inputs: Vec<TensorShape>,
    pub outputs: Vec<TensorShape>,
    pub op: Operator,
}

impl OperatorUnit {
    /// Propagates `inputs` through an operator of `kind`, reading its
    /// parameters from the context config.
    pub fn instantiate(
        kind: OperatorKind,
        inputs: &[TensorShape],
        ctx: &OpContext<'_>,
    ) -> Result<Self, KernelError> {
        let config = ctx.config;
        let kernel_type = ctx.kernel_type;
        let mut init = WeightInit::new(ctx.seed);

        let (op, outputs) = match kind {
            OperatorKind::Conv => {
                let (c, h, w) = single_spatial(kind, inputs, ctx)?;
                let cout = config.positive_dim(kernel_type, keys::COUT)?;
                let k = config.positive_dim(kernel_type, keys::KERNEL_SIZE)?;
                let s = config.positive_dim(kernel_type, keys::STRIDES)?;
                let (conv, output) = Conv2d::same(c, h, w, cout, k, s, 1, &mut init);
                (Operator::Conv(conv), vec![output])
            }
            OperatorKind::DwConv => {
                let (c, h, w) = single_spatial(kind, inputs, ctx)?;
                if let Some(cout) = config.get(keys::COUT) {
                    if cout != c as f64 {
                        return Err(KernelError::invalid_value(
                            kernel_type,
                            keys::COUT,
                            cout,
                            format!("depthwise convolution keeps {c} channels"),
                        ));
                    }
                }
                let k = config.positive_dim(kernel_type, keys::KERNEL_SIZE)?;
                let s = config.positive_dim(kernel_type, keys::STRIDES)?;
                let (conv, output) = Conv2d::same(c, h, w, c, k, s, c, &mut init);
                (Operator::Conv(conv), vec![output])
            }
            OperatorKind::BatchNorm => {
                let (c, _, _) = single_spatial(kind, inputs, ctx)?;
                (Operator::BatchNorm(BatchNorm::new(c, &mut init)), inputs.to_vec())
            }
            OperatorKind::Relu | OperatorKind::Relu6 | OperatorKind::Hswish => {
                let input = single(kind, inputs, ctx)?;
                let activation = match kind {
                    OperatorKind::Relu => ActivationKind::Relu,
                    OperatorKind::Relu6 => ActivationKind::Relu6,
                    _ => ActivationKind::Hswish,
                };
                (Operator::Activation(activation), vec![input])
            }
            OperatorKind::MaxPool | OperatorKind::AvgPool => {
                let (c, h, w) = single_spatial(kind, inputs, ctx)?;
                let k = config.positive_dim(kernel_type, keys::KERNEL_SIZE)?;
                let s = config.positive_dim(kernel_type, keys::POOL_STRIDES)?;
                let mode = if kind == OperatorKind::MaxPool {
                    PoolMode::Max
                } else {
                    PoolMode::Avg
                };
                let pool = Pool2d::new(mode, k, s);
                let output = pool.output_shape(c, h, w).ok_or_else(|| {
                    KernelError::invalid_value(
                        kernel_type,
                        keys::KERNEL_SIZE,
                        k,
                        format!("pool window exceeds the {h}x{w} input"),
                    )
                })?;
                (Operator::Pool(pool), vec![output])
            }
            OperatorKind::SqueezeExcite => {
                let (c, _, _) = single_spatial(kind, inputs, ctx)?;
                let se = SqueezeExcite::new(c, &mut init);
                (Operator::SqueezeExcite(se), inputs.to_vec())
            }
            OperatorKind::Add => {
                let first = match inputs {
                    [only] => *only,
                    [lhs, rhs] if lhs == rhs => *lhs,
                    _ => return Err(mismatch(kind, ctx, "one or two equal shapes", inputs)),
                };
                (Operator::Add, vec![first])
            }
            OperatorKind::Concat => {
                let output = concat_output(inputs)
                    .ok_or_else(|| mismatch(kind, ctx, "1-4 spatial tensors sharing H and W", inputs))?;
                (Operator::Concat, vec![output])
            }
            OperatorKind::Split => {
                let (c, _, _) = single_spatial(kind, inputs, ctx)?;
                let ratio = match config.get(keys::SPLIT_RATIO) {
                    Some(_) => config.require(kernel_type, keys::SPLIT_RATIO)?,
                    None => DEFAULT_SPLIT_RATIO,
                };
                let first = (c as f64 * ratio).floor();
                if !(ratio > 0.0 && ratio < 1.0) || first < 1.0 || first as usize >= c {
                    return Err(KernelError::invalid_value(
                        kernel_type,
                        keys::SPLIT_RATIO,
                        ratio,
                        format!("splitting {c} channels would leave an empty output"),
                    ));
                }
                let first = first as usize;
                let outputs = vec![inputs[0].with_channels(first), inputs[0].with_channels(c - first)];
                (Operator::Split { first }, outputs)
            }
            OperatorKind::Fc => {
                let features = match inputs {
                    [TensorShape::Flat { features }] => *features,
                    _ => return Err(mismatch(kind, ctx, "one flat tensor (F)", inputs)),
                };
                let cout = config.positive_dim(kernel_type, keys::COUT)?;
                let fc = Linear::new(features, cout, &mut init);
                (Operator::Linear(fc), vec![TensorShape::flat(cout)])
            }
            OperatorKind::ChannelShuffle => {
                let (c, _, _) = single_spatial(kind, inputs, ctx)?;
                if c % SHUFFLE_GROUPS != 0 {
                    return Err(KernelError::invalid_value(
                        kernel_type,
                        keys::CIN,
                        c,
                        format!("channel count must be divisible by {SHUFFLE_GROUPS} groups"),
                    ));
                }
                (
                    Operator::ChannelShuffle {
                        groups: SHUFFLE_GROUPS,
                    },
                    inputs.to_vec(),
                )
            }
        };

        Ok(Self {
            kind,
            inputs: inputs.to_vec(),
            outputs,
            op,
        })
    }

    pub fn param_count(&self) -> usize {
        self.op.param_count()
    }

    /// Runs the operator. Tensors carry no batch dimension.
    pub fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let name = self.kind.as_str();
        ensure_arity(inputs, self.inputs.len(), name)?;
        for (tensor, shape) in inputs.iter().zip(&self.inputs) {
            ensure_shape(tensor, shape, name)?;
        }

        let output = match &self.op {
            Operator::Conv(conv) => conv.forward(as_3d(&inputs[0])?)?.into_dyn(),
            Operator::BatchNorm(bn) => bn.forward(as_3d(&inputs[0])?)?.into_dyn(),
            Operator::Activation(activation) => {
                let mut tensor = inputs[0].clone();
                activation.apply_inplace(&mut tensor);
                tensor
            }
            Operator::Pool(pool) => pool.forward(as_3d(&inputs[0])?)?.into_dyn(),
            Operator::SqueezeExcite(se) => se.forward(as_3d(&inputs[0])?)?.into_dyn(),
            Operator::Add => {
                // a single incoming tensor is added to itself
                let rhs = inputs.get(1).unwrap_or(&inputs[0]);
                elementwise::add(&inputs[0], rhs)?
            }
            Operator::Concat => elementwise::concat(inputs)?,
            Operator::Split { first } => {
                let (head, tail) = elementwise::split(&inputs[0], *first)?;
                return Ok(vec![head, tail]);
            }
            Operator::Linear(fc) => {
                let features = inputs[0]
                    .view()
                    .into_dimensionality::<Ix1>()
                    .context("fc input must be flat")?;
                fc.forward(features)?.into_dyn()
            }
            Operator::ChannelShuffle { groups } => {
                elementwise::channel_shuffle(&inputs[0], *groups)?
            }
        };
        Ok(vec![output])
    }
}

impl fmt::Display for OperatorUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        let summary = self.op.summary();
        if !summary.is_empty() {
            write!(f, "({summary})")?;
        }
        write!(
            f,
            " {} -> {}",
            describe_shapes(&self.inputs),
            describe_shapes(&self.outputs)
        )
    }
}

fn as_3d(tensor: &Tensor) -> Result<ndarray::ArrayView3<'_, f32>> {
    tensor
        .view()
        .into_dimensionality::<Ix3>()
        .context("expected a (C, H, W) tensor")
}

fn mismatch(
    kind: OperatorKind,
    ctx: &OpContext<'_>,
    expected: &str,
    inputs: &[TensorShape],
) -> KernelError {
    KernelError::shape_mismatch(ctx.kernel_type, kind.as_str(), expected, describe_shapes(inputs))
}

fn single(
    kind: OperatorKind,
    inputs: &[TensorShape],
    ctx: &OpContext<'_>,
) -> Result<TensorShape, KernelError> {
    match inputs {
        [only] => Ok(*only),
        _ => Err(mismatch(kind, ctx, "exactly one input", inputs)),
    }
}

fn single_spatial(
    kind: OperatorKind,
    inputs: &[TensorShape],
    ctx: &OpContext<'_>,
) -> Result<(usize, usize, usize), KernelError> {
    match inputs {
        [TensorShape::Spatial {
            channels,
            height,
            width,
        }] => Ok((*channels, *height, *width)),
        _ => Err(mismatch(kind, ctx, "one spatial tensor (C, H, W)", inputs)),
    }
}

fn concat_output(inputs: &[TensorShape]) -> Option<TensorShape> {
    if inputs.is_empty() || inputs.len() > MAX_CONCAT_INPUTS {
        return None;
    }
    let mut total = 0;
    let mut extent = None;
    for shape in inputs {
        match shape {
            TensorShape::Spatial {
                channels,
                height,
                width,
            } => {
                if *extent.get_or_insert((*height, *width)) != (*height, *width) {
                    return None;
                }
                total += channels;
            }
            TensorShape::Flat { .. } => return None,
        }
    }
    let (height, width) = extent?;
    Some(TensorShape::spatial(total, height, width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::deterministic_tensor;

    fn ctx<'a>(config: &'a KernelConfig) -> OpContext<'a> {
        OpContext::new("test-kernel", config, 0)
    }

    #[test]
    fn conv_uses_same_padding() {
        let config = KernelConfig::new()
            .with("COUT", 32.0)
            .with("KERNEL_SIZE", 3.0)
            .with("STRIDES", 2.0);
        let unit =
            OperatorUnit::instantiate(OperatorKind::Conv, &[TensorShape::square(16, 7)], &ctx(&config))
                .unwrap();
        assert_eq!(unit.outputs, vec![TensorShape::square(32, 4)]);
        assert_eq!(unit.param_count(), 32 * (16 * 9 + 1));
    }

    #[test]
    fn missing_key_names_the_key() {
        let config = KernelConfig::new().with("COUT", 32.0).with("KERNEL_SIZE", 3.0);
        let err =
            OperatorUnit::instantiate(OperatorKind::Conv, &[TensorShape::square(16, 7)], &ctx(&config))
                .unwrap_err();
        assert_eq!(err, KernelError::missing_key("test-kernel", "STRIDES"));
    }

    #[test]
    fn pool_rejects_window_larger_than_input() {
        let config = KernelConfig::new()
            .with("KERNEL_SIZE", 3.0)
            .with("POOL_STRIDES", 1.0);
        let err = OperatorUnit::instantiate(
            OperatorKind::AvgPool,
            &[TensorShape::square(8, 2)],
            &ctx(&config),
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn split_defaults_to_half() {
        let config = KernelConfig::new();
        let unit = OperatorUnit::instantiate(
            OperatorKind::Split,
            &[TensorShape::square(7, 4)],
            &ctx(&config),
        )
        .unwrap();
        assert_eq!(
            unit.outputs,
            vec![TensorShape::square(3, 4), TensorShape::square(4, 4)]
        );

        let too_small = KernelConfig::new().with("SPLIT_RATIO", 0.1);
        assert!(OperatorUnit::instantiate(
            OperatorKind::Split,
            &[TensorShape::square(4, 4)],
            &ctx(&too_small)
        )
        .is_err());
    }

    #[test]
    fn concat_rejects_mismatched_extent() {
        let config = KernelConfig::new();
        let err = OperatorUnit::instantiate(
            OperatorKind::Concat,
            &[TensorShape::square(8, 4), TensorShape::square(8, 2)],
            &ctx(&config),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::ShapeMismatch { .. }));
    }

    #[test]
    fn fc_requires_flat_input() {
        let config = KernelConfig::new().with("COUT", 10.0);
        assert!(OperatorUnit::instantiate(OperatorKind::Fc, &[TensorShape::square(8, 2)], &ctx(&config))
            .is_err());
        let unit =
            OperatorUnit::instantiate(OperatorKind::Fc, &[TensorShape::flat(8)], &ctx(&config)).unwrap();
        let out = unit.forward(&[deterministic_tensor(&TensorShape::flat(8))]).unwrap();
        assert_eq!(out[0].shape(), &[10]);
    }

    #[test]
    fn forward_checks_declared_shapes() {
        let config = KernelConfig::new();
        let unit = OperatorUnit::instantiate(
            OperatorKind::Hswish,
            &[TensorShape::square(4, 3)],
            &ctx(&config),
        )
        .unwrap();
        assert!(unit
            .forward(&[deterministic_tensor(&TensorShape::square(4, 5))])
            .is_err());
        let out = unit
            .forward(&[deterministic_tensor(&TensorShape::square(4, 3))])
            .unwrap();
        assert_eq!(out[0].shape(), &[4, 3, 3]);
    }

    #[test]
    fn operator_names_round_trip() {
        for kind in OperatorKind::ALL {
            assert_eq!(OperatorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(OperatorKind::from_name("gelu"), None);
    }
}
