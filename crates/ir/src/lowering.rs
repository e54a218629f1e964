//! Lowering of kernel blocks to ONNX graphs, and the exporter on top of it.

use crate::builder::KernelBlock;
use crate::onnx::{OnnxAttribute, OnnxGraph, OnnxModel, OnnxNode, OnnxTensor, ValueInfo};
use anyhow::{ensure, Result};
use kernelprobe_kernels::{
    ActivationKind, Conv2d, KernelError, Linear, Operator, OperatorUnit, PoolMode, TensorShape,
};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_OPSET: i64 = 12;
pub const MIN_OPSET: i64 = 11;
pub const MAX_OPSET: i64 = 17;
/// Last opset in which `Split` takes its sizes as an attribute.
const SPLIT_ATTRIBUTE_MAX_OPSET: i64 = 12;

const HARD_SIGMOID_ALPHA: f32 = 1.0 / 6.0;
const HARD_SIGMOID_BETA: f32 = 0.5;

/// Writes kernel blocks as ONNX models pinned to one opset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnnxExporter {
    opset: i64,
}

impl Default for OnnxExporter {
    fn default() -> Self {
        Self {
            opset: DEFAULT_OPSET,
        }
    }
}

impl OnnxExporter {
    pub fn with_opset(opset: i64) -> Result<Self> {
        ensure!(
            (MIN_OPSET..=MAX_OPSET).contains(&opset),
            "opset {opset} is outside the supported range {MIN_OPSET}..={MAX_OPSET}"
        );
        Ok(Self { opset })
    }

    pub fn opset(&self) -> i64 {
        self.opset
    }

    pub fn lower(&self, block: &KernelBlock) -> Result<OnnxGraph, KernelError> {
        lower_block(block, self.opset)
    }

    pub fn to_model(&self, block: &KernelBlock) -> Result<OnnxModel, KernelError> {
        Ok(OnnxModel::new(self.lower(block)?, self.opset))
    }

    /// Lowers `block` and writes it to `path`, creating parent directories.
    pub fn export(&self, block: &KernelBlock, path: &Path) -> Result<()> {
        let model = self.to_model(block)?;
        model.save(path)?;
        info!(
            kernel_type = %block.kernel_type,
            path = %path.display(),
            nodes = model.graph.nodes.len(),
            opset = self.opset,
            "exported kernel block"
        );
        Ok(())
    }
}

/// Builds the ONNX graph for a block. Inputs and outputs carry a leading
/// batch dimension of one.
pub fn lower_block(block: &KernelBlock, opset: i64) -> Result<OnnxGraph, KernelError> {
    let mut graph = OnnxGraph {
        name: block.kernel_type.clone(),
        ..OnnxGraph::default()
    };
    let input_names = block.input_names();
    for (name, shape) in input_names.iter().zip(&block.inputs) {
        graph.inputs.push(ValueInfo::float(name.clone(), &shape.batched_dims()));
    }

    let mut current = input_names;
    let last = block.units.len().saturating_sub(1);
    for (index, unit) in block.units.iter().enumerate() {
        let prefix = format!("{}_{index}", unit.kind.as_str().replace('-', "_"));
        let outputs = if index == last {
            block.output_names()
        } else {
            (0..unit.outputs.len())
                .map(|slot| format!("{prefix}_out{slot}"))
                .collect()
        };
        let mut lowering = UnitLowering {
            graph: &mut graph,
            kernel_type: &block.kernel_type,
            prefix,
            opset,
        };
        lowering.lower(unit, &current, &outputs)?;
        current = outputs;
    }

    if block.units.is_empty() {
        // an empty block still needs an edge from input to output
        for (input, output) in current.iter().zip(block.output_names()) {
            graph.nodes.push(OnnxNode::new(
                format!("identity_{output}"),
                "Identity",
                vec![input.clone()],
                vec![output],
            ));
        }
    }

    for (name, shape) in block.output_names().iter().zip(&block.outputs) {
        graph.outputs.push(ValueInfo::float(name.clone(), &shape.batched_dims()));
    }
    debug!(
        kernel_type = %block.kernel_type,
        nodes = graph.nodes.len(),
        initializers = graph.initializers.len(),
        "lowered kernel block"
    );
    Ok(graph)
}

struct UnitLowering<'a> {
    graph: &'a mut OnnxGraph,
    kernel_type: &'a str,
    prefix: String,
    opset: i64,
}

impl UnitLowering<'_> {
    fn name(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }

    fn node(&mut self, suffix: &str, op_type: &str, inputs: Vec<String>, outputs: Vec<String>) -> &mut OnnxNode {
        let node = OnnxNode::new(self.name(suffix), op_type, inputs, outputs);
        self.graph.nodes.push(node);
        let last = self.graph.nodes.len() - 1;
        &mut self.graph.nodes[last]
    }

    fn float_init(&mut self, suffix: &str, dims: &[usize], values: Vec<f32>) -> String {
        let name = self.name(suffix);
        self.graph
            .initializers
            .push(OnnxTensor::float(name.clone(), dims, values));
        name
    }

    fn int_init(&mut self, suffix: &str, values: Vec<i64>) -> String {
        let name = self.name(suffix);
        self.graph.initializers.push(OnnxTensor::int64(name.clone(), values));
        name
    }

    fn unsupported(&self, op: &str, reason: String) -> KernelError {
        KernelError::UnsupportedOperator {
            kernel_type: self.kernel_type.to_string(),
            op: op.to_string(),
            reason,
        }
    }

    fn lower(&mut self, unit: &OperatorUnit, inputs: &[String], outputs: &[String]) -> Result<(), KernelError> {
        let input = inputs.first().cloned().unwrap_or_default();
        let output = outputs.first().cloned().unwrap_or_default();

        match &unit.op {
            Operator::Conv(conv) => self.conv(conv, "conv", input, output),
            Operator::BatchNorm(bn) => {
                let channels = bn.channels();
                let scale = self.float_init("scale", &[channels], bn.gamma.to_vec());
                let bias = self.float_init("bias", &[channels], bn.beta.to_vec());
                let mean = self.float_init("mean", &[channels], bn.running_mean.to_vec());
                let var = self.float_init("var", &[channels], bn.running_var.to_vec());
                self.node(
                    "bn",
                    "BatchNormalization",
                    vec![input, scale, bias, mean, var],
                    vec![output],
                )
                .attributes
                .push(("epsilon".into(), OnnxAttribute::Float(bn.epsilon)));
            }
            Operator::Activation(ActivationKind::Relu) => {
                self.node("relu", "Relu", vec![input], vec![output]);
            }
            Operator::Activation(ActivationKind::Relu6) => {
                if self.opset < MIN_OPSET {
                    return Err(self.unsupported(
                        "relu6",
                        format!("Clip with min/max inputs needs opset {MIN_OPSET}"),
                    ));
                }
                let min = self.float_init("min", &[], vec![0.0]);
                let max = self.float_init("max", &[], vec![6.0]);
                self.node("clip", "Clip", vec![input, min, max], vec![output]);
            }
            Operator::Activation(ActivationKind::Hswish) => {
                let gate = self.name("gate");
                self.hard_sigmoid("hsigmoid", input.clone(), gate.clone());
                self.node("mul", "Mul", vec![input, gate], vec![output]);
            }
            Operator::Pool(pool) => {
                let op_type = match pool.mode {
                    PoolMode::Max => "MaxPool",
                    PoolMode::Avg => "AveragePool",
                };
                let k = pool.kernel_size as i64;
                let s = pool.stride as i64;
                self.node("pool", op_type, vec![input], vec![output])
                    .attributes
                    .extend([
                        ("kernel_shape".into(), OnnxAttribute::Ints(vec![k, k])),
                        ("strides".into(), OnnxAttribute::Ints(vec![s, s])),
                        ("pads".into(), OnnxAttribute::Ints(vec![0; 4])),
                        ("ceil_mode".into(), OnnxAttribute::Int(1)),
                    ]);
            }
            Operator::SqueezeExcite(se) => {
                let pooled = self.name("pooled");
                let reduced = self.name("reduced");
                let hidden = self.name("hidden");
                let expanded = self.name("expanded");
                let gate = self.name("gate");
                self.node("gap", "GlobalAveragePool", vec![input.clone()], vec![pooled.clone()]);
                self.pointwise(&se.reduce, "reduce", pooled, reduced.clone());
                self.node("relu", "Relu", vec![reduced], vec![hidden.clone()]);
                self.pointwise(&se.expand, "expand", hidden, expanded.clone());
                self.hard_sigmoid("hsigmoid", expanded, gate.clone());
                self.node("mul", "Mul", vec![input, gate], vec![output]);
            }
            Operator::Add => {
                let rhs = inputs.get(1).cloned().unwrap_or_else(|| input.clone());
                self.node("add", "Add", vec![input, rhs], vec![output]);
            }
            Operator::Concat => {
                self.node("concat", "Concat", inputs.to_vec(), vec![output])
                    .attributes
                    .push(("axis".into(), OnnxAttribute::Int(1)));
            }
            Operator::Split { first } => {
                if self.opset > SPLIT_ATTRIBUTE_MAX_OPSET {
                    return Err(self.unsupported(
                        "split",
                        format!(
                            "split sizes are an attribute only up to opset {SPLIT_ATTRIBUTE_MAX_OPSET}, pinned opset is {}",
                            self.opset
                        ),
                    ));
                }
                let total = unit.inputs.first().map(TensorShape::channels).unwrap_or(0);
                let sizes = vec![*first as i64, total.saturating_sub(*first) as i64];
                self.node("split", "Split", vec![input], outputs.to_vec())
                    .attributes
                    .extend([
                        ("axis".into(), OnnxAttribute::Int(1)),
                        ("split".into(), OnnxAttribute::Ints(sizes)),
                    ]);
            }
            Operator::Linear(fc) => {
                let weight = self.float_init(
                    "weight",
                    &[fc.out_features(), fc.in_features()],
                    fc.weight.iter().copied().collect(),
                );
                let bias = self.float_init("bias", &[fc.out_features()], fc.bias.to_vec());
                self.node("gemm", "Gemm", vec![input, weight, bias], vec![output])
                    .attributes
                    .push(("transB".into(), OnnxAttribute::Int(1)));
            }
            Operator::ChannelShuffle { groups } => {
                let shape = match unit.inputs.first() {
                    Some(TensorShape::Spatial {
                        channels,
                        height,
                        width,
                    }) => [*channels as i64, *height as i64, *width as i64],
                    _ => {
                        return Err(self.unsupported(
                            "channel-shuffle",
                            "only spatial tensors can be shuffled".into(),
                        ))
                    }
                };
                let [c, h, w] = shape;
                let g = *groups as i64;
                let grouped_shape = self.int_init("grouped_shape", vec![1, g, c / g, h, w]);
                let flat_shape = self.int_init("flat_shape", vec![1, c, h, w]);
                let grouped = self.name("grouped");
                let transposed = self.name("transposed");
                self.node(
                    "reshape_in",
                    "Reshape",
                    vec![input, grouped_shape],
                    vec![grouped.clone()],
                );
                self.node("transpose", "Transpose", vec![grouped], vec![transposed.clone()])
                    .attributes
                    .push(("perm".into(), OnnxAttribute::Ints(vec![0, 2, 1, 3, 4])));
                self.node(
                    "reshape_out",
                    "Reshape",
                    vec![transposed, flat_shape],
                    vec![output],
                );
            }
        }
        Ok(())
    }

    fn conv(&mut self, conv: &Conv2d, suffix: &str, input: String, output: String) {
        let (out_channels, in_per_group, k, _) = conv.weight.dim();
        let weight = self.float_init(
            &format!("{suffix}_weight"),
            &[out_channels, in_per_group, k, k],
            conv.weight.iter().copied().collect(),
        );
        let bias = self.float_init(&format!("{suffix}_bias"), &[out_channels], conv.bias.to_vec());
        let [top, left, bottom, right] = conv.pads;
        let k = k as i64;
        let s = conv.stride as i64;
        self.node(suffix, "Conv", vec![input, weight, bias], vec![output])
            .attributes
            .extend([
                ("kernel_shape".into(), OnnxAttribute::Ints(vec![k, k])),
                ("strides".into(), OnnxAttribute::Ints(vec![s, s])),
                (
                    "pads".into(),
                    OnnxAttribute::Ints(vec![top as i64, left as i64, bottom as i64, right as i64]),
                ),
                ("dilations".into(), OnnxAttribute::Ints(vec![1, 1])),
                ("group".into(), OnnxAttribute::Int(conv.groups as i64)),
            ]);
    }

    /// A 1x1 convolution carrying a dense projection's weights.
    fn pointwise(&mut self, projection: &Linear, suffix: &str, input: String, output: String) {
        let weight = self.float_init(
            &format!("{suffix}_weight"),
            &[projection.out_features(), projection.in_features(), 1, 1],
            projection.weight.iter().copied().collect(),
        );
        let bias = self.float_init(
            &format!("{suffix}_bias"),
            &[projection.out_features()],
            projection.bias.to_vec(),
        );
        self.node(suffix, "Conv", vec![input, weight, bias], vec![output])
            .attributes
            .push(("kernel_shape".into(), OnnxAttribute::Ints(vec![1, 1])));
    }

    fn hard_sigmoid(&mut self, suffix: &str, input: String, output: String) {
        self.node(suffix, "HardSigmoid", vec![input], vec![output])
            .attributes
            .extend([
                ("alpha".into(), OnnxAttribute::Float(HARD_SIGMOID_ALPHA)),
                ("beta".into(), OnnxAttribute::Float(HARD_SIGMOID_BETA)),
            ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::build_block;
    use kernelprobe_kernels::KernelConfig;

    fn spatial(hw: f64, cin: f64) -> KernelConfig {
        KernelConfig::new().with("HW", hw).with("CIN", cin)
    }

    #[test]
    fn conv_bn_relu_lowers_to_three_nodes() {
        let config = spatial(28.0, 16.0)
            .with("COUT", 32.0)
            .with("KERNEL_SIZE", 3.0)
            .with("STRIDES", 2.0);
        let block = build_block("conv-bn-relu", &config).unwrap();
        let graph = lower_block(&block, DEFAULT_OPSET).unwrap();

        assert_eq!(graph.op_types(), vec!["Conv", "BatchNormalization", "Relu"]);
        assert_eq!(graph.inputs, vec![ValueInfo::float("input", &[1, 16, 28, 28])]);
        assert_eq!(graph.outputs, vec![ValueInfo::float("output", &[1, 32, 14, 14])]);
        assert_eq!(graph.nodes[2].outputs, vec!["output".to_string()]);
        assert_eq!(
            graph.nodes[0].attribute("pads"),
            Some(&OnnxAttribute::Ints(vec![0, 0, 1, 1]))
        );
        let weights: usize = graph.initializers.iter().map(OnnxTensor::element_count).sum();
        assert_eq!(weights, block.param_count());
    }

    #[test]
    fn hswish_and_se_use_hard_sigmoid() {
        let graph = lower_block(&build_block("hswish", &spatial(14.0, 8.0)).unwrap(), 12).unwrap();
        assert_eq!(graph.op_types(), vec!["HardSigmoid", "Mul"]);

        let graph = lower_block(&build_block("se", &spatial(7.0, 32.0)).unwrap(), 12).unwrap();
        assert_eq!(
            graph.op_types(),
            vec!["GlobalAveragePool", "Conv", "Relu", "Conv", "HardSigmoid", "Mul"]
        );
        assert_eq!(graph.nodes[5].inputs[0], "input");
    }

    #[test]
    fn concat_block_names_each_input() {
        let config = KernelConfig::new()
            .with("HW", 14.0)
            .with("CIN1", 72.0)
            .with("CIN2", 0.0)
            .with("CIN3", 40.0)
            .with("CIN4", 0.0);
        let graph = lower_block(&build_block("concat", &config).unwrap(), 12).unwrap();
        let names: Vec<_> = graph.inputs.iter().map(|input| input.name.as_str()).collect();
        assert_eq!(names, vec!["input_0", "input_1"]);
        assert_eq!(graph.nodes[0].inputs, vec!["input_0", "input_1"]);
        assert_eq!(graph.outputs[0].dims, vec![1, 112, 14, 14]);
    }

    #[test]
    fn split_is_unsupported_past_attribute_opset() {
        let block = build_block("split", &spatial(14.0, 32.0)).unwrap();
        let graph = lower_block(&block, 12).unwrap();
        assert_eq!(
            graph.nodes[0].attribute("split"),
            Some(&OnnxAttribute::Ints(vec![16, 16]))
        );
        let names: Vec<_> = graph.outputs.iter().map(|output| output.name.as_str()).collect();
        assert_eq!(names, vec!["output_0", "output_1"]);

        let err = lower_block(&block, 13).unwrap_err();
        assert!(matches!(
            err,
            KernelError::UnsupportedOperator { ref op, ref kernel_type, .. }
                if op == "split" && kernel_type == "split"
        ));
    }

    #[test]
    fn channel_shuffle_lowers_to_reshape_transpose() {
        let block = build_block("channel-shuffle", &spatial(8.0, 16.0)).unwrap();
        let graph = lower_block(&block, 12).unwrap();
        assert_eq!(graph.op_types(), vec!["Reshape", "Transpose", "Reshape"]);
        assert_eq!(graph.initializers[0].dims, vec![5]);
    }

    #[test]
    fn exporter_rejects_opsets_outside_window() {
        assert!(OnnxExporter::with_opset(10).is_err());
        assert!(OnnxExporter::with_opset(18).is_err());
        assert_eq!(OnnxExporter::with_opset(13).unwrap().opset(), 13);
        assert_eq!(OnnxExporter::default().opset(), DEFAULT_OPSET);
    }

    #[test]
    fn export_writes_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/relu6.onnx");
        let config = spatial(8.0, 4.0)
            .with("COUT", 8.0)
            .with("KERNEL_SIZE", 3.0)
            .with("STRIDES", 1.0);
        let block = build_block("conv-relu6", &config).unwrap();
        OnnxExporter::default().export(&block, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(bytes, OnnxExporter::default().to_model(&block).unwrap().to_bytes());
    }
}
