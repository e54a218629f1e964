//! Minimal ONNX `ModelProto` writer.
//!
//! Only the message fields a lowered kernel block needs are encoded:
//! nodes with attributes, float/int64 initializers, typed graph inputs and
//! outputs, and a single default-domain opset import.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub const ONNX_FLOAT: i32 = 1;
pub const ONNX_INT64: i32 = 7;

const WIRE_VARINT: u32 = 0;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Protobuf wire-format encoder for the handful of field kinds ONNX needs.
#[derive(Debug, Default)]
struct PbEncoder {
    buf: Vec<u8>,
}

impl PbEncoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_varint(&mut self, mut val: u64) {
        loop {
            let byte = (val & 0x7F) as u8;
            val >>= 7;
            if val == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn write_tag(&mut self, field: u32, wire_type: u32) {
        self.write_varint(((field as u64) << 3) | wire_type as u64);
    }

    /// int64 fields use plain two's-complement varints, not zigzag.
    fn write_int_field(&mut self, field: u32, val: i64) {
        self.write_tag(field, WIRE_VARINT);
        self.write_varint(val as u64);
    }

    fn write_float_field(&mut self, field: u32, val: f32) {
        self.write_tag(field, WIRE_FIXED32);
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    fn write_bytes_field(&mut self, field: u32, data: &[u8]) {
        self.write_tag(field, WIRE_LEN);
        self.write_varint(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    fn write_string_field(&mut self, field: u32, val: &str) {
        self.write_bytes_field(field, val.as_bytes());
    }

    fn write_message_field(&mut self, field: u32, message: PbEncoder) {
        self.write_bytes_field(field, &message.buf);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnnxAttribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
}

impl OnnxAttribute {
    fn encode(&self, name: &str) -> PbEncoder {
        // AttributeProto: name=1 f=2 i=3 ints=8 type=20
        let mut enc = PbEncoder::new();
        enc.write_string_field(1, name);
        match self {
            OnnxAttribute::Float(value) => {
                enc.write_float_field(2, *value);
                enc.write_int_field(20, 1);
            }
            OnnxAttribute::Int(value) => {
                enc.write_int_field(3, *value);
                enc.write_int_field(20, 2);
            }
            OnnxAttribute::Ints(values) => {
                for value in values {
                    enc.write_int_field(8, *value);
                }
                enc.write_int_field(20, 7);
            }
        }
        enc
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnnxNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Kept in insertion order so encoding is reproducible.
    pub attributes: Vec<(String, OnnxAttribute)>,
}

impl OnnxNode {
    pub fn new(name: impl Into<String>, op_type: &str, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.to_string(),
            inputs,
            outputs,
            attributes: Vec::new(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&OnnxAttribute> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for input in &self.inputs {
            enc.write_string_field(1, input);
        }
        for output in &self.outputs {
            enc.write_string_field(2, output);
        }
        enc.write_string_field(3, &self.name);
        enc.write_string_field(4, &self.op_type);
        for (name, value) in &self.attributes {
            enc.write_message_field(5, value.encode(name));
        }
        enc
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    Int64(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnnxTensor {
    pub name: String,
    pub dims: Vec<i64>,
    pub data: TensorData,
}

impl OnnxTensor {
    pub fn float(name: impl Into<String>, dims: &[usize], values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            dims: dims.iter().map(|&dim| dim as i64).collect(),
            data: TensorData::Float(values),
        }
    }

    pub fn int64(name: impl Into<String>, values: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dims: vec![values.len() as i64],
            data: TensorData::Int64(values),
        }
    }

    pub fn element_count(&self) -> usize {
        match &self.data {
            TensorData::Float(values) => values.len(),
            TensorData::Int64(values) => values.len(),
        }
    }

    fn encode(&self) -> PbEncoder {
        // TensorProto: dims=1 data_type=2 name=8 raw_data=9
        let mut enc = PbEncoder::new();
        for dim in &self.dims {
            enc.write_int_field(1, *dim);
        }
        let (data_type, raw): (i32, Vec<u8>) = match &self.data {
            TensorData::Float(values) => {
                (ONNX_FLOAT, values.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
            TensorData::Int64(values) => {
                (ONNX_INT64, values.iter().flat_map(|v| v.to_le_bytes()).collect())
            }
        };
        enc.write_int_field(2, data_type as i64);
        enc.write_string_field(8, &self.name);
        enc.write_bytes_field(9, &raw);
        enc
    }
}

/// Name, element type and static shape of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueInfo {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<i64>,
}

impl ValueInfo {
    pub fn float(name: impl Into<String>, dims: &[usize]) -> Self {
        Self {
            name: name.into(),
            elem_type: ONNX_FLOAT,
            dims: dims.iter().map(|&dim| dim as i64).collect(),
        }
    }

    fn encode(&self) -> PbEncoder {
        let mut shape = PbEncoder::new();
        for dim in &self.dims {
            let mut dimension = PbEncoder::new();
            dimension.write_int_field(1, *dim);
            shape.write_message_field(1, dimension);
        }
        let mut tensor_type = PbEncoder::new();
        tensor_type.write_int_field(1, self.elem_type as i64);
        tensor_type.write_message_field(2, shape);
        let mut type_proto = PbEncoder::new();
        type_proto.write_message_field(1, tensor_type);

        let mut enc = PbEncoder::new();
        enc.write_string_field(1, &self.name);
        enc.write_message_field(2, type_proto);
        enc
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnnxGraph {
    pub name: String,
    pub nodes: Vec<OnnxNode>,
    pub initializers: Vec<OnnxTensor>,
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl OnnxGraph {
    pub fn op_types(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.op_type.as_str()).collect()
    }

    fn encode(&self) -> PbEncoder {
        let mut enc = PbEncoder::new();
        for node in &self.nodes {
            enc.write_message_field(1, node.encode());
        }
        enc.write_string_field(2, &self.name);
        for tensor in &self.initializers {
            enc.write_message_field(5, tensor.encode());
        }
        for input in &self.inputs {
            enc.write_message_field(11, input.encode());
        }
        for output in &self.outputs {
            enc.write_message_field(12, output.encode());
        }
        enc
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnnxModel {
    pub ir_version: i64,
    pub opset: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub graph: OnnxGraph,
}

impl OnnxModel {
    pub fn new(graph: OnnxGraph, opset: i64) -> Self {
        Self {
            ir_version: ir_version_for_opset(opset),
            opset,
            producer_name: "kernelprobe".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut opset = PbEncoder::new();
        opset.write_string_field(1, "");
        opset.write_int_field(2, self.opset);

        let mut model = PbEncoder::new();
        model.write_int_field(1, self.ir_version);
        model.write_string_field(2, &self.producer_name);
        model.write_string_field(3, &self.producer_version);
        model.write_message_field(7, self.graph.encode());
        model.write_message_field(8, opset);
        model.into_bytes()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(path, self.to_bytes())
            .with_context(|| format!("failed to write ONNX model to {}", path.display()))
    }
}

/// Highest IR version the reference runtime pairs with each opset.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        i64::MIN..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        _ => 9,
    }
}
