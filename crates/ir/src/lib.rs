//! Kernel recipes, the block builder and ONNX export for KernelProbe.

pub mod builder;
pub mod lowering;
pub mod onnx;
pub mod recipes;
pub mod registry;

pub use builder::*;
pub use lowering::*;
pub use onnx::{OnnxAttribute, OnnxGraph, OnnxModel, OnnxNode, OnnxTensor, ValueInfo};
pub use recipes::*;
pub use registry::*;
