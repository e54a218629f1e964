//! Block builder and the built kernel block.

use anyhow::{ensure, Context, Result};
use kernelprobe_kernels::{
    deterministic_tensor, describe_shapes, KernelConfig, KernelError, OpContext, OperatorKind,
    OperatorUnit, Tensor, TensorShape,
};
use serde::Serialize;
use std::fmt::Write;

/// Chains operator units, feeding each unit's outputs into the next one.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    kernel_type: String,
    config: KernelConfig,
    inputs: Vec<TensorShape>,
    current: Vec<TensorShape>,
    units: Vec<OperatorUnit>,
}

impl BlockBuilder {
    pub fn new<N: Into<String>>(kernel_type: N, config: KernelConfig, inputs: Vec<TensorShape>) -> Self {
        Self {
            kernel_type: kernel_type.into(),
            config,
            current: inputs.clone(),
            inputs,
            units: Vec::new(),
        }
    }

    /// Shapes flowing out of the last appended unit.
    pub fn current_shapes(&self) -> &[TensorShape] {
        &self.current
    }

    /// Appends an operator of `kind`. Its parameters are seeded by its
    /// position so rebuilding yields identical weights.
    pub fn then(mut self, kind: OperatorKind) -> Result<Self, KernelError> {
        let ctx = OpContext::new(&self.kernel_type, &self.config, self.units.len() as u64);
        let unit = OperatorUnit::instantiate(kind, &self.current, &ctx)?;
        self.current = unit.outputs.clone();
        self.units.push(unit);
        Ok(self)
    }

    /// Appends a unit constructed elsewhere; its inputs must match the
    /// shapes currently flowing.
    pub fn push_unit(mut self, unit: OperatorUnit) -> Result<Self, KernelError> {
        if unit.inputs != self.current {
            return Err(KernelError::shape_mismatch(
                &self.kernel_type,
                unit.kind.as_str(),
                describe_shapes(&self.current),
                describe_shapes(&unit.inputs),
            ));
        }
        self.current = unit.outputs.clone();
        self.units.push(unit);
        Ok(self)
    }

    pub fn build(self) -> KernelBlock {
        KernelBlock {
            kernel_type: self.kernel_type,
            config: self.config,
            inputs: self.inputs,
            outputs: self.current,
            units: self.units,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelBlock {
    pub kernel_type: String,
    pub config: KernelConfig,
    pub inputs: Vec<TensorShape>,
    pub units: Vec<OperatorUnit>,
    pub outputs: Vec<TensorShape>,
}

/// Shape-level view of one unit, used to compare blocks structurally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStructure {
    pub kind: OperatorKind,
    pub inputs: Vec<TensorShape>,
    pub outputs: Vec<TensorShape>,
}

impl KernelBlock {
    pub fn input_names(&self) -> Vec<String> {
        tensor_names("input", self.inputs.len())
    }

    pub fn output_names(&self) -> Vec<String> {
        tensor_names("output", self.outputs.len())
    }

    /// Input shapes with the leading batch dimension, as backends take them.
    pub fn batched_input_shapes(&self) -> Vec<Vec<usize>> {
        self.inputs.iter().map(TensorShape::batched_dims).collect()
    }

    pub fn param_count(&self) -> usize {
        self.units.iter().map(OperatorUnit::param_count).sum()
    }

    pub fn structure(&self) -> Vec<UnitStructure> {
        self.units
            .iter()
            .map(|unit| UnitStructure {
                kind: unit.kind,
                inputs: unit.inputs.clone(),
                outputs: unit.outputs.clone(),
            })
            .collect()
    }

    /// Deterministic tensors matching the declared inputs.
    pub fn sample_inputs(&self) -> Vec<Tensor> {
        self.inputs.iter().map(deterministic_tensor).collect()
    }

    /// Runs every unit in order.
    pub fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        ensure!(
            inputs.len() == self.inputs.len(),
            "{} takes {} input(s), got {}",
            self.kernel_type,
            self.inputs.len(),
            inputs.len()
        );
        let mut values = inputs.to_vec();
        for (index, unit) in self.units.iter().enumerate() {
            values = unit
                .forward(&values)
                .with_context(|| format!("{} unit {index} ({})", self.kernel_type, unit.kind))?;
        }
        Ok(values)
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "block {} {}", self.kernel_type, self.config);
        for (name, shape) in self.input_names().iter().zip(&self.inputs) {
            let _ = writeln!(text, "  in  {name}: {shape}");
        }
        for (index, unit) in self.units.iter().enumerate() {
            let _ = writeln!(text, "  #{index} {unit}");
        }
        for (name, shape) in self.output_names().iter().zip(&self.outputs) {
            let _ = writeln!(text, "  out {name}: {shape}");
        }
        let _ = writeln!(text, "  params: {}", self.param_count());
        text
    }
}

fn tensor_names(base: &str, count: usize) -> Vec<String> {
    if count == 1 {
        vec![base.to_string()]
    } else {
        (0..count).map(|index| format!("{base}_{index}")).collect()
    }
}
