//! Kernel configuration structures.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known configuration keys.
pub mod keys {
    pub const HW: &str = "HW";
    pub const CIN: &str = "CIN";
    pub const COUT: &str = "COUT";
    pub const KERNEL_SIZE: &str = "KERNEL_SIZE";
    pub const STRIDES: &str = "STRIDES";
    pub const POOL_STRIDES: &str = "POOL_STRIDES";
    pub const CIN1: &str = "CIN1";
    pub const CIN2: &str = "CIN2";
    pub const CIN3: &str = "CIN3";
    pub const CIN4: &str = "CIN4";
    pub const SPLIT_RATIO: &str = "SPLIT_RATIO";

    pub const CONCAT_BRANCHES: [&str; 4] = [CIN1, CIN2, CIN3, CIN4];
}

/// Parameter name to numeric value, e.g. `{"HW": 56, "CIN": 24}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelConfig {
    values: BTreeMap<String, f64>,
}

impl KernelConfig {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    pub fn with<K: Into<String>>(mut self, key: K, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Builds a config from parallel key and value lists.
    pub fn from_pairs(keys: &[&str], values: &[f64]) -> Self {
        keys.iter()
            .zip(values.iter())
            .fold(Self::new(), |config, (key, value)| config.with(*key, *value))
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw numeric value of a required key.
    pub fn require(&self, kernel_type: &str, key: &str) -> Result<f64, KernelError> {
        let value = self
            .get(key)
            .ok_or_else(|| KernelError::missing_key(kernel_type, key))?;
        if !value.is_finite() {
            return Err(KernelError::invalid_value(
                kernel_type,
                key,
                value,
                "value must be finite",
            ));
        }
        Ok(value)
    }

    /// A required key read as a tensor dimension (non-negative integer).
    pub fn dim(&self, kernel_type: &str, key: &str) -> Result<usize, KernelError> {
        let value = self.require(kernel_type, key)?;
        if value < 0.0 || value.fract() != 0.0 {
            return Err(KernelError::invalid_value(
                kernel_type,
                key,
                value,
                "expected a non-negative integer",
            ));
        }
        Ok(value as usize)
    }

    /// Like [`KernelConfig::dim`] but additionally rejects zero.
    pub fn positive_dim(&self, kernel_type: &str, key: &str) -> Result<usize, KernelError> {
        let value = self.dim(kernel_type, key)?;
        if value == 0 {
            return Err(KernelError::invalid_value(
                kernel_type,
                key,
                value,
                "expected a positive integer",
            ));
        }
        Ok(value)
    }

    /// Returns a copy with `COUT` set to `CIN` when `COUT` is absent.
    pub fn with_default_cout(&self) -> Self {
        let mut config = self.clone();
        if !config.contains(keys::COUT) {
            if let Some(cin) = config.get(keys::CIN) {
                config.values.insert(keys::COUT.to_string(), cin);
            }
        }
        config
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self
            .values
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{{body}}}")
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for KernelConfig {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        }
    }
}

/// Lower-cases, maps `_` to `-` and drops a trailing `-block`, so that
/// `dwconv_bn_relu` and `hswish-block` resolve like their plain names.
pub fn canonical_kernel_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase().replace('_', "-");
    match name.strip_suffix("-block") {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => name,
    }
}
