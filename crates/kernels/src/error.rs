//! Error taxonomy for block construction and export.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("kernel `{kernel_type}`: missing required config key `{key}`")]
    MissingConfigKey { kernel_type: String, key: String },

    #[error("kernel `{kernel_type}`: config key `{key}` = {value} is invalid ({reason})")]
    InvalidConfigValue {
        kernel_type: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown kernel type `{0}`")]
    UnknownKernelType(String),

    #[error("kernel `{kernel_type}`: operator `{op}` expects {expected}, got {actual}")]
    ShapeMismatch {
        kernel_type: String,
        op: String,
        expected: String,
        actual: String,
    },

    #[error("kernel `{kernel_type}`: operator `{op}` cannot be exported ({reason})")]
    UnsupportedOperator {
        kernel_type: String,
        op: String,
        reason: String,
    },
}

impl KernelError {
    pub fn missing_key(kernel_type: &str, key: &str) -> Self {
        KernelError::MissingConfigKey {
            kernel_type: kernel_type.to_string(),
            key: key.to_string(),
        }
    }

    pub fn invalid_value(
        kernel_type: &str,
        key: &str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        KernelError::InvalidConfigValue {
            kernel_type: kernel_type.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn shape_mismatch(
        kernel_type: &str,
        op: &str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        KernelError::ShapeMismatch {
            kernel_type: kernel_type.to_string(),
            op: op.to_string(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Missing or invalid configuration values.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            KernelError::MissingConfigKey { .. } | KernelError::InvalidConfigValue { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_names_key_and_kernel() {
        let err = KernelError::missing_key("conv-bn-relu", "STRIDES");
        let text = err.to_string();
        assert!(text.contains("conv-bn-relu"));
        assert!(text.contains("STRIDES"));
        assert!(err.is_configuration());
    }

    #[test]
    fn unknown_kernel_type_is_not_a_configuration_error() {
        let err = KernelError::UnknownKernelType("conv-gelu".into());
        assert!(!err.is_configuration());
    }
}
