//! Latency predictor adapters.
//!
//! The validation pipeline only needs one estimate per feature vector.
//! Two adapters ship with the crate: a linear model loaded from JSON, and
//! an external program that reads feature vectors on stdin.

use crate::features::{schema_for, FeatureVector, SCHEMA_VERSION};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictorError {
    #[error("predictor for {expected} received features of {actual}")]
    KernelTypeMismatch { expected: String, actual: String },
    #[error("feature schema version {actual} does not match predictor version {expected}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("{kernel_type}: expected {expected} feature(s), got {actual}")]
    FeatureCountMismatch {
        kernel_type: String,
        expected: usize,
        actual: usize,
    },
    #[error("{kernel_type}: model feature names {actual:?} do not match schema {expected:?}")]
    FeatureNamesMismatch {
        kernel_type: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("predictor returned {actual} estimate(s) for {expected} feature vector(s)")]
    EstimateCount { expected: usize, actual: usize },
    #[error("predictor returned a non-finite estimate at index {index}")]
    NonFiniteEstimate { index: usize },
}

/// Maps feature vectors to estimated latencies, in the unit the profiler
/// reports.
pub trait LatencyPredictor {
    fn name(&self) -> &str;

    fn predict(&self, features: &[FeatureVector]) -> Result<Vec<f64>>;
}

impl<P: LatencyPredictor + ?Sized> LatencyPredictor for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn predict(&self, features: &[FeatureVector]) -> Result<Vec<f64>> {
        (**self).predict(features)
    }
}

/// Runs `predictor` and checks it returned exactly one finite estimate per
/// feature vector.
pub fn predict_checked<P: LatencyPredictor + ?Sized>(
    predictor: &P,
    features: &[FeatureVector],
) -> Result<Vec<f64>> {
    let estimates = predictor
        .predict(features)
        .with_context(|| format!("predictor {} failed", predictor.name()))?;
    if estimates.len() != features.len() {
        return Err(PredictorError::EstimateCount {
            expected: features.len(),
            actual: estimates.len(),
        }
        .into());
    }
    if let Some(index) = estimates.iter().position(|value| !value.is_finite()) {
        return Err(PredictorError::NonFiniteEstimate { index }.into());
    }
    Ok(estimates)
}

/// `latency = intercept + sum(coefficients[i] * features[i])`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub kernel_type: String,
    pub schema_version: u32,
    pub feature_names: Vec<String>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearPredictor {
    /// Builds a model for the canonical schema of `kernel_type`.
    pub fn new(kernel_type: &str, intercept: f64, coefficients: Vec<f64>) -> Result<Self> {
        let schema = schema_for(kernel_type)?;
        let model = Self {
            kernel_type: schema.kernel_type.to_string(),
            schema_version: schema.version,
            feature_names: schema.feature_names(),
            intercept,
            coefficients,
        };
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read predictor model {}", path.display()))?;
        let mut model: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse predictor model {}", path.display()))?;
        let schema = schema_for(&model.kernel_type)?;
        model.kernel_type = schema.kernel_type.to_string();
        model.validate()?;
        info!(
            kernel_type = %model.kernel_type,
            features = model.coefficients.len(),
            path = %path.display(),
            "loaded linear predictor"
        );
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write predictor model {}", path.display()))
    }

    /// Checks the model against the pinned schema of its kernel type.
    pub fn validate(&self) -> Result<(), PredictorError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(PredictorError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                actual: self.schema_version,
            });
        }
        let expected = schema_for(&self.kernel_type)
            .map(|schema| schema.feature_names())
            .unwrap_or_default();
        if self.feature_names != expected {
            return Err(PredictorError::FeatureNamesMismatch {
                kernel_type: self.kernel_type.clone(),
                expected,
                actual: self.feature_names.clone(),
            });
        }
        if self.coefficients.len() != expected.len() {
            return Err(PredictorError::FeatureCountMismatch {
                kernel_type: self.kernel_type.clone(),
                expected: expected.len(),
                actual: self.coefficients.len(),
            });
        }
        Ok(())
    }

    fn estimate(&self, features: &FeatureVector) -> Result<f64, PredictorError> {
        if features.kernel_type != self.kernel_type {
            return Err(PredictorError::KernelTypeMismatch {
                expected: self.kernel_type.clone(),
                actual: features.kernel_type.clone(),
            });
        }
        if features.schema_version != self.schema_version {
            return Err(PredictorError::SchemaVersionMismatch {
                expected: self.schema_version,
                actual: features.schema_version,
            });
        }
        if features.values.len() != self.coefficients.len() {
            return Err(PredictorError::FeatureCountMismatch {
                kernel_type: self.kernel_type.clone(),
                expected: self.coefficients.len(),
                actual: features.values.len(),
            });
        }
        let dot: f64 = self
            .coefficients
            .iter()
            .zip(&features.values)
            .map(|(weight, value)| weight * value)
            .sum();
        Ok(self.intercept + dot)
    }
}

impl LatencyPredictor for LinearPredictor {
    fn name(&self) -> &str {
        "linear"
    }

    fn predict(&self, features: &[FeatureVector]) -> Result<Vec<f64>> {
        features
            .iter()
            .map(|vector| self.estimate(vector).map_err(Into::into))
            .collect()
    }
}

/// Spawns `<program> [args..]`, writes the feature vectors as a JSON array
/// to stdin and reads a JSON array of latencies from stdout.
#[derive(Debug, Clone)]
pub struct CommandPredictor {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandPredictor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "command".to_string());
        Self {
            name,
            program,
            args: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl LatencyPredictor for CommandPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, features: &[FeatureVector]) -> Result<Vec<f64>> {
        let program = self.program.display().to_string();
        let payload = serde_json::to_vec(features)?;
        debug!(predictor = %self.name, program = %program, vectors = features.len(), "invoking predictor command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn predictor {program}"))?;
        // Feed stdin from a second thread so a predictor that writes before
        // draining its input cannot block on a full stdout pipe.
        let stdin = child.stdin.take();
        let (sent, output) = thread::scope(|scope| {
            let writer = scope.spawn(|| match stdin {
                Some(mut stdin) => stdin.write_all(&payload),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            (writer.join(), output)
        });
        let output = output.with_context(|| format!("predictor {program} did not finish"))?;
        if !output.status.success() {
            anyhow::bail!(
                "predictor {program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        sent.map_err(|_| anyhow::anyhow!("stdin writer for {program} panicked"))?
            .with_context(|| format!("failed to send features to {program}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim())
            .with_context(|| format!("predictor {program} returned invalid JSON"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::extract_features;
    use approx::assert_relative_eq;
    use kernelprobe_kernels::KernelConfig;

    fn hswish(hw: f64, cin: f64) -> FeatureVector {
        let config = KernelConfig::new().with("HW", hw).with("CIN", cin);
        extract_features("hswish", &config).unwrap()
    }

    #[test]
    fn linear_model_is_a_dot_product() {
        let model = LinearPredictor::new("hswish", 0.5, vec![0.01, 0.002]).unwrap();
        let estimates = model.predict(&[hswish(14.0, 200.0), hswish(7.0, 960.0)]).unwrap();
        assert_relative_eq!(estimates[0], 0.5 + 0.14 + 0.4);
        assert_relative_eq!(estimates[1], 0.5 + 0.07 + 1.92);
    }

    #[test]
    fn linear_model_rejects_wrong_width() {
        let err = LinearPredictor::new("conv-bn-relu", 0.0, vec![1.0; 5]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PredictorError>(),
            Some(&PredictorError::FeatureCountMismatch {
                kernel_type: "conv-bn-relu".into(),
                expected: 7,
                actual: 5,
            })
        );
    }

    #[test]
    fn linear_model_rejects_foreign_kernel_type() {
        let model = LinearPredictor::new("se", 0.0, vec![1.0, 1.0]).unwrap();
        let err = model.predict(&[hswish(14.0, 200.0)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PredictorError>(),
            Some(PredictorError::KernelTypeMismatch { .. })
        ));
    }

    #[test]
    fn model_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hswish.json");
        let model = LinearPredictor::new("hswish", 0.1, vec![0.2, 0.3]).unwrap();
        model.save(&path).unwrap();
        assert_eq!(LinearPredictor::load(&path).unwrap(), model);
    }

    #[test]
    fn load_rejects_stale_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.json");
        std::fs::write(
            &path,
            r#"{"kernel_type":"hswish","schema_version":0,"feature_names":["HW","CIN"],"intercept":0.0,"coefficients":[1.0,1.0]}"#,
        )
        .unwrap();
        let err = LinearPredictor::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PredictorError>(),
            Some(PredictorError::SchemaVersionMismatch { actual: 0, .. })
        ));
    }

    struct Short;

    impl LatencyPredictor for Short {
        fn name(&self) -> &str {
            "short"
        }

        fn predict(&self, _features: &[FeatureVector]) -> Result<Vec<f64>> {
            Ok(vec![1.0])
        }
    }

    #[test]
    fn checked_prediction_counts_estimates() {
        let err = predict_checked(&Short, &[hswish(1.0, 1.0), hswish(2.0, 2.0)]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PredictorError>(),
            Some(&PredictorError::EstimateCount {
                expected: 2,
                actual: 1
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_predictor_reads_json_array() {
        let predictor = CommandPredictor::new("sh")
            .with_name("echo")
            .with_args(["-c", "cat > /dev/null; echo '[1.5, 2.5]'"]);
        let estimates = predictor.predict(&[hswish(1.0, 1.0), hswish(2.0, 2.0)]).unwrap();
        assert_eq!(estimates, vec![1.5, 2.5]);
        assert_eq!(predictor.name(), "echo");
    }

    #[cfg(unix)]
    #[test]
    fn command_predictor_handles_output_before_input_is_drained() {
        let script = "head -c 200000 /dev/zero | tr '\\0' ' '; cat > /dev/null; \
                      awk 'BEGIN { printf \"[\"; for (i = 0; i < 5000; i++) printf \"%s1\", (i ? \",\" : \"\"); print \"]\" }'";
        let predictor = CommandPredictor::new("sh").with_args(["-c", script]);
        let features: Vec<_> = (0..5000).map(|index| hswish(f64::from(index % 64 + 1), 8.0)).collect();
        let estimates = predictor.predict(&features).unwrap();
        assert_eq!(estimates.len(), features.len());
        assert!(estimates.iter().all(|value| *value == 1.0));
    }

    #[cfg(unix)]
    #[test]
    fn command_predictor_reports_exit_status() {
        let predictor = CommandPredictor::new("sh").with_args(["-c", "echo boom >&2; exit 3"]);
        let err = predictor.predict(&[hswish(1.0, 1.0)]).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
