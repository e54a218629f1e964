//! The sweep runner: build, export, profile, extract features and predict
//! for every configuration, then aggregate the surviving pairs.

use crate::eval::{AccuracyReport, MetricError};
use crate::session::ProfilingSession;
use crate::sweeps::Sweep;
use anyhow::{Context, Result};
use kernelprobe_kernels::KernelConfig;
use kernelprobe_predictor::{extract_features, predict_checked, schema_for, FeatureVector, LatencyPredictor};
use kernelprobe_profiler::BackendProfiler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Sweep-granular cancellation, checked between configurations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStage {
    Build,
    Export,
    Profile,
    Features,
}

impl fmt::Display for SweepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepStage::Build => "build",
            SweepStage::Export => "export",
            SweepStage::Profile => "profile",
            SweepStage::Features => "features",
        };
        f.write_str(name)
    }
}

/// A configuration that was dropped from the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub index: usize,
    pub stage: SweepStage,
    pub config: KernelConfig,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPair {
    pub index: usize,
    pub config: KernelConfig,
    pub measured: f64,
    pub predicted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub kernel_type: String,
    pub backend: String,
    pub predictor: String,
    pub generated_at_unix_ms: u128,
    pub configs: usize,
    pub cancelled: bool,
    /// `None` when no configuration produced a pair.
    pub accuracy: Option<AccuracyReport>,
    pub pairs: Vec<MeasurementPair>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn measured(&self) -> Vec<f64> {
        self.pairs.iter().map(|pair| pair.measured).collect()
    }

    pub fn predicted(&self) -> Vec<f64> {
        self.pairs.iter().map(|pair| pair.predicted).collect()
    }

    /// Per-metric `self - baseline`; empty unless both sweeps aggregated.
    pub fn diff(&self, baseline: &SweepReport) -> BTreeMap<&'static str, f64> {
        match (&self.accuracy, &baseline.accuracy) {
            (Some(current), Some(previous)) => current.diff(previous),
            _ => BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

struct Measured {
    index: usize,
    config: KernelConfig,
    latency: f64,
    features: FeatureVector,
}

/// Runs every configuration of `sweep` through `session` and `predictor`.
///
/// Configuration-level failures are recorded and skipped. An unknown kernel
/// type or a failing predictor aborts the whole sweep.
pub fn run_sweep<B, P>(session: &mut ProfilingSession<B>, predictor: &P, sweep: &Sweep) -> Result<SweepReport>
where
    B: BackendProfiler,
    P: LatencyPredictor + ?Sized,
{
    let recipe = session.registry().resolve(&sweep.kernel_type)?;
    schema_for(&sweep.kernel_type)?;
    let kernel_type = recipe.name.to_string();
    let cancel = session.cancel_flag();
    info!(
        kernel_type = %kernel_type,
        configs = sweep.configs.len(),
        backend = session.backend_name(),
        predictor = predictor.name(),
        "starting sweep"
    );

    let mut measured = Vec::with_capacity(sweep.configs.len());
    let mut failures = Vec::new();
    let mut cancelled = false;

    for (index, config) in sweep.configs.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!(kernel_type = %kernel_type, completed = index, "sweep cancelled");
            cancelled = true;
            break;
        }
        match measure_config(session, &kernel_type, index, config) {
            Ok(entry) => measured.push(entry),
            Err((stage, error)) => {
                warn!(
                    kernel_type = %kernel_type,
                    index,
                    config = %config,
                    stage = %stage,
                    error = %error,
                    "configuration failed"
                );
                failures.push(SweepFailure {
                    index,
                    stage,
                    config: config.clone(),
                    error,
                });
            }
        }
    }

    let features: Vec<FeatureVector> = measured.iter().map(|entry| entry.features.clone()).collect();
    let predicted = if features.is_empty() {
        Vec::new()
    } else {
        predict_checked(predictor, &features)
            .with_context(|| format!("prediction failed for {kernel_type} sweep"))?
    };

    let pairs: Vec<MeasurementPair> = measured
        .into_iter()
        .zip(predicted)
        .map(|(entry, predicted)| MeasurementPair {
            index: entry.index,
            config: entry.config,
            measured: entry.latency,
            predicted,
        })
        .collect();

    let measured_values: Vec<f64> = pairs.iter().map(|pair| pair.measured).collect();
    let predicted_values: Vec<f64> = pairs.iter().map(|pair| pair.predicted).collect();
    let accuracy = match AccuracyReport::from_pairs(&measured_values, &predicted_values) {
        Ok(report) => Some(report),
        Err(MetricError::Empty) => {
            warn!(kernel_type = %kernel_type, "no configuration produced a measurement pair");
            None
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(err) = accuracy.as_ref().and_then(|report| report.relative_error.as_ref()) {
        warn!(kernel_type = %kernel_type, error = %err, "relative metrics are undefined");
    }

    info!(
        kernel_type = %kernel_type,
        pairs = pairs.len(),
        failures = failures.len(),
        rmse = accuracy.as_ref().map(|report| report.rmse),
        cancelled,
        "sweep finished"
    );

    Ok(SweepReport {
        kernel_type,
        backend: session.backend_name().to_string(),
        predictor: predictor.name().to_string(),
        generated_at_unix_ms: unix_millis(),
        configs: sweep.configs.len(),
        cancelled,
        accuracy,
        pairs,
        failures,
    })
}

fn measure_config<B: BackendProfiler>(
    session: &mut ProfilingSession<B>,
    kernel_type: &str,
    index: usize,
    config: &KernelConfig,
) -> Result<Measured, (SweepStage, String)> {
    let block = session
        .registry()
        .build(kernel_type, config)
        .map_err(|err| (SweepStage::Build, err.to_string()))?;

    let artifact = session.artifact_path(kernel_type, index);
    session
        .exporter()
        .export(&block, &artifact)
        .map_err(|err| (SweepStage::Export, format!("{err:#}")))?;

    let latency = session
        .measure(&block, &artifact)
        .map_err(|err| (SweepStage::Profile, err.to_string()))?;

    let features =
        extract_features(kernel_type, config).map_err(|err| (SweepStage::Features, err.to_string()))?;

    Ok(Measured {
        index,
        config: config.clone(),
        latency: latency.avg,
        features,
    })
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis()
}
