use anyhow::Result;
use approx::assert_abs_diff_eq;
use kernelprobe_kernels::KernelConfig;
use kernelprobe_predictor::{FeatureVector, LatencyPredictor, LinearPredictor};
use kernelprobe_profiler::{
    BackendProfiler, LatencyStats, ProfileError, ProfileRequest, ProfileResult, ReferenceProfiler,
};
use kernelprobe_validator::{
    builtin_sweep, run_sweep, CancelFlag, MetricError, ProfilingSession, SessionOptions, Sweep,
    SweepReport, SweepStage,
};
use std::path::Path;

/// Reports `HW` milliseconds, or zero when `CIN` is 7; fails for configs
/// whose `CIN` is 13.
struct ScriptedBackend {
    cancel_after: Option<(usize, CancelFlag)>,
    calls: usize,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            cancel_after: None,
            calls: 0,
        }
    }
}

impl BackendProfiler for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn profile(&mut self, request: &ProfileRequest<'_>) -> Result<ProfileResult, ProfileError> {
        assert!(request.artifact.exists(), "artifact is exported before profiling");
        self.calls += 1;
        if let Some((after, flag)) = &self.cancel_after {
            if self.calls >= *after {
                flag.cancel();
            }
        }
        let config = &request.block.config;
        if config.get("CIN") == Some(13.0) {
            return Err(ProfileError::Execution("device lost".into()));
        }
        let latency = if config.get("CIN") == Some(7.0) {
            0.0
        } else {
            config.get("HW").unwrap_or(0.0)
        };
        Ok(ProfileResult::new(LatencyStats::from_avg(latency)))
    }
}

/// Predicts `HW * 1.1`.
struct Scaled;

impl LatencyPredictor for Scaled {
    fn name(&self) -> &str {
        "scaled"
    }

    fn predict(&self, features: &[FeatureVector]) -> Result<Vec<f64>> {
        Ok(features.iter().map(|vector| vector.values[0] * 1.1).collect())
    }
}

struct Broken;

impl LatencyPredictor for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn predict(&self, _features: &[FeatureVector]) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

fn relu_sweep(channels: &[f64]) -> Sweep {
    let configs = channels
        .iter()
        .enumerate()
        .map(|(index, cin)| {
            KernelConfig::new()
                .with("HW", (index + 1) as f64)
                .with("CIN", *cin)
        })
        .collect();
    Sweep::new("relu", configs)
}

fn session<B: BackendProfiler>(dir: &Path, backend: B) -> ProfilingSession<B> {
    let options = SessionOptions {
        workspace: dir.join("workspace"),
        use_cache: false,
        ..SessionOptions::default()
    };
    ProfilingSession::new(options, backend).unwrap()
}

#[test]
fn one_profiling_failure_leaves_nine_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    let sweep = relu_sweep(&[4.0, 4.0, 4.0, 13.0, 4.0, 4.0, 4.0, 4.0, 4.0, 4.0]);

    let report = run_sweep(&mut session, &Scaled, &sweep).unwrap();
    session.shutdown().unwrap();

    assert_eq!(report.configs, 10);
    assert_eq!(report.pairs.len(), 9);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 3);
    assert_eq!(report.failures[0].stage, SweepStage::Profile);
    assert!(report.failures[0].error.contains("device lost"));

    let indices: Vec<_> = report.pairs.iter().map(|pair| pair.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);

    let accuracy = report.accuracy.as_ref().unwrap();
    assert_eq!(accuracy.samples, 9);
    let relative = accuracy.relative.unwrap();
    assert_abs_diff_eq!(relative.mean_relative_error, 0.1, epsilon = 1e-9);
    assert_eq!(relative.acc15, 1.0);
    assert!(!report.cancelled);
}

#[test]
fn invalid_configs_are_recorded_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    let mut sweep = relu_sweep(&[4.0, 4.0]);
    sweep.configs.insert(1, KernelConfig::new().with("HW", 8.0));

    let report = run_sweep(&mut session, &Scaled, &sweep).unwrap();
    assert_eq!(report.pairs.len(), 2);
    assert_eq!(report.failures[0].stage, SweepStage::Build);
    assert!(report.failures[0].error.contains("CIN"));
}

#[test]
fn unknown_kernel_type_fails_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    let sweep = Sweep::new("conv-gelu", vec![KernelConfig::new().with("HW", 1.0)]);
    let err = run_sweep(&mut session, &Scaled, &sweep).unwrap_err();
    assert!(err.to_string().contains("conv-gelu"));
    assert!(!session.is_connected());
}

#[test]
fn predictor_contract_violation_fails_the_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    assert!(run_sweep(&mut session, &Broken, &relu_sweep(&[4.0, 4.0])).is_err());
}

#[test]
fn cancellation_returns_partial_report() {
    let dir = tempfile::tempdir().unwrap();
    let flag = CancelFlag::new();
    let backend = ScriptedBackend {
        cancel_after: Some((3, flag.clone())),
        calls: 0,
    };
    let mut session = session(dir.path(), backend).with_cancel_flag(flag.clone());

    let report = run_sweep(&mut session, &Scaled, &relu_sweep(&[4.0; 10])).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.pairs.len(), 3);
    assert_eq!(report.accuracy.unwrap().samples, 3);
    assert!(flag.is_cancelled());
}

#[test]
fn zero_latency_voids_relative_metrics_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    let report = run_sweep(&mut session, &Scaled, &relu_sweep(&[4.0, 7.0, 4.0])).unwrap();

    assert!(report.failures.is_empty());
    let accuracy = report.accuracy.unwrap();
    assert_eq!(accuracy.samples, 3);
    assert!(accuracy.relative.is_none());
    assert_eq!(accuracy.relative_error, Some(MetricError::DivisionByZero { index: 1 }));
    assert!(accuracy.rmse > 0.0);
}

#[test]
fn zero_sized_configs_fail_at_build() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    let mut sweep = relu_sweep(&[4.0, 4.0]);
    sweep.configs.push(KernelConfig::new().with("HW", 0.0).with("CIN", 4.0));

    let report = run_sweep(&mut session, &Scaled, &sweep).unwrap();
    assert_eq!(report.pairs.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, SweepStage::Build);
}

#[test]
fn report_round_trips_and_diffs() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = session(dir.path(), ScriptedBackend::new());
    let report = run_sweep(&mut session, &Scaled, &relu_sweep(&[4.0, 8.0, 16.0])).unwrap();
    let parsed: SweepReport = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(parsed, report);
    let deltas = report.diff(&parsed);
    assert_eq!(deltas.len(), 6);
    assert!(deltas.values().all(|delta| *delta == 0.0));
}

#[test]
fn reference_backend_with_linear_model_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let options = SessionOptions {
        workspace: dir.path().join("workspace"),
        warmup_runs: 0,
        runs: 1,
        ..SessionOptions::default()
    };
    let backend = ReferenceProfiler::new().with_runs(options.warmup_runs, options.runs);
    let mut session = ProfilingSession::new(options, backend).unwrap();
    let sweep = builtin_sweep("se").unwrap().truncated(2);
    let model = LinearPredictor::new("se", 0.01, vec![0.0, 0.0001]).unwrap();

    let report = run_sweep(&mut session, &model, &sweep).unwrap();
    session.shutdown().unwrap();

    assert_eq!(report.backend, "reference-cpu");
    assert_eq!(report.pairs.len(), 2);
    assert!(report.pairs.iter().all(|pair| pair.measured >= 0.0));
    assert_abs_diff_eq!(report.pairs[0].predicted, 0.01 + 72.0 * 0.0001, epsilon = 1e-12);
    assert!(dir.path().join("workspace/se/0000.onnx").exists());
    assert!(dir.path().join("workspace/measurements.json").exists());
}

#[test]
fn metric_error_is_serializable_in_reports() {
    let err = MetricError::DivisionByZero { index: 4 };
    let json = serde_json::to_string(&err).unwrap();
    assert_eq!(serde_json::from_str::<MetricError>(&json).unwrap(), err);
}
