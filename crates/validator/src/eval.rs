//! Accuracy metrics over measured/predicted latency pairs.
//!
//! All relative metrics divide by the measured value. A zero measurement is
//! surfaced as [`MetricError::DivisionByZero`] instead of letting NaN or
//! infinity leak into a report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Relative-error thresholds, in percent, reported as `acc@T`.
pub const ACCURACY_THRESHOLDS: [u32; 3] = [10, 15, 20];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricError {
    #[error("measured latency at index {index} is zero; relative error is undefined")]
    DivisionByZero { index: usize },
    #[error("{measured} measured value(s) but {predicted} predicted")]
    LengthMismatch { measured: usize, predicted: usize },
    #[error("no measurement pairs to aggregate")]
    Empty,
}

fn check_lengths(measured: &[f64], predicted: &[f64]) -> Result<(), MetricError> {
    if measured.len() != predicted.len() {
        return Err(MetricError::LengthMismatch {
            measured: measured.len(),
            predicted: predicted.len(),
        });
    }
    if measured.is_empty() {
        return Err(MetricError::Empty);
    }
    Ok(())
}

/// `(measured_i - predicted_i) / measured_i` for every pair.
fn relative_errors(measured: &[f64], predicted: &[f64]) -> Result<Vec<f64>, MetricError> {
    check_lengths(measured, predicted)?;
    measured
        .iter()
        .zip(predicted)
        .enumerate()
        .map(|(index, (m, p))| {
            if *m == 0.0 {
                Err(MetricError::DivisionByZero { index })
            } else {
                Ok((m - p) / m)
            }
        })
        .collect()
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len() as f64;
    values.sum::<f64>() / n
}

pub fn rmse(measured: &[f64], predicted: &[f64]) -> Result<f64, MetricError> {
    check_lengths(measured, predicted)?;
    let mse = mean(measured.iter().zip(predicted).map(|(m, p)| (m - p).powi(2)));
    Ok(mse.sqrt())
}

pub fn rmspe(measured: &[f64], predicted: &[f64]) -> Result<f64, MetricError> {
    let errors = relative_errors(measured, predicted)?;
    Ok(mean(errors.iter().map(|e| e * e)).sqrt())
}

pub fn mean_relative_error(measured: &[f64], predicted: &[f64]) -> Result<f64, MetricError> {
    let errors = relative_errors(measured, predicted)?;
    Ok(mean(errors.iter().map(|e| e.abs())))
}

/// Fraction of pairs whose relative error is at most `threshold_percent`.
pub fn accuracy_within(
    measured: &[f64],
    predicted: &[f64],
    threshold_percent: u32,
) -> Result<f64, MetricError> {
    let errors = relative_errors(measured, predicted)?;
    let bound = f64::from(threshold_percent) / 100.0;
    let hits = errors.iter().filter(|e| e.abs() <= bound).count();
    Ok(hits as f64 / errors.len() as f64)
}

/// Metrics that are only defined when every measurement is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativeMetrics {
    pub rmspe: f64,
    pub mean_relative_error: f64,
    pub acc10: f64,
    pub acc15: f64,
    pub acc20: f64,
}

impl RelativeMetrics {
    pub fn compute(measured: &[f64], predicted: &[f64]) -> Result<Self, MetricError> {
        let errors = relative_errors(measured, predicted)?;
        let within = |threshold: u32| {
            let bound = f64::from(threshold) / 100.0;
            errors.iter().filter(|e| e.abs() <= bound).count() as f64 / errors.len() as f64
        };
        Ok(Self {
            rmspe: mean(errors.iter().map(|e| e * e)).sqrt(),
            mean_relative_error: mean(errors.iter().map(|e| e.abs())),
            acc10: within(ACCURACY_THRESHOLDS[0]),
            acc15: within(ACCURACY_THRESHOLDS[1]),
            acc20: within(ACCURACY_THRESHOLDS[2]),
        })
    }
}

/// Every metric, failing outright on the first undefined one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub samples: usize,
    pub rmse: f64,
    #[serde(flatten)]
    pub relative: RelativeMetrics,
}

pub fn latency_metrics(measured: &[f64], predicted: &[f64]) -> Result<LatencyMetrics, MetricError> {
    Ok(LatencyMetrics {
        samples: measured.len(),
        rmse: rmse(measured, predicted)?,
        relative: RelativeMetrics::compute(measured, predicted)?,
    })
}

/// Aggregate accuracy of one predictor over one sweep. A zero measurement
/// voids only the relative metrics; the cause is kept in `relative_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub samples: usize,
    pub rmse: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative: Option<RelativeMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_error: Option<MetricError>,
}

impl AccuracyReport {
    pub fn from_pairs(measured: &[f64], predicted: &[f64]) -> Result<Self, MetricError> {
        let rmse = rmse(measured, predicted)?;
        let (relative, relative_error) = match RelativeMetrics::compute(measured, predicted) {
            Ok(metrics) => (Some(metrics), None),
            Err(err) => (None, Some(err)),
        };
        Ok(Self {
            samples: measured.len(),
            rmse,
            relative,
            relative_error,
        })
    }

    /// Named metrics, relative ones only when defined.
    pub fn as_map(&self) -> BTreeMap<&'static str, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("rmse", self.rmse);
        if let Some(relative) = &self.relative {
            metrics.insert("rmspe", relative.rmspe);
            metrics.insert("mean_relative_error", relative.mean_relative_error);
            metrics.insert("acc10", relative.acc10);
            metrics.insert("acc15", relative.acc15);
            metrics.insert("acc20", relative.acc20);
        }
        metrics
    }

    /// `self - baseline` for every metric both reports define.
    pub fn diff(&self, baseline: &AccuracyReport) -> BTreeMap<&'static str, f64> {
        let previous = baseline.as_map();
        self.as_map()
            .into_iter()
            .filter_map(|(name, value)| previous.get(name).map(|old| (name, value - old)))
            .collect()
    }
}
