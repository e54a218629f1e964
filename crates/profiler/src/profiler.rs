//! The contract between the sweep runner and a hardware backend.

use crate::error::ProfileError;
use kernelprobe_ir::KernelBlock;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Latency statistics in the backend's own unit. Only `avg` is required.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs: Option<usize>,
}

impl LatencyStats {
    pub fn from_avg(avg: f64) -> Self {
        Self {
            avg,
            std: None,
            min: None,
            max: None,
            runs: None,
        }
    }

    /// Summarises individual timings.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let avg = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - avg).powi(2)).sum::<f64>() / n;
        Some(Self {
            avg,
            std: Some(var.sqrt()),
            min: samples.iter().copied().reduce(f64::min),
            max: samples.iter().copied().reduce(f64::max),
            runs: Some(samples.len()),
        })
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if !self.avg.is_finite() || self.avg < 0.0 {
            return Err(ProfileError::InvalidLatency { value: self.avg });
        }
        Ok(())
    }
}

/// Backend response: `{"latency": {"avg": .., ...}}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileResult {
    pub latency: LatencyStats,
}

impl ProfileResult {
    pub fn new(latency: LatencyStats) -> Self {
        Self { latency }
    }

    pub fn avg(&self) -> f64 {
        self.latency.avg
    }

    /// Parses a backend response, tolerating log lines before the JSON.
    pub fn parse(output: &str) -> Result<Self, ProfileError> {
        let trimmed = output.trim();
        let result: Self = match serde_json::from_str(trimmed) {
            Ok(result) => result,
            Err(err) => trimmed
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| line.starts_with('{'))
                .and_then(|line| serde_json::from_str(line).ok())
                .ok_or_else(|| ProfileError::invalid_response(err.to_string()))?,
        };
        result.latency.validate()?;
        Ok(result)
    }
}

/// Everything a backend needs to measure one exported block.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRequest<'a> {
    pub artifact: &'a Path,
    pub workspace: &'a Path,
    pub block: &'a KernelBlock,
}

impl ProfileRequest<'_> {
    /// Input shapes with the batch dimension, one list per block input.
    pub fn input_shapes(&self) -> Vec<Vec<usize>> {
        self.block.batched_input_shapes()
    }
}

pub trait BackendProfiler {
    fn name(&self) -> &str;

    /// Key under which measurements of this backend are cached. Backends
    /// that can reach different devices must include whatever selects the
    /// device.
    fn identity(&self) -> String {
        self.name().to_string()
    }

    fn connect(&mut self) -> Result<(), ProfileError> {
        Ok(())
    }

    fn profile(&mut self, request: &ProfileRequest<'_>) -> Result<ProfileResult, ProfileError>;

    fn disconnect(&mut self) {}
}

impl<P: BackendProfiler + ?Sized> BackendProfiler for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn identity(&self) -> String {
        (**self).identity()
    }

    fn connect(&mut self) -> Result<(), ProfileError> {
        (**self).connect()
    }

    fn profile(&mut self, request: &ProfileRequest<'_>) -> Result<ProfileResult, ProfileError> {
        (**self).profile(request)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}
