//! Measurement caching across sweeps.

use crate::profiler::LatencyStats;
use anyhow::{Context, Result};
use kernelprobe_kernels::KernelConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const CACHE_FILE_NAME: &str = "measurements.json";

/// Measured latencies keyed by backend, kernel type and config.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementCache {
    entries: BTreeMap<String, LatencyStats>,
}

impl MeasurementCache {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, backend: &str, kernel_type: &str, config: &KernelConfig) -> Option<&LatencyStats> {
        self.entries.get(&measurement_key(backend, kernel_type, config))
    }

    pub fn insert(&mut self, backend: &str, kernel_type: &str, config: &KernelConfig, latency: LatencyStats) {
        self.entries
            .insert(measurement_key(backend, kernel_type, config), latency);
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let cache = serde_json::from_slice(&data)
            .with_context(|| format!("{} is not a measurement cache", path.display()))?;
        Ok(cache)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let blob = serde_json::to_vec_pretty(self)?;
        fs::write(path, blob)?;
        Ok(())
    }
}

/// `backend/kernel_type/{"CIN":..,"HW":..}`; config keys are already sorted.
/// `backend` is the full measurement context, not just a display name.
fn measurement_key(backend: &str, kernel_type: &str, config: &KernelConfig) -> String {
    let config = serde_json::to_string(config).unwrap_or_else(|_| config.to_string());
    format!("{backend}/{kernel_type}/{config}")
}
