//! Local CPU backend that times a block's own forward pass.

use crate::error::ProfileError;
use crate::profiler::{BackendProfiler, LatencyStats, ProfileRequest, ProfileResult};
use std::time::Instant;
use tracing::debug;

/// Reports milliseconds per forward pass of the block's ndarray units.
#[derive(Debug, Clone)]
pub struct ReferenceProfiler {
    warmup_runs: usize,
    runs: usize,
}

impl Default for ReferenceProfiler {
    fn default() -> Self {
        Self {
            warmup_runs: 1,
            runs: 5,
        }
    }
}

impl ReferenceProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(mut self, warmup_runs: usize, runs: usize) -> Self {
        self.warmup_runs = warmup_runs;
        self.runs = runs.max(1);
        self
    }
}

impl BackendProfiler for ReferenceProfiler {
    fn name(&self) -> &str {
        "reference-cpu"
    }

    fn identity(&self) -> String {
        format!("reference-cpu warmup={} runs={}", self.warmup_runs, self.runs)
    }

    fn profile(&mut self, request: &ProfileRequest<'_>) -> Result<ProfileResult, ProfileError> {
        let block = request.block;
        let inputs = block.sample_inputs();
        let run = || {
            block
                .forward(&inputs)
                .map_err(|err| ProfileError::Execution(format!("{err:#}")))
        };

        // warmup runs absorb allocation and thread-pool start-up
        for _ in 0..self.warmup_runs {
            run()?;
        }

        let mut samples = Vec::with_capacity(self.runs);
        for _ in 0..self.runs {
            let start = Instant::now();
            run()?;
            samples.push(start.elapsed().as_secs_f64() * 1000.0);
        }

        let latency = LatencyStats::from_samples(&samples)
            .ok_or_else(|| ProfileError::Execution("no measured runs".into()))?;
        debug!(
            kernel_type = %block.kernel_type,
            avg_ms = latency.avg,
            runs = self.runs,
            "timed reference forward pass"
        );
        Ok(ProfileResult::new(latency))
    }
}
