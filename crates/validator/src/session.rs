//! Profiling session: workspace, exporter, backend connection and the
//! measurement cache shared by every configuration of a sweep.

use crate::pipeline::CancelFlag;
use anyhow::{Context, Result};
use kernelprobe_ir::{KernelBlock, OnnxExporter, RecipeRegistry, DEFAULT_OPSET};
use kernelprobe_kernels::canonical_kernel_name;
use kernelprobe_profiler::{
    BackendProfiler, LatencyStats, MeasurementCache, ProfileError, ProfileRequest, CACHE_FILE_NAME,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Directory receiving exported artifacts and the measurement cache.
    pub workspace: PathBuf,
    pub warmup_runs: usize,
    pub runs: usize,
    pub opset: i64,
    pub use_cache: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("kernelprobe-workspace"),
            warmup_runs: 1,
            runs: 5,
            opset: DEFAULT_OPSET,
            use_cache: true,
        }
    }
}

impl SessionOptions {
    /// Reads options from JSON; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read session options {}", path.display()))?;
        serde_json::from_str(&blob)
            .with_context(|| format!("{} is not a valid session options file", path.display()))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.workspace.join(CACHE_FILE_NAME)
    }
}

/// Owns the backend for the duration of a sweep. The backend is connected
/// lazily on first use and disconnected on [`ProfilingSession::shutdown`]
/// or drop.
pub struct ProfilingSession<B: BackendProfiler> {
    options: SessionOptions,
    registry: RecipeRegistry,
    exporter: OnnxExporter,
    backend: B,
    connected: bool,
    cache: Option<MeasurementCache>,
    cancel: CancelFlag,
}

impl<B: BackendProfiler> ProfilingSession<B> {
    pub fn new(options: SessionOptions, backend: B) -> Result<Self> {
        let exporter = OnnxExporter::with_opset(options.opset)?;
        fs::create_dir_all(&options.workspace).with_context(|| {
            format!("failed to create workspace {}", options.workspace.display())
        })?;
        let cache = if options.use_cache {
            Some(MeasurementCache::load_from_file(&options.cache_path())?)
        } else {
            None
        };
        info!(
            backend = backend.name(),
            workspace = %options.workspace.display(),
            opset = options.opset,
            cached = cache.as_ref().map(MeasurementCache::len).unwrap_or(0),
            "profiling session ready"
        );
        Ok(Self {
            options,
            registry: RecipeRegistry::with_default_recipes(),
            exporter,
            backend,
            connected: false,
            cache,
            cancel: CancelFlag::new(),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn registry(&self) -> &RecipeRegistry {
        &self.registry
    }

    pub fn exporter(&self) -> &OnnxExporter {
        &self.exporter
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Shares an externally owned cancellation flag with this session.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle that stops the running sweep before its next configuration.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(&mut self) -> Result<(), ProfileError> {
        if !self.connected {
            self.backend.connect()?;
            self.connected = true;
            debug!(backend = self.backend.name(), "backend connected");
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.connected {
            self.backend.disconnect();
            self.connected = false;
            debug!(backend = self.backend.name(), "backend disconnected");
        }
    }

    /// Where the artifact of configuration `index` is written.
    pub fn artifact_path(&self, kernel_type: &str, index: usize) -> PathBuf {
        self.options
            .workspace
            .join(canonical_kernel_name(kernel_type))
            .join(format!("{index:04}.onnx"))
    }

    /// Cache key for the measurement context: backend identity, opset and
    /// run counts.
    fn measurement_context(&self) -> String {
        format!(
            "{} opset={} warmup={} runs={}",
            self.backend.identity(),
            self.options.opset,
            self.options.warmup_runs,
            self.options.runs
        )
    }

    /// Measures an exported block, reusing a cached measurement when one
    /// exists for the same measurement context, kernel type and config.
    pub fn measure(&mut self, block: &KernelBlock, artifact: &Path) -> Result<LatencyStats, ProfileError> {
        let backend = self.measurement_context();
        if let Some(cached) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&backend, &block.kernel_type, &block.config))
        {
            debug!(kernel_type = %block.kernel_type, config = %block.config, "using cached measurement");
            return Ok(*cached);
        }

        self.connect()?;
        let request = ProfileRequest {
            artifact,
            workspace: &self.options.workspace,
            block,
        };
        let latency = self.backend.profile(&request)?.latency;
        latency.validate()?;
        if let Some(cache) = self.cache.as_mut() {
            cache.insert(&backend, &block.kernel_type, &block.config, latency);
        }
        Ok(latency)
    }

    /// Persists the cache and disconnects the backend.
    pub fn shutdown(&mut self) -> Result<()> {
        self.disconnect();
        if let Some(cache) = &self.cache {
            cache.save_to_file(&self.options.cache_path())?;
        }
        Ok(())
    }
}

impl<B: BackendProfiler> Drop for ProfilingSession<B> {
    fn drop(&mut self) {
        if self.connected {
            warn!(backend = self.backend.name(), "session dropped while connected; disconnecting");
            self.disconnect();
        }
    }
}
