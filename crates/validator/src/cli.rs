//! CLI wiring for KernelProbe.

use crate::eval::AccuracyReport;
use crate::pipeline::{run_sweep, SweepReport};
use crate::session::{ProfilingSession, SessionOptions};
use crate::sweeps::{builtin_sweep, Sweep, BUILTIN_SWEEPS};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kernelprobe_ir::{OnnxExporter, RecipeRegistry};
use kernelprobe_kernels::KernelConfig;
use kernelprobe_predictor::{
    extract_features, schema_for, CommandPredictor, LatencyPredictor, LinearPredictor,
};
use kernelprobe_profiler::{BackendProfiler, CommandProfiler, ReferenceProfiler};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kernelprobe", about = "Validate kernel latency predictors against measured latency")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    /// Time the block's own forward pass on this machine.
    Reference,
    /// Run an external profiling program.
    Command,
}

/// A kernel type plus its configuration, from JSON and/or `KEY=VALUE` pairs.
#[derive(clap::Args, Debug, Clone)]
pub struct KernelArgs {
    #[arg(long = "kernel", short = 'k')]
    pub kernel_type: String,
    /// Configuration as a JSON object, e.g. '{"HW": 56, "CIN": 24}'.
    #[arg(long)]
    pub config: Option<String>,
    /// Individual `KEY=VALUE` entries; override keys from `--config`.
    #[arg(long = "set", short = 's', value_parser = parse_config_entry)]
    pub entries: Vec<(String, f64)>,
}

impl KernelArgs {
    pub fn kernel_config(&self) -> Result<KernelConfig> {
        let mut config = match &self.config {
            Some(json) => serde_json::from_str(json).context("--config is not a JSON object of numbers")?,
            None => KernelConfig::new(),
        };
        for (key, value) in &self.entries {
            config = config.with(key.clone(), *value);
        }
        Ok(config)
    }
}

fn parse_config_entry(entry: &str) -> Result<(String, f64), String> {
    let (key, value) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{entry}`"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|err| format!("invalid value for {key}: {err}"))?;
    Ok((key.trim().to_uppercase(), value))
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the kernel types that can be built, with their operators and features.
    ListKernels,
    /// Build a block and print its structure.
    Describe {
        #[command(flatten)]
        kernel: KernelArgs,
    },
    /// Print the feature vector of a configuration.
    Features {
        #[command(flatten)]
        kernel: KernelArgs,
    },
    /// Build a block and write it as an ONNX model.
    Export {
        #[command(flatten)]
        kernel: KernelArgs,
        #[arg(long, short = 'o')]
        output: PathBuf,
        #[arg(long, default_value_t = kernelprobe_ir::DEFAULT_OPSET)]
        opset: i64,
    },
    /// Run a sweep through a backend and a predictor and report accuracy.
    Validate {
        /// Built-in MobileNetV3 sweep to run.
        #[arg(long, conflicts_with = "sweep")]
        kernel: Option<String>,
        /// JSON sweep file: {"kernel_type": .., "configs": [..]}.
        #[arg(long)]
        sweep: Option<PathBuf>,
        /// Only run the first N configurations.
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value = "reference")]
        backend: BackendArg,
        /// Profiling program for `--backend command`.
        #[arg(long, required_if_eq("backend", "command"))]
        profiler_cmd: Option<PathBuf>,
        /// Linear predictor model (JSON).
        #[arg(long, required_unless_present = "predictor_cmd", conflicts_with = "predictor_cmd")]
        predictor_model: Option<PathBuf>,
        /// Predictor program reading feature vectors on stdin.
        #[arg(long)]
        predictor_cmd: Option<PathBuf>,
        /// Session options file (JSON); flags below override it.
        #[arg(long)]
        options: Option<PathBuf>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long)]
        warmup: Option<usize>,
        #[arg(long)]
        runs: Option<usize>,
        #[arg(long)]
        opset: Option<i64>,
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Write the sweep report here as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Earlier sweep report to compare against.
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::ListKernels => {
            let registry = RecipeRegistry::with_default_recipes();
            for recipe in registry.recipes() {
                let features = schema_for(recipe.name)
                    .map(|schema| schema.feature_names().join(", "))
                    .unwrap_or_default();
                let builtin = if BUILTIN_SWEEPS.contains(&recipe.name) { " [sweep]" } else { "" };
                println!(
                    "{:<22} ops={:<28} keys=[{}] features=[{}]{}",
                    recipe.name,
                    recipe.op_names().join("+"),
                    recipe.config_keys().join(", "),
                    features,
                    builtin
                );
            }
        }
        Command::Describe { kernel } => {
            let config = kernel.kernel_config()?;
            let block = RecipeRegistry::with_default_recipes().build(&kernel.kernel_type, &config)?;
            print!("{}", block.to_text());
        }
        Command::Features { kernel } => {
            let config = kernel.kernel_config()?;
            let schema = schema_for(&kernel.kernel_type)?;
            let features = extract_features(&kernel.kernel_type, &config)?;
            for (name, value) in schema.feature_names().iter().zip(&features.values) {
                println!("{name:<18} {value}");
            }
            println!("{}", serde_json::to_string(&features)?);
        }
        Command::Export {
            kernel,
            output,
            opset,
        } => {
            let config = kernel.kernel_config()?;
            let block = RecipeRegistry::with_default_recipes().build(&kernel.kernel_type, &config)?;
            OnnxExporter::with_opset(opset)?.export(&block, &output)?;
            println!("{}", output.display());
        }
        Command::Validate {
            kernel,
            sweep,
            limit,
            backend,
            profiler_cmd,
            predictor_model,
            predictor_cmd,
            options,
            workspace,
            warmup,
            runs,
            opset,
            no_cache,
            output,
            baseline,
        } => {
            let mut sweep = match (kernel, sweep) {
                (_, Some(path)) => Sweep::load(&path)?,
                (Some(kernel), None) => builtin_sweep(&kernel).ok_or_else(|| {
                    anyhow!(
                        "no built-in sweep for {kernel}; available: {}",
                        BUILTIN_SWEEPS.join(", ")
                    )
                })?,
                (None, None) => bail!("pass --kernel for a built-in sweep or --sweep <file>"),
            };
            if let Some(limit) = limit {
                sweep = sweep.truncated(limit);
            }

            let mut session_options = match options {
                Some(path) => SessionOptions::load(&path)?,
                None => SessionOptions::default(),
            };
            if let Some(workspace) = workspace {
                session_options.workspace = workspace;
            }
            if let Some(warmup) = warmup {
                session_options.warmup_runs = warmup;
            }
            if let Some(runs) = runs {
                session_options.runs = runs;
            }
            if let Some(opset) = opset {
                session_options.opset = opset;
            }
            if no_cache {
                session_options.use_cache = false;
            }

            let backend: Box<dyn BackendProfiler> = match backend {
                BackendArg::Reference => Box::new(
                    ReferenceProfiler::new()
                        .with_runs(session_options.warmup_runs, session_options.runs),
                ),
                BackendArg::Command => {
                    let program = profiler_cmd
                        .ok_or_else(|| anyhow!("--backend command needs --profiler-cmd"))?;
                    Box::new(CommandProfiler::new(program))
                }
            };
            let predictor: Box<dyn LatencyPredictor> = match (predictor_model, predictor_cmd) {
                (Some(path), _) => Box::new(LinearPredictor::load(&path)?),
                (None, Some(program)) => Box::new(CommandPredictor::new(program)),
                (None, None) => bail!("pass --predictor-model or --predictor-cmd"),
            };

            let mut session = ProfilingSession::new(session_options, backend)?;
            let report = run_sweep(&mut session, predictor.as_ref(), &sweep);
            session.shutdown()?;
            let report = report?;

            print_report(&report);
            if let Some(path) = baseline {
                if path.exists() {
                    let blob = fs::read_to_string(&path)?;
                    let baseline_report: SweepReport = serde_json::from_str(&blob)
                        .with_context(|| format!("{} is not a sweep report", path.display()))?;
                    for (metric, delta) in report.diff(&baseline_report) {
                        println!("Δ {metric}: {delta:+.4}");
                    }
                } else {
                    info!(path = %path.display(), "baseline report not found; skipping diff");
                }
            }
            if let Some(path) = output {
                fs::write(&path, report.to_json()?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
        }
    }
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!(
        "kernel={} backend={} predictor={} pairs={}/{} failures={}{}",
        report.kernel_type,
        report.backend,
        report.predictor,
        report.pairs.len(),
        report.configs,
        report.failures.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for failure in &report.failures {
        println!("- #{} {} [{}]: {}", failure.index, failure.config, failure.stage, failure.error);
    }
    match &report.accuracy {
        Some(AccuracyReport {
            rmse,
            relative: Some(relative),
            ..
        }) => println!(
            "rmse={:.4} rmspe={:.4} mean_rel_err={:.4} acc@10={:.3} acc@15={:.3} acc@20={:.3}",
            rmse,
            relative.rmspe,
            relative.mean_relative_error,
            relative.acc10,
            relative.acc15,
            relative.acc20
        ),
        Some(AccuracyReport {
            rmse,
            relative_error,
            ..
        }) => println!(
            "rmse={:.4} (relative metrics unavailable: {})",
            rmse,
            relative_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        ),
        None => println!("no measurement pairs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_entries() {
        assert_eq!(parse_config_entry("hw=56").unwrap(), ("HW".to_string(), 56.0));
        assert!(parse_config_entry("HW").is_err());
        assert!(parse_config_entry("HW=big").is_err());
    }

    #[test]
    fn set_entries_override_json() {
        let cli = Cli::try_parse_from([
            "kernelprobe",
            "describe",
            "-k",
            "conv-bn-relu",
            "--config",
            r#"{"HW": 56, "CIN": 24}"#,
            "-s",
            "HW=28",
        ])
        .unwrap();
        let Command::Describe { kernel } = cli.command else {
            panic!("expected describe");
        };
        let config = kernel.kernel_config().unwrap();
        assert_eq!(config.get("HW"), Some(28.0));
        assert_eq!(config.get("CIN"), Some(24.0));
    }

    #[test]
    fn validate_requires_a_predictor() {
        assert!(Cli::try_parse_from(["kernelprobe", "validate", "--kernel", "se"]).is_err());
        assert!(Cli::try_parse_from([
            "kernelprobe",
            "validate",
            "--kernel",
            "se",
            "--backend",
            "command",
            "--predictor-cmd",
            "predict"
        ])
        .is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
