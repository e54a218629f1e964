//! Backend adapter that shells out to an external profiling program.

use crate::error::ProfileError;
use crate::profiler::{BackendProfiler, ProfileRequest, ProfileResult};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Runs `<program> [args..] --model <path> --workspace <dir> --input-shapes <json>`
/// and reads the latency JSON from stdout.
#[derive(Debug, Clone)]
pub struct CommandProfiler {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandProfiler {
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

    /// Arguments placed before the request flags.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, request: &ProfileRequest<'_>) -> Result<Command, ProfileError> {
        let shapes = serde_json::to_string(&request.input_shapes())
            .map_err(|err| ProfileError::invalid_response(err.to_string()))?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--model")
            .arg(request.artifact)
            .arg("--workspace")
            .arg(request.workspace)
            .arg("--input-shapes")
            .arg(shapes);
        Ok(command)
    }
}

impl BackendProfiler for CommandProfiler {
    fn name(&self) -> &str {
        &self.name
    }

    /// Canonical program path plus arguments; the display name alone does
    /// not tell two devices' scripts apart.
    fn identity(&self) -> String {
        let program = fs::canonicalize(&self.program).unwrap_or_else(|_| self.program.clone());
        std::iter::once(program.display().to_string())
            .chain(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn profile(&mut self, request: &ProfileRequest<'_>) -> Result<ProfileResult, ProfileError> {
        let program = self.program.display().to_string();
        debug!(
            backend = %self.name,
            program = %program,
            artifact = %request.artifact.display(),
            "invoking profiling command"
        );
        let output = self
            .command(request)?
            .output()
            .map_err(|source| ProfileError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProfileError::Exited {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        ProfileResult::parse(&String::from_utf8_lossy(&output.stdout))
    }
}
