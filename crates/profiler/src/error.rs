//! Profiling failures. Each one voids a single configuration, never a sweep.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("backend response is not valid latency JSON: {reason}")]
    InvalidResponse { reason: String },

    #[error("backend reported an unusable average latency {value}")]
    InvalidLatency { value: f64 },

    #[error("reference execution failed: {0}")]
    Execution(String),
}

impl ProfileError {
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        ProfileError::InvalidResponse {
            reason: reason.into(),
        }
    }
}
