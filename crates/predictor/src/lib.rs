//! Feature extraction and latency predictors for kernel configurations.

pub mod features;
pub mod predictor;

pub use features::*;
pub use predictor::*;
