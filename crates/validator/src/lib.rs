//! KernelProbe validation pipeline: profiling sessions, sweeps and
//! accuracy reports.

#[cfg(feature = "cli")]
pub mod cli;
pub mod eval;
pub mod pipeline;
pub mod session;
pub mod sweeps;

#[cfg(feature = "cli")]
pub use cli::*;
pub use eval::*;
pub use pipeline::*;
pub use session::*;
pub use sweeps::*;
