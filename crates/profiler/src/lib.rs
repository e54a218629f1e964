//! Backend profiling for KernelProbe: the backend contract, a command-line
//! adapter, a reference CPU backend and a measurement cache.

pub mod cache;
pub mod command;
pub mod error;
pub mod profiler;
pub mod reference;

pub use cache::*;
pub use command::*;
pub use error::*;
pub use profiler::*;
pub use reference::*;
