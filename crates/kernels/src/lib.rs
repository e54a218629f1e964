//! Operator library and shape propagation for KernelProbe kernel blocks.
//!
//! Every operator kind turns input [`TensorShape`]s and a [`KernelConfig`]
//! into an [`OperatorUnit`] that knows its output shapes and can run a
//! forward pass over `ndarray` tensors.

pub mod activation;
pub mod config;
pub mod conv;
pub mod elementwise;
pub mod error;
pub mod linear;
pub mod norm;
pub mod operator;
pub mod pool;
pub mod se;
pub mod shape;
pub mod utils;

pub use activation::*;
pub use config::*;
pub use conv::*;
pub use error::*;
pub use linear::*;
pub use norm::*;
pub use operator::*;
pub use pool::*;
pub use se::*;
pub use shape::*;
pub use utils::*;
