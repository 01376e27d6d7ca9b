//! Reference evaluator for milopt blocks.
//!
//! Executes a [`milopt::Block`] on host `f32` tensors, one op at a time. It
//! favours clarity over speed and exists to check that graph rewrites keep
//! numerical results unchanged.

pub mod eval;

pub use eval::{evaluate, EvalError, HostTensor};
