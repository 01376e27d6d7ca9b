//! Block-level optimization passes.

pub mod dce;
pub mod reduce_transposes;

use thiserror::Error;

use crate::ir::spec::Block;
use crate::ir::verify::MalformedGraphError;

pub use dce::DeadCodeEliminationPass;
pub use reduce_transposes::{
    InvalidRewritePolicy, ReduceTransposesConfig, ReduceTransposesPass, RewriteValidationError,
};

/// Result returned by a [`BlockPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the IR.
    pub changed: bool,
    /// Number of analysis rounds executed while applying the pass.
    pub iterations: usize,
    /// Total number of rewrites applied by the pass.
    pub rewrites_applied: usize,
    /// Operations removed by the pass.
    pub erased_ops: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_ops: self.erased_ops + other.erased_ops,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PassError {
    #[error("malformed block: {0}")]
    Malformed(#[from] MalformedGraphError),
    #[error(transparent)]
    RewriteValidation(#[from] RewriteValidationError),
}

/// Interface implemented by passes that rewrite a single block in place.
pub trait BlockPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, block: &mut Block) -> Result<PassResult, PassError>;
}
