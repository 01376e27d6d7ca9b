//! Transpose reduction.
//!
//! Seeds are transposes of values in their declared layout. The pass pushes
//! each seed's permutation forward through ops that can run on the
//! untransposed data, removes transposes that undo it, and puts explicit
//! transposes back where the permutation cannot travel further. A group of
//! seeds is rewritten only when that removes more transposes than it inserts.
//! Every rewrite runs on a copy of the block, is checked (structure, shapes,
//! output types, op kinds) and committed only when the checks pass.

mod decision;
mod discovery;
mod oracle;
mod rewrite;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, debug_span, warn};

use crate::env;
use crate::ir::rewriter::RewriteError;
use crate::ir::shape_inference::{
    infer_block_types, ShapeError, ShapeInference, StaticShapeInference,
};
use crate::ir::spec::{Block, OpId, TensorType};
use crate::ir::verify::{verify_block, MalformedGraphError};
use crate::passes::{BlockPass, PassError, PassResult};

use decision::Component;

/// What to do when a rewritten block fails validation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRewritePolicy {
    /// Abort the pass and leave the block untouched.
    #[default]
    Fail,
    /// Drop the offending seeds and keep optimizing.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceTransposesConfig {
    pub max_rounds: usize,
    pub on_invalid_rewrite: InvalidRewritePolicy,
}

impl Default for ReduceTransposesConfig {
    fn default() -> Self {
        Self {
            max_rounds: 64,
            on_invalid_rewrite: InvalidRewritePolicy::Fail,
        }
    }
}

/// A rewritten block did not pass validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteValidationError {
    #[error("rewrite of seeds {seeds:?} failed: {source}")]
    Rewrite {
        seeds: Vec<OpId>,
        source: RewriteError,
    },
    #[error("rewrite of seeds {seeds:?} left a malformed block: {source}")]
    Malformed {
        seeds: Vec<OpId>,
        source: MalformedGraphError,
    },
    #[error("shape inference failed after rewriting seeds {seeds:?}: {source}")]
    Shape {
        seeds: Vec<OpId>,
        source: ShapeError,
    },
    #[error("rewrite of seeds {seeds:?} changed output {slot} from {before} to {after}")]
    OutputType {
        seeds: Vec<OpId>,
        slot: usize,
        before: String,
        after: String,
    },
    #[error("rewrite of seeds {seeds:?} introduced op kind `{kind}`")]
    UnexpectedKind { seeds: Vec<OpId>, kind: String },
}

/// Removes transposes that cancel out across layout-agnostic ops.
pub struct ReduceTransposesPass {
    config: ReduceTransposesConfig,
    inference: Arc<dyn ShapeInference>,
}

impl Default for ReduceTransposesPass {
    fn default() -> Self {
        Self::new(ReduceTransposesConfig::default())
    }
}

impl ReduceTransposesPass {
    const NAME: &'static str = "reduce_transposes";

    pub fn new(config: ReduceTransposesConfig) -> Self {
        Self {
            config,
            inference: Arc::new(StaticShapeInference),
        }
    }

    /// Uses `inference` when re-deriving types of rewritten blocks.
    pub fn with_inference(mut self, inference: Arc<dyn ShapeInference>) -> Self {
        self.inference = inference;
        self
    }

    pub fn config(&self) -> &ReduceTransposesConfig {
        &self.config
    }

    fn max_rounds(&self) -> usize {
        env::reduce_transposes_max_rounds().unwrap_or(self.config.max_rounds)
    }

    fn apply_and_validate(
        &self,
        working: &Block,
        analysis: &discovery::Analysis,
        component: &Component,
        expected_outputs: &[Option<TensorType>],
        allowed_kinds: &HashSet<String>,
    ) -> Result<(Block, usize), RewriteValidationError> {
        let seeds: Vec<OpId> = component.seeds.iter().copied().collect();
        let mut candidate = working.clone();
        let erased = rewrite::apply_component(&mut candidate, analysis, component).map_err(
            |source| RewriteValidationError::Rewrite {
                seeds: seeds.clone(),
                source,
            },
        )?;
        verify_block(&candidate).map_err(|source| RewriteValidationError::Malformed {
            seeds: seeds.clone(),
            source,
        })?;
        infer_block_types(&mut candidate, self.inference.as_ref()).map_err(|source| {
            RewriteValidationError::Shape {
                seeds: seeds.clone(),
                source,
            }
        })?;
        for (slot, (before, after)) in expected_outputs
            .iter()
            .zip(candidate.output_types())
            .enumerate()
        {
            if *before != after {
                return Err(RewriteValidationError::OutputType {
                    seeds,
                    slot,
                    before: describe(before.as_ref()),
                    after: describe(after.as_ref()),
                });
            }
        }
        if let Some(op) = candidate
            .operations
            .iter()
            .find(|op| !allowed_kinds.contains(op.kind.name()))
        {
            return Err(RewriteValidationError::UnexpectedKind {
                seeds,
                kind: op.kind.name().to_string(),
            });
        }
        Ok((candidate, erased))
    }
}

fn describe(ty: Option<&TensorType>) -> String {
    ty.map_or_else(|| "<missing>".to_string(), ToString::to_string)
}

impl BlockPass for ReduceTransposesPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, block: &mut Block) -> Result<PassResult, PassError> {
        let span = debug_span!("reduce_transposes", block = %block.name);
        let _guard = span.enter();

        verify_block(block)?;
        if env::dump_ir_enabled() {
            debug!(ir = %block, "before reduce_transposes");
        }

        let expected_outputs = block.output_types();
        let mut allowed_kinds: HashSet<String> = block
            .operations
            .iter()
            .map(|op| op.kind.name().to_string())
            .collect();
        allowed_kinds.extend(["transpose", "identity", "const"].map(String::from));

        let mut working = block.clone();
        let mut excluded: BTreeSet<OpId> = BTreeSet::new();
        let mut result = PassResult::default();
        let max_rounds = self.max_rounds();

        while result.iterations < max_rounds {
            result.iterations += 1;
            let analysis = discovery::analyse(&working, &excluded);
            let accepted = decision::accepted_components(&analysis);
            if accepted.is_empty() {
                break;
            }
            for component in &accepted {
                match self.apply_and_validate(
                    &working,
                    &analysis,
                    component,
                    &expected_outputs,
                    &allowed_kinds,
                ) {
                    Ok((candidate, erased)) => {
                        working = candidate;
                        result.rewrites_applied += 1;
                        result.erased_ops += erased;
                    }
                    Err(err) => match self.config.on_invalid_rewrite {
                        InvalidRewritePolicy::Fail => return Err(err.into()),
                        InvalidRewritePolicy::Skip => {
                            warn!(error = %err, "skipping invalid transpose rewrite");
                            excluded.extend(component.seeds.iter().copied());
                        }
                    },
                }
            }
        }

        result.changed = result.rewrites_applied > 0;
        if result.changed {
            *block = working;
        }
        if env::dump_ir_enabled() {
            debug!(ir = %block, "after reduce_transposes");
        }
        debug!(
            rounds = result.iterations,
            rewrites = result.rewrites_applied,
            erased = result.erased_ops,
            "reduce_transposes finished"
        );
        Ok(result)
    }
}

/// Runs the pass with the default configuration; returns whether `block` changed.
pub fn apply(block: &mut Block) -> Result<bool, PassError> {
    ReduceTransposesPass::default()
        .run(block)
        .map(|result| result.changed)
}
