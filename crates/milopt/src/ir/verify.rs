use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::ir::perm;
use crate::ir::spec::{Block, OpId, OpKind, Operation, ValueId};

/// Structural defects detected before a pass touches a block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedGraphError {
    #[error("value {value:?} is referenced but never defined")]
    UndefinedValue { value: ValueId },
    #[error("{op} reads value {value:?} before it is defined")]
    ForwardReference { op: OpId, value: ValueId },
    #[error("value {value:?} is defined more than once")]
    DuplicateDefinition { value: ValueId },
    #[error("operation {op} appears more than once")]
    DuplicateOp { op: OpId },
    #[error("value name `{name}` is used by more than one value")]
    DuplicateName { name: String },
    #[error("value {value:?} has no value record")]
    MissingValueRecord { value: ValueId },
    #[error("value record {value:?} is neither a block input nor produced by an op")]
    OrphanValue { value: ValueId },
    #[error("{op} (`{kind}`) expects {expected} inputs and {outputs} outputs")]
    InvalidArity {
        op: OpId,
        kind: String,
        expected: String,
        outputs: usize,
    },
    #[error("{op}: transpose perm {perm:?} is not a permutation of rank {rank}")]
    InvalidPermutation {
        op: OpId,
        perm: Vec<usize>,
        rank: usize,
    },
}

/// Checks the SSA invariants of `block` without mutating it.
pub fn verify_block(block: &Block) -> Result<(), MalformedGraphError> {
    let mut names: HashSet<&str> = HashSet::with_capacity(block.values.len());
    let mut previous: Option<ValueId> = None;
    for value in &block.values {
        if previous.is_some_and(|prev| prev >= value.id) {
            return Err(MalformedGraphError::DuplicateDefinition { value: value.id });
        }
        previous = Some(value.id);
        if !names.insert(value.name.as_str()) {
            return Err(MalformedGraphError::DuplicateName {
                name: value.name.clone(),
            });
        }
    }

    let mut defined_at: HashMap<ValueId, usize> = HashMap::new();
    for input in &block.inputs {
        if block.value(*input).is_none() {
            return Err(MalformedGraphError::MissingValueRecord { value: *input });
        }
        if defined_at.insert(*input, 0).is_some() {
            return Err(MalformedGraphError::DuplicateDefinition { value: *input });
        }
    }
    let mut op_ids: HashSet<OpId> = HashSet::with_capacity(block.operations.len());
    for (pos, op) in block.operations.iter().enumerate() {
        if !op_ids.insert(op.id) {
            return Err(MalformedGraphError::DuplicateOp { op: op.id });
        }
        for output in &op.outputs {
            if block.value(*output).is_none() {
                return Err(MalformedGraphError::MissingValueRecord { value: *output });
            }
            if defined_at.insert(*output, pos + 1).is_some() {
                return Err(MalformedGraphError::DuplicateDefinition { value: *output });
            }
        }
    }

    for (pos, op) in block.operations.iter().enumerate() {
        for input in &op.inputs {
            match defined_at.get(input) {
                Some(&available) if available <= pos => {}
                Some(_) => {
                    return Err(MalformedGraphError::ForwardReference {
                        op: op.id,
                        value: *input,
                    })
                }
                None => return Err(MalformedGraphError::UndefinedValue { value: *input }),
            }
        }
        check_arity(op)?;
        if let OpKind::Transpose(spec) = &op.kind {
            let rank = block
                .type_of(op.inputs[0])
                .map(|ty| ty.rank())
                .unwrap_or(spec.perm.len());
            if spec.perm.len() != rank || !perm::is_permutation(&spec.perm) {
                return Err(MalformedGraphError::InvalidPermutation {
                    op: op.id,
                    perm: spec.perm.clone(),
                    rank,
                });
            }
        }
    }

    for output in &block.outputs {
        if !defined_at.contains_key(output) {
            return Err(MalformedGraphError::UndefinedValue { value: *output });
        }
    }
    for value in &block.values {
        if !defined_at.contains_key(&value.id) {
            return Err(MalformedGraphError::OrphanValue { value: value.id });
        }
    }
    Ok(())
}

fn check_arity(op: &Operation) -> Result<(), MalformedGraphError> {
    let (ok, expected) = match &op.kind {
        OpKind::Const(_) => (op.inputs.is_empty(), "0"),
        OpKind::Binary(_) => (op.inputs.len() == 2, "2"),
        OpKind::Concat(_) => (!op.inputs.is_empty(), "at least 1"),
        OpKind::Custom(_) => return Ok(()),
        OpKind::Transpose(_)
        | OpKind::Unary(_)
        | OpKind::Activation(_)
        | OpKind::Reduce(_)
        | OpKind::Pad(_)
        | OpKind::Pool(_) => (op.inputs.len() == 1, "1"),
    };
    if !ok || op.outputs.len() != 1 {
        return Err(MalformedGraphError::InvalidArity {
            op: op.id,
            kind: op.kind.name().to_string(),
            expected: expected.to_string(),
            outputs: op.outputs.len(),
        });
    }
    Ok(())
}
