use std::collections::{HashMap, HashSet};

use crate::ir::spec::{Block, OpKind, ValueId};
use crate::ir::verify::verify_block;
use crate::passes::{BlockPass, PassError, PassResult};

/// Removes operations whose outputs are neither read nor returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl BlockPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, block: &mut Block) -> Result<PassResult, PassError> {
        verify_block(block)?;

        let mut def_map: HashMap<ValueId, usize> = HashMap::with_capacity(block.values.len());
        for (idx, op) in block.operations.iter().enumerate() {
            for output in &op.outputs {
                def_map.insert(*output, idx);
            }
        }

        let mut worklist: Vec<ValueId> = block.outputs.clone();
        for op in &block.operations {
            if is_side_effecting(&op.kind) {
                worklist.extend(op.inputs.iter().copied());
            }
        }

        let mut live: HashSet<ValueId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !live.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            worklist.extend(block.operations[idx].inputs.iter().copied());
        }

        let before = block.operations.len();
        block.operations.retain(|op| {
            is_side_effecting(&op.kind) || op.outputs.iter().any(|output| live.contains(output))
        });
        let removed = before.saturating_sub(block.operations.len());
        if removed > 0 {
            let defined: HashSet<ValueId> = block
                .inputs
                .iter()
                .chain(block.operations.iter().flat_map(|op| op.outputs.iter()))
                .copied()
                .collect();
            block.values.retain(|value| defined.contains(&value.id));
        }

        Ok(PassResult {
            changed: removed > 0,
            iterations: 0,
            rewrites_applied: 0,
            erased_ops: removed,
        })
    }
}

fn is_side_effecting(kind: &OpKind) -> bool {
    matches!(kind, OpKind::Custom(_))
}
