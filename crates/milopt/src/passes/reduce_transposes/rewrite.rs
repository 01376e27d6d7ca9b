use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::trace;

use crate::ir::rewriter::{BlockRewriter, RewriteError};
use crate::ir::spec::{Block, OpId, OpKind, TensorType, UnaryOp, ValueId};
use crate::passes::reduce_transposes::decision::Component;
use crate::passes::reduce_transposes::discovery::{Analysis, Consumer};

/// Rewrites one accepted component in place and returns the number of erased ops.
///
/// Output types of absorbed ops are left stale; callers re-run shape inference.
pub(crate) fn apply_component(
    block: &mut Block,
    analysis: &Analysis,
    component: &Component,
) -> Result<usize, RewriteError> {
    let materializations: Vec<_> = component
        .materializations
        .iter()
        .filter_map(|&idx| analysis.materializations.get(idx))
        .collect();
    let output_slots: HashSet<usize> = materializations
        .iter()
        .filter_map(|record| match &record.consumer {
            Consumer::Output { slots } => Some(slots.iter().copied()),
            Consumer::Op { .. } => None,
        })
        .flatten()
        .collect();

    let mut rw = BlockRewriter::new(block)?;

    let mut snapshot: HashMap<ValueId, (String, TensorType)> = HashMap::new();
    for record in &materializations {
        let value = rw.value(record.value)?;
        snapshot.insert(record.value, (value.name.clone(), value.ty.clone()));
    }

    // Absorbed ops take their rewritten attributes and constants.
    let mut old_consts: BTreeSet<OpId> = BTreeSet::new();
    for record in component
        .absorbed
        .iter()
        .filter_map(|&idx| analysis.absorbed.get(idx))
    {
        for (slot, literal) in &record.absorption.constant_rewrites {
            let old = *rw
                .inputs(record.op)?
                .get(*slot)
                .ok_or(RewriteError::InvalidSlot { slot: *slot })?;
            if let Some(producer) = rw.producer_of(old) {
                old_consts.insert(producer);
            }
            let name = rw.fresh_name(&format!("{}_permuted", rw.value(old)?.name));
            let (_, ids) = rw.insert_before(
                record.op,
                OpKind::Const(literal.clone()),
                Vec::new(),
                vec![(name, literal.ty.clone())],
            )?;
            rw.set_input(record.op, *slot, ids[0])?;
        }
        rw.set_kind(record.op, record.absorption.kind.clone())?;
    }

    // Seeds disappear: their consumers read the untransposed input.
    let mut substituted: HashMap<ValueId, ValueId> = HashMap::new();
    for &seed in &component.seeds {
        let (input, output) = single_io(&rw, seed)?;
        rw.replace_uses(output, input)?;
        substituted.insert(output, input);
    }

    // Cancellations disappear; a returned one hands its name to its source.
    let mut renamed: HashSet<ValueId> = HashSet::new();
    let cancellations: Vec<OpId> = component
        .cancellations
        .iter()
        .filter_map(|&idx| analysis.cancellations.get(idx).map(|record| record.op))
        .collect();
    for &cancel in &cancellations {
        let (source, output) = single_io(&rw, cancel)?;
        substituted.insert(output, source);
        let slots = rw.output_slots_of(output);
        if slots.is_empty() {
            rw.replace_uses(output, source)?;
            continue;
        }
        let can_take_name = !renamed.contains(&source)
            && !rw.is_block_input(source)
            && rw
                .output_slots_of(source)
                .iter()
                .all(|slot| output_slots.contains(slot));
        if can_take_name {
            rw.transfer_name(output, source)?;
            renamed.insert(source);
            rw.replace_uses(output, source)?;
            continue;
        }
        rw.replace_uses(output, source)?;
        let name = rw.value(output)?.name.clone();
        let ty = rw.value(output)?.ty.clone();
        let parked = rw.fresh_name(&format!("{name}_old"));
        rw.rename_value(output, &parked)?;
        let (_, ids) = rw.insert_before(
            cancel,
            OpKind::Unary(UnaryOp::Identity),
            vec![source],
            vec![(name, ty)],
        )?;
        for slot in slots {
            rw.set_output(slot, ids[0])?;
        }
    }

    // Boundaries get an explicit transpose back to the declared layout.
    for record in &materializations {
        let mut source = record.value;
        while let Some(&next) = substituted.get(&source) {
            source = next;
        }
        let Some((name, ty)) = snapshot.get(&record.value).cloned() else {
            return Err(RewriteError::UnknownValue {
                value: record.value,
            });
        };
        match &record.consumer {
            Consumer::Op { op, slots } => {
                let base = format!("{}_transposed", rw.value(source)?.name);
                let fresh = rw.fresh_name(&base);
                let (_, ids) = rw.insert_before(
                    *op,
                    OpKind::transpose(record.perm.clone()),
                    vec![source],
                    vec![(fresh, ty)],
                )?;
                for &slot in slots {
                    rw.set_input(*op, slot, ids[0])?;
                }
            }
            Consumer::Output { slots } => {
                if rw.value(source)?.name == name {
                    let parked = rw.fresh_name(&format!("{name}_before_transpose"));
                    rw.rename_value(source, &parked)?;
                }
                let name = rw.fresh_name(&name);
                let (_, ids) = rw.append_operation(
                    OpKind::transpose(record.perm.clone()),
                    vec![source],
                    vec![(name, ty)],
                )?;
                for &slot in slots {
                    rw.set_output(slot, ids[0])?;
                }
            }
        }
    }

    let mut erased = 0usize;
    for op in cancellations.iter().chain(component.seeds.iter()) {
        rw.remove_operation(*op)?;
        erased += 1;
    }
    for op in old_consts {
        if rw.contains(op) && rw.erase_if_dead(op)? {
            erased += 1;
        }
    }
    trace!(
        seeds = ?component.seeds,
        erased,
        inserted = materializations.len(),
        "component rewritten"
    );
    Ok(erased)
}

fn single_io(rw: &BlockRewriter<'_>, op: OpId) -> Result<(ValueId, ValueId), RewriteError> {
    let operation = rw.op(op)?;
    match (operation.inputs.as_slice(), operation.outputs.as_slice()) {
        ([input], [output]) => Ok((*input, *output)),
        _ => Err(RewriteError::UnknownOp { op }),
    }
}
