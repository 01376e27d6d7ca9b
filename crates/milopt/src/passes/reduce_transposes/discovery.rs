//! Forward layout sweep that finds every seed transpose and the region it reaches.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::trace;

use crate::ir::perm;
use crate::ir::spec::{Block, OpId, OpKind, Operation, ValueId};
use crate::passes::reduce_transposes::oracle::{self, Absorption, InputView};

/// Layout of a value relative to the program as originally written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LayoutState {
    Concrete,
    /// The value equals `transpose(data, perm)` for data that exists without the transposes of `seeds`.
    Lazy {
        perm: Vec<usize>,
        seeds: BTreeSet<OpId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AbsorbedOp {
    pub op: OpId,
    pub absorption: Absorption,
    pub seeds: BTreeSet<OpId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cancellation {
    pub op: OpId,
    pub seeds: BTreeSet<OpId>,
}

/// Where a lazy value must be turned back into its declared layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Consumer {
    Op { op: OpId, slots: Vec<usize> },
    Output { slots: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Materialization {
    pub value: ValueId,
    pub perm: Vec<usize>,
    pub consumer: Consumer,
    pub seeds: BTreeSet<OpId>,
}

impl Materialization {
    pub(crate) fn consumer_op(&self) -> Option<OpId> {
        match &self.consumer {
            Consumer::Op { op, .. } => Some(*op),
            Consumer::Output { .. } => None,
        }
    }
}

/// Everything one sweep learned about the block.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct Analysis {
    pub seeds: Vec<OpId>,
    pub absorbed: Vec<AbsorbedOp>,
    pub cancellations: Vec<Cancellation>,
    pub materializations: Vec<Materialization>,
}

/// Assigns a layout state to every value of `block` in one pass over its ops.
///
/// Transposes listed in `excluded` are never used as seeds.
pub(crate) fn analyse(block: &Block, excluded: &BTreeSet<OpId>) -> Analysis {
    let mut sweep = Sweep {
        block,
        excluded,
        states: HashMap::with_capacity(block.values.len()),
        analysis: Analysis::default(),
    };
    for op in &block.operations {
        sweep.visit(op);
    }
    sweep.finish_outputs();
    sweep.analysis
}

struct Sweep<'a> {
    block: &'a Block,
    excluded: &'a BTreeSet<OpId>,
    states: HashMap<ValueId, LayoutState>,
    analysis: Analysis,
}

impl Sweep<'_> {
    fn state(&self, value: ValueId) -> Option<(&[usize], &BTreeSet<OpId>)> {
        match self.states.get(&value) {
            Some(LayoutState::Lazy { perm, seeds }) => Some((perm, seeds)),
            _ => None,
        }
    }

    fn set_concrete(&mut self, op: &Operation) {
        for output in &op.outputs {
            self.states.insert(*output, LayoutState::Concrete);
        }
    }

    fn visit(&mut self, op: &Operation) {
        match &op.kind {
            OpKind::Const(_) => self.set_concrete(op),
            OpKind::Transpose(spec) => self.visit_transpose(op, &spec.perm),
            OpKind::Unary(_) | OpKind::Activation(_) => {
                let state = op
                    .inputs
                    .first()
                    .and_then(|input| self.states.get(input))
                    .cloned()
                    .unwrap_or(LayoutState::Concrete);
                for output in &op.outputs {
                    self.states.insert(*output, state.clone());
                }
            }
            _ => self.visit_general(op),
        }
    }

    fn visit_transpose(&mut self, op: &Operation, q: &[usize]) {
        let (Some(&input), Some(&output)) = (op.inputs.first(), op.outputs.first()) else {
            self.set_concrete(op);
            return;
        };
        match self.state(input) {
            None => {
                if self.excluded.contains(&op.id) || self.block.outputs.contains(&output) {
                    self.set_concrete(op);
                    return;
                }
                trace!(op = %op.id, perm = ?q, "seed transpose");
                self.analysis.seeds.push(op.id);
                self.states.insert(
                    output,
                    LayoutState::Lazy {
                        perm: q.to_vec(),
                        seeds: BTreeSet::from([op.id]),
                    },
                );
            }
            Some((pending, seeds)) => {
                let (pending, seeds) = (pending.to_vec(), seeds.clone());
                if perm::cancels(&pending, q) {
                    trace!(op = %op.id, "cancelling transpose");
                    self.analysis
                        .cancellations
                        .push(Cancellation { op: op.id, seeds });
                } else {
                    trace!(op = %op.id, "non-cancelling transpose materializes its input");
                    self.analysis.materializations.push(Materialization {
                        value: input,
                        perm: pending,
                        consumer: Consumer::Op {
                            op: op.id,
                            slots: vec![0],
                        },
                        seeds,
                    });
                }
                self.set_concrete(op);
            }
        }
    }

    fn visit_general(&mut self, op: &Operation) {
        let mut lazy: BTreeMap<ValueId, (Vec<usize>, BTreeSet<OpId>)> = BTreeMap::new();
        for input in &op.inputs {
            if let Some((pending, seeds)) = self.state(*input) {
                lazy.entry(*input)
                    .or_insert_with(|| (pending.to_vec(), seeds.clone()));
            }
        }
        let Some((pending, _)) = lazy.values().next() else {
            self.set_concrete(op);
            return;
        };
        let pending = pending.clone();

        let absorption = if lazy.values().all(|(other, _)| *other == pending) {
            self.views(op)
                .and_then(|views| oracle::absorb(&op.kind, &views, &pending))
        } else {
            None
        };

        match absorption {
            Some(absorption) => {
                let seeds: BTreeSet<OpId> = lazy
                    .into_values()
                    .flat_map(|(_, seeds)| seeds)
                    .collect();
                trace!(op = %op.id, kind = op.kind.name(), "absorbed pending transpose");
                let state = match &absorption.output_perm {
                    Some(perm) => LayoutState::Lazy {
                        perm: perm.clone(),
                        seeds: seeds.clone(),
                    },
                    None => LayoutState::Concrete,
                };
                for output in &op.outputs {
                    self.states.insert(*output, state.clone());
                }
                self.analysis.absorbed.push(AbsorbedOp {
                    op: op.id,
                    absorption,
                    seeds,
                });
            }
            None => {
                trace!(op = %op.id, kind = op.kind.name(), "boundary materializes lazy inputs");
                for (value, (perm, seeds)) in lazy {
                    let slots = op
                        .inputs
                        .iter()
                        .enumerate()
                        .filter(|(_, input)| **input == value)
                        .map(|(slot, _)| slot)
                        .collect();
                    self.analysis.materializations.push(Materialization {
                        value,
                        perm,
                        consumer: Consumer::Op { op: op.id, slots },
                        seeds,
                    });
                }
                self.set_concrete(op);
            }
        }
    }

    fn views(&self, op: &Operation) -> Option<Vec<InputView<'_>>> {
        op.inputs
            .iter()
            .map(|input| {
                if let Some((perm, _)) = self.state(*input) {
                    return Some(InputView::Lazy { perm });
                }
                if let Some(literal) = self.block.constant_of(*input) {
                    return Some(InputView::Constant { literal });
                }
                self.block
                    .type_of(*input)
                    .map(|ty| InputView::Concrete { ty })
            })
            .collect()
    }

    fn finish_outputs(&mut self) {
        let mut seen: BTreeSet<ValueId> = BTreeSet::new();
        for &output in &self.block.outputs {
            if !seen.insert(output) {
                continue;
            }
            let Some((perm, seeds)) = self.state(output) else {
                continue;
            };
            let slots = self
                .block
                .outputs
                .iter()
                .enumerate()
                .filter(|(_, value)| **value == output)
                .map(|(slot, _)| slot)
                .collect();
            let materialization = Materialization {
                value: output,
                perm: perm.to_vec(),
                consumer: Consumer::Output { slots },
                seeds: seeds.clone(),
            };
            self.analysis.materializations.push(materialization);
        }
    }
}
