//! Per-kind rules for pushing a pending permutation through an operation.
//!
//! Everything here is pure: the oracle looks at an op kind and the layout of
//! each input and either returns the rewritten op or refuses.

use crate::ir::perm;
use crate::ir::spec::{
    ConcatSpec, OpKind, PadMode, PadSpec, ReduceSpec, TensorLiteral, TensorType,
};

/// Layout of one op input as seen by the oracle.
#[derive(Debug, Clone, Copy)]
pub(crate) enum InputView<'a> {
    /// Carries the pending permutation shared by every lazy input of the op.
    Lazy { perm: &'a [usize] },
    /// Produced by a `const` op whose payload may be rewritten.
    Constant { literal: &'a TensorLiteral },
    /// Runtime value in its declared layout.
    Concrete { ty: &'a TensorType },
}

/// Rewritten form of an op that accepted a pending permutation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Absorption {
    pub kind: OpKind,
    /// Replacement payloads for constant inputs, keyed by input slot.
    pub constant_rewrites: Vec<(usize, TensorLiteral)>,
    /// Permutation still pending on the output, `None` when it is already concrete.
    pub output_perm: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbsorptionRule {
    Passthrough,
    Broadcast,
    Reduction,
    Concatenation,
    Padding,
    Boundary,
}

fn rule_for(kind: &OpKind) -> AbsorptionRule {
    match kind {
        OpKind::Unary(_) | OpKind::Activation(_) => AbsorptionRule::Passthrough,
        OpKind::Binary(_) => AbsorptionRule::Broadcast,
        OpKind::Reduce(_) => AbsorptionRule::Reduction,
        OpKind::Concat(_) => AbsorptionRule::Concatenation,
        OpKind::Pad(_) => AbsorptionRule::Padding,
        OpKind::Pool(_) | OpKind::Custom(_) | OpKind::Transpose(_) | OpKind::Const(_) => {
            AbsorptionRule::Boundary
        }
    }
}

/// Decides whether `kind` can run on the untransposed data behind its lazy inputs.
///
/// `perm` is the permutation pending on every `Lazy` input.
pub(crate) fn absorb(kind: &OpKind, views: &[InputView<'_>], perm: &[usize]) -> Option<Absorption> {
    let lazy_count = views
        .iter()
        .filter(|view| matches!(view, InputView::Lazy { .. }))
        .count();
    if lazy_count == 0 || !perm::is_permutation(perm) {
        return None;
    }
    if views
        .iter()
        .any(|view| matches!(view, InputView::Lazy { perm: other } if *other != perm))
    {
        return None;
    }

    match (rule_for(kind), kind) {
        (AbsorptionRule::Passthrough, _) => Some(Absorption {
            kind: kind.clone(),
            constant_rewrites: Vec::new(),
            output_perm: Some(perm.to_vec()),
        }),
        (AbsorptionRule::Broadcast, _) => absorb_broadcast(kind, views, perm),
        (AbsorptionRule::Reduction, OpKind::Reduce(spec)) => absorb_reduce(spec, perm),
        (AbsorptionRule::Concatenation, OpKind::Concat(spec)) => absorb_concat(spec, views, perm),
        (AbsorptionRule::Padding, OpKind::Pad(spec)) => absorb_pad(spec, perm),
        _ => None,
    }
}

fn absorb_broadcast(kind: &OpKind, views: &[InputView<'_>], perm: &[usize]) -> Option<Absorption> {
    let [lhs, rhs] = views else {
        return None;
    };
    let mut constant_rewrites = Vec::new();
    for (slot, view) in [(0usize, lhs), (1usize, rhs)] {
        match view {
            InputView::Lazy { .. } => {}
            InputView::Constant { literal } => {
                if let Some(rewritten) = broadcast_constant(literal, perm)? {
                    constant_rewrites.push((slot, rewritten));
                }
            }
            InputView::Concrete { ty } if ty.rank() == 0 => {}
            InputView::Concrete { .. } => return None,
        }
    }
    Some(Absorption {
        kind: kind.clone(),
        constant_rewrites,
        output_perm: Some(perm.to_vec()),
    })
}

/// Re-expresses a broadcast operand in the untransposed frame.
///
/// `Some(None)` leaves the constant as is; `None` refuses.
fn broadcast_constant(literal: &TensorLiteral, perm: &[usize]) -> Option<Option<TensorLiteral>> {
    let rank = perm.len();
    let dims = literal.ty.shape.static_dims()?;
    match dims.len() {
        0 => Some(None),
        r if r == rank => literal.permuted(&perm::inverse(perm)).ok().map(Some),
        1 if rank > 0 => {
            let mut target = vec![1usize; rank];
            target[perm[rank - 1]] = dims[0];
            literal.reshaped(&target).ok().map(Some)
        }
        _ => None,
    }
}

fn absorb_reduce(spec: &ReduceSpec, perm: &[usize]) -> Option<Absorption> {
    let rank = perm.len();
    if spec.axes.iter().any(|&axis| axis >= rank) {
        return None;
    }
    let axes: Vec<usize> = spec.axes.iter().map(|&axis| perm[axis]).collect();
    let output_perm = if spec.keep_dims {
        Some(perm.to_vec())
    } else {
        let reduced: Vec<usize> = if spec.axes.is_empty() {
            perm::identity(rank)
        } else {
            spec.axes.clone()
        };
        let remaining = perm::restrict_after_reduction(perm, &reduced);
        (!remaining.is_empty() && !perm::is_identity(&remaining)).then_some(remaining)
    };
    Some(Absorption {
        kind: OpKind::Reduce(ReduceSpec {
            kind: spec.kind,
            axes,
            keep_dims: spec.keep_dims,
        }),
        constant_rewrites: Vec::new(),
        output_perm,
    })
}

fn absorb_concat(spec: &ConcatSpec, views: &[InputView<'_>], perm: &[usize]) -> Option<Absorption> {
    let rank = perm.len();
    if spec.axis >= rank {
        return None;
    }
    let inverse = perm::inverse(perm);
    let mut constant_rewrites = Vec::new();
    for (slot, view) in views.iter().enumerate() {
        match view {
            InputView::Lazy { .. } => {}
            InputView::Constant { literal } if literal.ty.rank() == rank => {
                constant_rewrites.push((slot, literal.permuted(&inverse).ok()?));
            }
            InputView::Constant { .. } | InputView::Concrete { .. } => return None,
        }
    }
    Some(Absorption {
        kind: OpKind::Concat(ConcatSpec {
            axis: perm[spec.axis],
        }),
        constant_rewrites,
        output_perm: Some(perm.to_vec()),
    })
}

fn absorb_pad(spec: &PadSpec, perm: &[usize]) -> Option<Absorption> {
    let rank = perm.len();
    if rank < 2 || spec.pad.len() % 2 != 0 {
        return None;
    }
    let padded = spec.pad.len() / 2;
    if padded > rank {
        return None;
    }
    let rank_diff = rank - padded;
    let mut rows = vec![(0usize, 0usize); rank];
    for (row, axis) in (rank_diff..rank).enumerate() {
        rows[axis] = (spec.pad[2 * row], spec.pad[2 * row + 1]);
    }
    let mut moved = vec![(0usize, 0usize); rank];
    for (axis, row) in rows.into_iter().enumerate() {
        moved[perm[axis]] = row;
    }
    if moved[..rank_diff].iter().any(|&row| row != (0, 0)) {
        return None;
    }
    if spec.mode != PadMode::Constant && moved[..rank - 2].iter().any(|&row| row != (0, 0)) {
        return None;
    }
    let pad = moved[rank_diff..]
        .iter()
        .flat_map(|&(lo, hi)| [lo, hi])
        .collect();
    Some(Absorption {
        kind: OpKind::Pad(PadSpec {
            pad,
            mode: spec.mode,
            constant_val: spec.constant_val,
        }),
        constant_rewrites: Vec::new(),
        output_perm: Some(perm.to_vec()),
    })
}
