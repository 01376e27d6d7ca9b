use thiserror::Error;

use crate::ir::perm;
use crate::ir::spec::{
    Block, ConcatSpec, DType, Dimension, OpKind, Operation, PadSpec, PoolSpec, ReduceSpec, Shape,
    TensorType, TransposeSpec, ValueId,
};

/// Errors raised while computing output types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("value {value:?} has no type record")]
    UnknownValue { value: ValueId },
    #[error("`{op}` expects {expected} inputs, got {found}")]
    Arity {
        op: String,
        expected: usize,
        found: usize,
    },
    #[error("`{op}`: element types differ ({lhs:?} vs {rhs:?})")]
    DTypeMismatch { op: String, lhs: DType, rhs: DType },
    #[error("`{op}`: {reason}")]
    Invalid { op: String, reason: String },
}

impl ShapeError {
    fn invalid(op: &Operation, reason: impl Into<String>) -> Self {
        ShapeError::Invalid {
            op: op.kind.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// Computes the output types of an op from the current types of its inputs.
pub trait ShapeInference: Send + Sync {
    fn infer(&self, block: &Block, op: &Operation) -> Result<Vec<TensorType>, ShapeError>;
}

/// Shape rules for every built-in op kind; custom ops keep their declared types.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticShapeInference;

impl ShapeInference for StaticShapeInference {
    fn infer(&self, block: &Block, op: &Operation) -> Result<Vec<TensorType>, ShapeError> {
        let inputs = op
            .inputs
            .iter()
            .map(|value| {
                block
                    .type_of(*value)
                    .ok_or(ShapeError::UnknownValue { value: *value })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ty = match &op.kind {
            OpKind::Custom(_) => {
                return op
                    .outputs
                    .iter()
                    .map(|value| {
                        block
                            .type_of(*value)
                            .cloned()
                            .ok_or(ShapeError::UnknownValue { value: *value })
                    })
                    .collect();
            }
            OpKind::Const(literal) => {
                expect_arity(op, &inputs, 0)?;
                literal.ty.clone()
            }
            OpKind::Transpose(spec) => infer_transpose(op, single(op, &inputs)?, spec)?,
            OpKind::Unary(_) | OpKind::Activation(_) => single(op, &inputs)?.clone(),
            OpKind::Binary(_) => {
                expect_arity(op, &inputs, 2)?;
                infer_broadcast(op, inputs[0], inputs[1])?
            }
            OpKind::Reduce(spec) => infer_reduce(op, single(op, &inputs)?, spec)?,
            OpKind::Concat(spec) => infer_concat(op, &inputs, spec)?,
            OpKind::Pad(spec) => infer_pad(op, single(op, &inputs)?, spec)?,
            OpKind::Pool(spec) => infer_pool(op, single(op, &inputs)?, spec)?,
        };
        Ok(vec![ty])
    }
}

/// Recomputes the output types of every op in block order.
pub fn infer_block_types(
    block: &mut Block,
    inference: &dyn ShapeInference,
) -> Result<(), ShapeError> {
    for index in 0..block.operations.len() {
        let types = inference.infer(block, &block.operations[index])?;
        let outputs = block.operations[index].outputs.clone();
        if types.len() != outputs.len() {
            return Err(ShapeError::invalid(
                &block.operations[index],
                format!("inferred {} types for {} outputs", types.len(), outputs.len()),
            ));
        }
        for (value, ty) in outputs.into_iter().zip(types) {
            let record = block
                .value_mut(value)
                .ok_or(ShapeError::UnknownValue { value })?;
            record.ty = ty;
        }
    }
    Ok(())
}

fn expect_arity(op: &Operation, inputs: &[&TensorType], expected: usize) -> Result<(), ShapeError> {
    if inputs.len() != expected {
        return Err(ShapeError::Arity {
            op: op.kind.name().to_string(),
            expected,
            found: inputs.len(),
        });
    }
    Ok(())
}

fn single<'t>(op: &Operation, inputs: &[&'t TensorType]) -> Result<&'t TensorType, ShapeError> {
    expect_arity(op, inputs, 1)?;
    Ok(inputs[0])
}

fn infer_transpose(
    op: &Operation,
    input: &TensorType,
    spec: &TransposeSpec,
) -> Result<TensorType, ShapeError> {
    if spec.perm.len() != input.rank() || !perm::is_permutation(&spec.perm) {
        return Err(ShapeError::invalid(
            op,
            format!("perm {:?} is invalid for rank {}", spec.perm, input.rank()),
        ));
    }
    Ok(TensorType::new(input.dtype, input.shape.permuted(&spec.perm)))
}

fn infer_broadcast(
    op: &Operation,
    lhs: &TensorType,
    rhs: &TensorType,
) -> Result<TensorType, ShapeError> {
    if lhs.dtype != rhs.dtype {
        return Err(ShapeError::DTypeMismatch {
            op: op.kind.name().to_string(),
            lhs: lhs.dtype,
            rhs: rhs.dtype,
        });
    }
    let rank = lhs.rank().max(rhs.rank());
    let lhs_dims = lhs.shape.dims();
    let rhs_dims = rhs.shape.dims();
    let mut dims = Vec::with_capacity(rank);
    for axis in 0..rank {
        let left = axis
            .checked_sub(rank - lhs_dims.len())
            .map(|index| &lhs_dims[index]);
        let right = axis
            .checked_sub(rank - rhs_dims.len())
            .map(|index| &rhs_dims[index]);
        let dim = match (left, right) {
            (Some(a), None) => a.clone(),
            (None, Some(b)) => b.clone(),
            (Some(a), Some(b)) if a == b => a.clone(),
            (Some(a), Some(b)) if a.is_one() => b.clone(),
            (Some(a), Some(b)) if b.is_one() => a.clone(),
            _ => {
                return Err(ShapeError::invalid(
                    op,
                    format!("cannot broadcast {lhs} with {rhs}"),
                ))
            }
        };
        dims.push(dim);
    }
    Ok(TensorType::new(lhs.dtype, Shape::new(dims)))
}

fn infer_reduce(
    op: &Operation,
    input: &TensorType,
    spec: &ReduceSpec,
) -> Result<TensorType, ShapeError> {
    let rank = input.rank();
    let mut reduced = vec![spec.axes.is_empty(); rank];
    for &axis in &spec.axes {
        match reduced.get_mut(axis) {
            Some(slot) if !*slot => *slot = true,
            Some(_) => {
                return Err(ShapeError::invalid(op, format!("axis {axis} listed twice")))
            }
            None => {
                return Err(ShapeError::invalid(
                    op,
                    format!("axis {axis} out of range for rank {rank}"),
                ))
            }
        }
    }
    let dims = input
        .shape
        .dims()
        .iter()
        .zip(&reduced)
        .filter_map(|(dim, &is_reduced)| match (is_reduced, spec.keep_dims) {
            (false, _) => Some(dim.clone()),
            (true, true) => Some(Dimension::Static(1)),
            (true, false) => None,
        })
        .collect::<Vec<_>>();
    Ok(TensorType::new(input.dtype, Shape::new(dims)))
}

fn infer_concat(
    op: &Operation,
    inputs: &[&TensorType],
    spec: &ConcatSpec,
) -> Result<TensorType, ShapeError> {
    let first = inputs
        .first()
        .ok_or_else(|| ShapeError::invalid(op, "needs at least one input"))?;
    let rank = first.rank();
    if spec.axis >= rank {
        return Err(ShapeError::invalid(
            op,
            format!("axis {} out of range for rank {rank}", spec.axis),
        ));
    }
    let mut total = 0usize;
    for ty in inputs {
        if ty.dtype != first.dtype {
            return Err(ShapeError::DTypeMismatch {
                op: op.kind.name().to_string(),
                lhs: first.dtype,
                rhs: ty.dtype,
            });
        }
        if ty.rank() != rank {
            return Err(ShapeError::invalid(op, "inputs must share a rank"));
        }
        for (axis, (dim, expected)) in ty.shape.dims().iter().zip(first.shape.dims()).enumerate() {
            if axis != spec.axis && dim != expected {
                return Err(ShapeError::invalid(
                    op,
                    format!("extent mismatch on axis {axis}: {ty} vs {first}"),
                ));
            }
        }
        total += ty.shape.dims()[spec.axis]
            .as_static()
            .ok_or_else(|| ShapeError::invalid(op, "concat axis must be static"))?;
    }
    let mut dims = first.shape.dims().to_vec();
    dims[spec.axis] = Dimension::Static(total);
    Ok(TensorType::new(first.dtype, Shape::new(dims)))
}

fn infer_pad(op: &Operation, input: &TensorType, spec: &PadSpec) -> Result<TensorType, ShapeError> {
    if spec.pad.len() % 2 != 0 {
        return Err(ShapeError::invalid(op, "pad list must have even length"));
    }
    let padded = spec.pad.len() / 2;
    let rank = input.rank();
    if padded > rank {
        return Err(ShapeError::invalid(
            op,
            format!("pads {padded} axes of a rank-{rank} input"),
        ));
    }
    let mut dims = input.shape.dims().to_vec();
    for (row, axis) in (rank - padded..rank).enumerate() {
        let (lo, hi) = (spec.pad[2 * row], spec.pad[2 * row + 1]);
        if lo == 0 && hi == 0 {
            continue;
        }
        let extent = dims[axis]
            .as_static()
            .ok_or_else(|| ShapeError::invalid(op, format!("padded axis {axis} must be static")))?;
        dims[axis] = Dimension::Static(extent + lo + hi);
    }
    Ok(TensorType::new(input.dtype, Shape::new(dims)))
}

fn infer_pool(op: &Operation, input: &TensorType, spec: &PoolSpec) -> Result<TensorType, ShapeError> {
    let window = spec.kernel_sizes.len();
    let rank = input.rank();
    if window == 0 || spec.strides.len() != window || window > rank {
        return Err(ShapeError::invalid(
            op,
            format!("kernel {:?} / strides {:?} do not fit rank {rank}", spec.kernel_sizes, spec.strides),
        ));
    }
    let mut dims = input.shape.dims().to_vec();
    for (index, axis) in (rank - window..rank).enumerate() {
        let kernel = spec.kernel_sizes[index];
        let stride = spec.strides[index];
        let extent = dims[axis]
            .as_static()
            .ok_or_else(|| ShapeError::invalid(op, format!("pooled axis {axis} must be static")))?;
        if kernel == 0 || stride == 0 || kernel > extent {
            return Err(ShapeError::invalid(
                op,
                format!("kernel {kernel} stride {stride} do not fit extent {extent}"),
            ));
        }
        dims[axis] = Dimension::Static((extent - kernel) / stride + 1);
    }
    Ok(TensorType::new(input.dtype, Shape::new(dims)))
}
