use std::collections::HashMap;
use std::sync::Arc;

use milopt::ir::spec::{
    ActivationOp, ActivationSpec, BinaryOp, ConcatSpec, PadMode, PadSpec, PoolKind, PoolSpec,
    ReduceKind, ReduceSpec, TensorLiteral, UnaryOp,
};
use milopt::{Block, OpKind, Operation, ValueId};
use thiserror::Error;
use tracing::trace;

/// Row-major `f32` tensor living in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dims: Vec<usize>,
    data: Arc<[f32]>,
}

impl HostTensor {
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self, EvalError> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(EvalError::execution(format!(
                "tensor of shape {dims:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            dims,
            data: Arc::from(data),
        })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            dims: Vec::new(),
            data: Arc::from(vec![value]),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Largest elementwise difference, `None` when the shapes differ.
    pub fn max_abs_diff(&self, other: &HostTensor) -> Option<f32> {
        if self.dims != other.dims {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| {
                    if a.is_nan() && b.is_nan() {
                        0.0
                    } else {
                        (a - b).abs()
                    }
                })
                .fold(0.0f32, f32::max),
        )
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("execution error: {0}")]
    Execution(String),
    #[error("`{op}` is not supported: {reason}")]
    Unsupported { op: String, reason: String },
}

impl EvalError {
    pub fn execution(msg: impl Into<String>) -> Self {
        EvalError::Execution(msg.into())
    }

    pub fn unsupported(op: &str, reason: impl Into<String>) -> Self {
        EvalError::Unsupported {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}

/// Runs `block` on `inputs` and returns its outputs in declaration order.
pub fn evaluate(block: &Block, inputs: &[HostTensor]) -> Result<Vec<HostTensor>, EvalError> {
    if inputs.len() != block.inputs.len() {
        return Err(EvalError::execution(format!(
            "block `{}` takes {} inputs, got {}",
            block.name,
            block.inputs.len(),
            inputs.len()
        )));
    }
    let mut env: HashMap<ValueId, HostTensor> = HashMap::with_capacity(block.values.len());
    for (id, tensor) in block.inputs.iter().zip(inputs) {
        let declared = block
            .type_of(*id)
            .and_then(|ty| ty.shape.static_dims());
        if let Some(dims) = declared {
            if dims != tensor.dims {
                return Err(EvalError::execution(format!(
                    "input {id:?} expects shape {dims:?}, got {:?}",
                    tensor.dims
                )));
            }
        }
        env.insert(*id, tensor.clone());
    }

    for op in &block.operations {
        let args = op
            .inputs
            .iter()
            .map(|value| {
                env.get(value)
                    .cloned()
                    .ok_or_else(|| EvalError::execution(format!("operand {value:?} missing")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        trace!(op = %op.id, kind = op.kind.name(), "evaluate");
        let result = eval_op(op, &args)?;
        let output = op
            .output()
            .ok_or_else(|| EvalError::execution(format!("{} must have one output", op.id)))?;
        env.insert(output, result);
    }

    block
        .outputs
        .iter()
        .map(|value| {
            env.get(value)
                .cloned()
                .ok_or_else(|| EvalError::execution(format!("block output {value:?} missing")))
        })
        .collect()
}

fn eval_op(op: &Operation, args: &[HostTensor]) -> Result<HostTensor, EvalError> {
    match &op.kind {
        OpKind::Const(literal) => op_const(literal),
        OpKind::Transpose(spec) => op_transpose(expect_single(op, args)?, &spec.perm),
        OpKind::Unary(unary) => {
            let input = expect_single(op, args)?;
            let f = unary_fn(*unary);
            HostTensor::new(input.dims.clone(), input.data.iter().map(|&x| f(x)).collect())
        }
        OpKind::Activation(spec) => {
            let input = expect_single(op, args)?;
            let data = input.data.iter().map(|&x| activation(spec, x)).collect();
            HostTensor::new(input.dims.clone(), data)
        }
        OpKind::Binary(binary) => match args {
            [lhs, rhs] => op_binary(lhs, rhs, binary_fn(*binary)),
            _ => Err(EvalError::execution("binary op needs two operands")),
        },
        OpKind::Reduce(spec) => op_reduce(expect_single(op, args)?, spec),
        OpKind::Concat(spec) => op_concat(args, spec),
        OpKind::Pad(spec) => op_pad(expect_single(op, args)?, spec),
        OpKind::Pool(spec) => op_pool(expect_single(op, args)?, spec),
        OpKind::Custom(spec) => Err(EvalError::unsupported(
            &spec.name,
            "custom ops have no reference kernel",
        )),
    }
}

fn expect_single<'a>(op: &Operation, args: &'a [HostTensor]) -> Result<&'a HostTensor, EvalError> {
    match args {
        [single] => Ok(single),
        _ => Err(EvalError::execution(format!(
            "`{}` expects one operand, got {}",
            op.kind.name(),
            args.len()
        ))),
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize], coord: &mut [usize]) {
    for axis in (0..dims.len()).rev() {
        coord[axis] = index % dims[axis];
        index /= dims[axis];
    }
}

fn op_const(literal: &TensorLiteral) -> Result<HostTensor, EvalError> {
    let dims = literal
        .ty
        .shape
        .static_dims()
        .ok_or_else(|| EvalError::unsupported("const", "dynamic shape"))?;
    let values = literal
        .to_f64_vec()
        .ok_or_else(|| EvalError::unsupported("const", format!("dtype {:?}", literal.ty.dtype)))?;
    HostTensor::new(dims, values.into_iter().map(|v| v as f32).collect())
}

fn op_transpose(input: &HostTensor, perm: &[usize]) -> Result<HostTensor, EvalError> {
    let rank = input.dims.len();
    if perm.len() != rank {
        return Err(EvalError::execution("transpose perm rank mismatch"));
    }
    let out_dims: Vec<usize> = perm.iter().map(|&axis| input.dims[axis]).collect();
    let in_strides = compute_strides(&input.dims);
    let mut coord = vec![0usize; rank];
    let mut out = Vec::with_capacity(input.len());
    for index in 0..input.len() {
        unravel_index(index, &out_dims, &mut coord);
        let src: usize = coord
            .iter()
            .zip(perm)
            .map(|(&c, &axis)| c * in_strides[axis])
            .sum();
        out.push(input.data[src]);
    }
    HostTensor::new(out_dims, out)
}

fn activation(spec: &ActivationSpec, x: f32) -> f32 {
    let (alpha, beta) = (spec.alpha as f32, spec.beta as f32);
    match spec.op {
        ActivationOp::Clip => x.max(alpha).min(beta),
        ActivationOp::Threshold => x.max(alpha),
        ActivationOp::ClampedRelu => {
            let y = if x >= 0.0 { x } else { alpha * x };
            y.min(beta)
        }
        ActivationOp::Elu => {
            if x > 0.0 {
                x
            } else {
                alpha * x.exp_m1()
            }
        }
        ActivationOp::LeakyRelu => {
            if x >= 0.0 {
                x
            } else {
                alpha * x
            }
        }
        ActivationOp::LinearActivation => alpha * x + beta,
        ActivationOp::ScaledTanh => alpha * (beta * x).tanh(),
        ActivationOp::SoftplusParametric => alpha * (beta * x).exp().ln_1p(),
        ActivationOp::ThresholdedRelu => {
            if x >= alpha {
                x
            } else {
                0.0
            }
        }
    }
}

fn unary_fn(op: UnaryOp) -> fn(f32) -> f32 {
    match op {
        UnaryOp::Relu => |x| x.max(0.0),
        UnaryOp::Relu6 => |x| x.clamp(0.0, 6.0),
        UnaryOp::Log => f32::ln,
        UnaryOp::Identity => |x| x,
        UnaryOp::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
        UnaryOp::SigmoidHard => |x| (0.2 * x + 0.5).clamp(0.0, 1.0),
        UnaryOp::Tanh => f32::tanh,
        UnaryOp::Exp => f32::exp,
        UnaryOp::Exp2 => f32::exp2,
        UnaryOp::Abs => f32::abs,
        UnaryOp::Sqrt => f32::sqrt,
        UnaryOp::Rsqrt => |x| 1.0 / x.sqrt(),
        UnaryOp::Square => |x| x * x,
        UnaryOp::Sign => |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        },
        UnaryOp::Floor => f32::floor,
        UnaryOp::Ceil => f32::ceil,
        UnaryOp::Round => f32::round,
        UnaryOp::Erf => libm::erff,
        UnaryOp::Gelu => |x| 0.5 * x * (1.0 + libm::erff(x / std::f32::consts::SQRT_2)),
        UnaryOp::Softplus => |x| x.exp().ln_1p(),
        UnaryOp::Softsign => |x| x / (1.0 + x.abs()),
        UnaryOp::Sin => f32::sin,
        UnaryOp::Cos => f32::cos,
        UnaryOp::Tan => f32::tan,
        UnaryOp::Sinh => f32::sinh,
        UnaryOp::Cosh => f32::cosh,
        UnaryOp::Asin => f32::asin,
        UnaryOp::Acos => f32::acos,
        UnaryOp::Atan => f32::atan,
        UnaryOp::Atanh => f32::atanh,
        UnaryOp::LogicalNot => |x| if x == 0.0 { 1.0 } else { 0.0 },
    }
}

fn binary_fn(op: BinaryOp) -> fn(f32, f32) -> f32 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::RealDiv => |a, b| a / b,
        BinaryOp::Maximum => f32::max,
        BinaryOp::Minimum => f32::min,
    }
}

fn op_binary(
    lhs: &HostTensor,
    rhs: &HostTensor,
    f: fn(f32, f32) -> f32,
) -> Result<HostTensor, EvalError> {
    let rank = lhs.dims.len().max(rhs.dims.len());
    let align = |dims: &[usize]| -> Vec<usize> {
        let mut padded = vec![1usize; rank - dims.len()];
        padded.extend_from_slice(dims);
        padded
    };
    let (lhs_dims, rhs_dims) = (align(&lhs.dims), align(&rhs.dims));
    let mut out_dims = Vec::with_capacity(rank);
    for (&a, &b) in lhs_dims.iter().zip(&rhs_dims) {
        let dim = match (a, b) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(EvalError::execution(format!(
                    "cannot broadcast {:?} with {:?}",
                    lhs.dims, rhs.dims
                )))
            }
        };
        out_dims.push(dim);
    }
    let (lhs_strides, rhs_strides) = (compute_strides(&lhs_dims), compute_strides(&rhs_dims));
    let count: usize = out_dims.iter().product();
    let mut coord = vec![0usize; rank];
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        unravel_index(index, &out_dims, &mut coord);
        let (mut a, mut b) = (0usize, 0usize);
        for axis in 0..rank {
            if lhs_dims[axis] != 1 {
                a += coord[axis] * lhs_strides[axis];
            }
            if rhs_dims[axis] != 1 {
                b += coord[axis] * rhs_strides[axis];
            }
        }
        out.push(f(lhs.data[a], rhs.data[b]));
    }
    HostTensor::new(out_dims, out)
}

fn op_reduce(input: &HostTensor, spec: &ReduceSpec) -> Result<HostTensor, EvalError> {
    let rank = input.dims.len();
    let mut reduced = vec![spec.axes.is_empty(); rank];
    for &axis in &spec.axes {
        *reduced
            .get_mut(axis)
            .ok_or_else(|| EvalError::execution("reduce axis out of range"))? = true;
    }
    let kept_dims: Vec<usize> = input
        .dims
        .iter()
        .zip(&reduced)
        .map(|(&dim, &is_reduced)| if is_reduced { 1 } else { dim })
        .collect();
    let kept_strides = compute_strides(&kept_dims);
    let buckets: usize = kept_dims.iter().product();
    let group = input.len() / buckets.max(1);

    let init = match spec.kind {
        ReduceKind::Max => f64::NEG_INFINITY,
        ReduceKind::Min => f64::INFINITY,
        ReduceKind::Prod => 1.0,
        _ => 0.0,
    };
    let mut acc = vec![init; buckets];
    let mut coord = vec![0usize; rank];
    for (index, &value) in input.data.iter().enumerate() {
        unravel_index(index, &input.dims, &mut coord);
        let bucket: usize = (0..rank)
            .filter(|&axis| !reduced[axis])
            .map(|axis| coord[axis] * kept_strides[axis])
            .sum();
        let x = f64::from(value);
        let slot = &mut acc[bucket];
        *slot = match spec.kind {
            ReduceKind::Mean | ReduceKind::Sum | ReduceKind::LogSum => *slot + x,
            ReduceKind::Max => slot.max(x),
            ReduceKind::Min => slot.min(x),
            ReduceKind::Prod => *slot * x,
            ReduceKind::L1Norm => *slot + x.abs(),
            ReduceKind::L2Norm | ReduceKind::SumSquare => *slot + x * x,
            ReduceKind::LogSumExp => *slot + x.exp(),
        };
    }
    let out = acc
        .into_iter()
        .map(|value| {
            let value = match spec.kind {
                ReduceKind::Mean => value / group as f64,
                ReduceKind::L2Norm => value.sqrt(),
                ReduceKind::LogSum | ReduceKind::LogSumExp => value.ln(),
                _ => value,
            };
            value as f32
        })
        .collect();
    let out_dims = if spec.keep_dims {
        kept_dims
    } else {
        input
            .dims
            .iter()
            .zip(&reduced)
            .filter(|(_, is_reduced)| !**is_reduced)
            .map(|(&dim, _)| dim)
            .collect()
    };
    HostTensor::new(out_dims, out)
}

fn op_concat(inputs: &[HostTensor], spec: &ConcatSpec) -> Result<HostTensor, EvalError> {
    let first = inputs
        .first()
        .ok_or_else(|| EvalError::execution("concat needs at least one operand"))?;
    let axis = spec.axis;
    if axis >= first.dims.len() {
        return Err(EvalError::execution("concat axis out of range"));
    }
    let outer: usize = first.dims[..axis].iter().product();
    let mut out_dims = first.dims.clone();
    out_dims[axis] = 0;
    for input in inputs {
        if input.dims.len() != first.dims.len() {
            return Err(EvalError::execution("concat operands differ in rank"));
        }
        out_dims[axis] += input.dims[axis];
    }
    let mut out = Vec::with_capacity(out_dims.iter().product());
    for block in 0..outer {
        for input in inputs {
            let chunk: usize = input.dims[axis..].iter().product();
            out.extend_from_slice(&input.data[block * chunk..(block + 1) * chunk]);
        }
    }
    HostTensor::new(out_dims, out)
}

fn op_pad(input: &HostTensor, spec: &PadSpec) -> Result<HostTensor, EvalError> {
    let rank = input.dims.len();
    let padded = spec.pad.len() / 2;
    if spec.pad.len() % 2 != 0 || padded > rank {
        return Err(EvalError::execution("pad list does not fit the input rank"));
    }
    let first = rank - padded;
    let mut lo = vec![0usize; rank];
    let mut out_dims = input.dims.clone();
    for (row, axis) in (first..rank).enumerate() {
        lo[axis] = spec.pad[2 * row];
        out_dims[axis] += spec.pad[2 * row] + spec.pad[2 * row + 1];
        let (before, after) = (spec.pad[2 * row], spec.pad[2 * row + 1]);
        if spec.mode == PadMode::Reflect && (before >= input.dims[axis] || after >= input.dims[axis])
        {
            return Err(EvalError::execution("reflect pad wider than the padded axis"));
        }
    }
    let in_strides = compute_strides(&input.dims);
    let count: usize = out_dims.iter().product();
    let mut coord = vec![0usize; rank];
    let mut out = Vec::with_capacity(count);
    'outer: for index in 0..count {
        unravel_index(index, &out_dims, &mut coord);
        let mut src = 0usize;
        for axis in 0..rank {
            let extent = input.dims[axis] as isize;
            let mut c = coord[axis] as isize - lo[axis] as isize;
            if c < 0 || c >= extent {
                match spec.mode {
                    PadMode::Constant => {
                        out.push(spec.constant_val as f32);
                        continue 'outer;
                    }
                    PadMode::Reflect => {
                        c = if c < 0 { -c } else { 2 * (extent - 1) - c };
                    }
                    PadMode::Replicate => c = c.clamp(0, extent - 1),
                }
            }
            src += c as usize * in_strides[axis];
        }
        out.push(input.data[src]);
    }
    HostTensor::new(out_dims, out)
}

fn op_pool(input: &HostTensor, spec: &PoolSpec) -> Result<HostTensor, EvalError> {
    let rank = input.dims.len();
    let window = spec.kernel_sizes.len();
    if window == 0 || window > rank || spec.strides.len() != window {
        return Err(EvalError::execution("pool window does not fit the input rank"));
    }
    let first = rank - window;
    let mut out_dims = input.dims.clone();
    for (index, axis) in (first..rank).enumerate() {
        let (kernel, stride) = (spec.kernel_sizes[index], spec.strides[index]);
        if kernel == 0 || stride == 0 || kernel > input.dims[axis] {
            return Err(EvalError::execution("pool kernel does not fit the input"));
        }
        out_dims[axis] = (input.dims[axis] - kernel) / stride + 1;
    }
    let in_strides = compute_strides(&input.dims);
    let window_count: usize = spec.kernel_sizes.iter().product();
    let count: usize = out_dims.iter().product();
    let mut coord = vec![0usize; rank];
    let mut offset = vec![0usize; window];
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        unravel_index(index, &out_dims, &mut coord);
        let base: usize = (0..rank)
            .map(|axis| {
                let start = if axis >= first {
                    coord[axis] * spec.strides[axis - first]
                } else {
                    coord[axis]
                };
                start * in_strides[axis]
            })
            .sum();
        let mut acc = match spec.kind {
            PoolKind::Max => f32::NEG_INFINITY,
            PoolKind::Avg | PoolKind::L2 => 0.0,
        };
        for w in 0..window_count {
            unravel_index(w, &spec.kernel_sizes, &mut offset);
            let src = base
                + offset
                    .iter()
                    .enumerate()
                    .map(|(index, &o)| o * in_strides[first + index])
                    .sum::<usize>();
            let x = input.data[src];
            acc = match spec.kind {
                PoolKind::Avg => acc + x,
                PoolKind::Max => acc.max(x),
                PoolKind::L2 => acc + x * x,
            };
        }
        out.push(match spec.kind {
            PoolKind::Avg => acc / window_count as f32,
            PoolKind::Max => acc,
            PoolKind::L2 => acc.sqrt(),
        });
    }
    HostTensor::new(out_dims, out)
}
