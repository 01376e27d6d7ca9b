use std::{fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

use crate::ir::perm;

/// Scalar element types carried by block values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Ui8,
    Si16,
    Si32,
    Si64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    /// Storage size of a single element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::Si8 | DType::Ui8 => 1,
            DType::Si16 | DType::F16 | DType::Bf16 => 2,
            DType::Si32 | DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::I1 => "i1",
            DType::Si8 => "si8",
            DType::Ui8 => "ui8",
            DType::Si16 => "si16",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let dtype = match name.trim().to_ascii_lowercase().as_str() {
            "i1" | "bool" => DType::I1,
            "si8" | "i8" => DType::Si8,
            "ui8" | "u8" => DType::Ui8,
            "si16" | "i16" => DType::Si16,
            "si32" | "i32" => DType::Si32,
            "si64" | "i64" => DType::Si64,
            "f16" | "fp16" => DType::F16,
            "bf16" => DType::Bf16,
            "f32" | "fp32" => DType::F32,
            "f64" | "fp64" => DType::F64,
            _ => return None,
        };
        Some(dtype)
    }
}

/// Names a symbolic dynamic dimension (e.g. `?B`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(*value),
            Dimension::Dynamic(_) => None,
        }
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Dimension::Static(1))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Static(value) => write!(f, "{value}"),
            Dimension::Dynamic(symbol) => write!(f, "?{}", symbol.as_str()),
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(
            dims.iter()
                .copied()
                .map(Dimension::Static)
                .collect::<Vec<_>>(),
        )
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<Dimension> {
        self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(Dimension::as_static).collect()
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in self.static_dims()? {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// Output axis `i` takes the extent of input axis `perm[i]`.
    pub fn permuted(&self, perm: &[usize]) -> Shape {
        Shape::new(perm::apply_to_shape(perm, &self.dims))
    }
}

/// Type of a block value: element type plus shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorType {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn static_shape(dtype: DType, dims: &[usize]) -> Self {
        Self::new(dtype, Shape::from_static(dims))
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Returns total byte length when the shape is static.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }

    /// Element type and rank agree; extents may differ.
    pub fn is_compatible_with(&self, other: &TensorType) -> bool {
        self.dtype == other.dtype && self.rank() == other.rank()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.rank() == 0 {
            return write!(f, "tensor<{}>", self.dtype.name());
        }
        let dims = self
            .shape
            .dims()
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        write!(f, "tensor<{}, {}>", self.dtype.name(), dims)
    }
}

/// Errors raised while building or transforming literal payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiteralError {
    #[error("literal requires a static shape, got {ty}")]
    DynamicShape { ty: TensorType },
    #[error("literal of type {ty} expects {expected} elements, got {found}")]
    ElementCount {
        ty: TensorType,
        expected: usize,
        found: usize,
    },
    #[error("literal of type {ty} expects {expected} bytes, got {found}")]
    ByteLength {
        ty: TensorType,
        expected: usize,
        found: usize,
    },
    #[error("dtype {dtype:?} has no numeric conversion")]
    UnsupportedDType { dtype: DType },
    #[error("permutation {perm:?} is invalid for rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
}

/// Dense compile-time tensor payload: little-endian, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub ty: TensorType,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(ty: TensorType, bytes: Arc<[u8]>) -> Result<Self, LiteralError> {
        let expected = ty
            .byte_len()
            .ok_or_else(|| LiteralError::DynamicShape { ty: ty.clone() })?;
        if expected != bytes.len() {
            return Err(LiteralError::ByteLength {
                ty,
                expected,
                found: bytes.len(),
            });
        }
        Ok(Self { ty, bytes })
    }

    pub fn from_f32(dims: &[usize], values: &[f32]) -> Result<Self, LiteralError> {
        let ty = TensorType::static_shape(DType::F32, dims);
        check_count(&ty, values.len())?;
        let bytes = values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<_>>();
        Self::new(ty, Arc::from(bytes))
    }

    pub fn from_i32(dims: &[usize], values: &[i32]) -> Result<Self, LiteralError> {
        let ty = TensorType::static_shape(DType::Si32, dims);
        check_count(&ty, values.len())?;
        let bytes = values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<_>>();
        Self::new(ty, Arc::from(bytes))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            ty: TensorType::static_shape(DType::F32, &[]),
            bytes: Arc::from(value.to_le_bytes().to_vec()),
        }
    }

    /// Encodes `values` into `ty`'s element type. Integers are truncated toward zero.
    pub fn from_f64_values(ty: TensorType, values: &[f64]) -> Result<Self, LiteralError> {
        check_count(&ty, values.len())?;
        let mut bytes = Vec::with_capacity(values.len() * ty.dtype.size_in_bytes());
        for &value in values {
            match ty.dtype {
                DType::I1 => bytes.push(u8::from(value != 0.0)),
                DType::Si8 => bytes.extend((value as i8).to_le_bytes()),
                DType::Ui8 => bytes.push(value as u8),
                DType::Si16 => bytes.extend((value as i16).to_le_bytes()),
                DType::Si32 => bytes.extend((value as i32).to_le_bytes()),
                DType::Si64 => bytes.extend((value as i64).to_le_bytes()),
                DType::Bf16 => {
                    let bits = (value as f32).to_bits();
                    bytes.extend(((bits >> 16) as u16).to_le_bytes());
                }
                DType::F32 => bytes.extend((value as f32).to_le_bytes()),
                DType::F64 => bytes.extend(value.to_le_bytes()),
                DType::F16 => return Err(LiteralError::UnsupportedDType { dtype: ty.dtype }),
            }
        }
        Self::new(ty, Arc::from(bytes))
    }

    /// Decodes the payload as `f64`s; `None` for dtypes without a numeric view.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        let width = self.ty.dtype.size_in_bytes();
        let values = self
            .bytes
            .chunks_exact(width)
            .map(|chunk| match self.ty.dtype {
                DType::I1 => Some(f64::from(u8::from(chunk[0] != 0))),
                DType::Si8 => Some(f64::from(chunk[0] as i8)),
                DType::Ui8 => Some(f64::from(chunk[0])),
                DType::Si16 => Some(f64::from(i16::from_le_bytes([chunk[0], chunk[1]]))),
                DType::Si32 => Some(f64::from(i32::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3],
                ]))),
                DType::Si64 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    Some(i64::from_le_bytes(raw) as f64)
                }
                DType::Bf16 => {
                    let bits = u32::from(u16::from_le_bytes([chunk[0], chunk[1]])) << 16;
                    Some(f64::from(f32::from_bits(bits)))
                }
                DType::F32 => Some(f64::from(f32::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3],
                ]))),
                DType::F64 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    Some(f64::from_le_bytes(raw))
                }
                DType::F16 => None,
            })
            .collect::<Option<Vec<_>>>()?;
        Some(values)
    }

    /// Byte-level axis permutation: output axis `i` reads input axis `perm[i]`.
    pub fn permuted(&self, perm: &[usize]) -> Result<TensorLiteral, LiteralError> {
        let dims = self
            .ty
            .shape
            .static_dims()
            .ok_or_else(|| LiteralError::DynamicShape {
                ty: self.ty.clone(),
            })?;
        if perm.len() != dims.len() || !perm::is_permutation(perm) {
            return Err(LiteralError::InvalidPermutation {
                perm: perm.to_vec(),
                rank: dims.len(),
            });
        }
        let out_dims = perm::apply_to_shape(perm, &dims);
        let width = self.ty.dtype.size_in_bytes();
        let in_strides = row_major_strides(&dims);
        let count: usize = out_dims.iter().product();
        let mut out = vec![0u8; count * width];
        let mut coord = vec![0usize; out_dims.len()];
        for index in 0..count {
            let mut remaining = index;
            for axis in (0..out_dims.len()).rev() {
                coord[axis] = remaining % out_dims[axis];
                remaining /= out_dims[axis];
            }
            let src = coord
                .iter()
                .enumerate()
                .map(|(axis, &c)| c * in_strides[perm[axis]])
                .sum::<usize>();
            out[index * width..(index + 1) * width]
                .copy_from_slice(&self.bytes[src * width..(src + 1) * width]);
        }
        Ok(TensorLiteral {
            ty: TensorType::static_shape(self.ty.dtype, &out_dims),
            bytes: Arc::from(out),
        })
    }

    /// Same payload viewed with a new static shape of equal element count.
    pub fn reshaped(&self, dims: &[usize]) -> Result<TensorLiteral, LiteralError> {
        let ty = TensorType::static_shape(self.ty.dtype, dims);
        TensorLiteral::new(ty, self.bytes.clone())
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

fn check_count(ty: &TensorType, found: usize) -> Result<(), LiteralError> {
    let expected = ty
        .element_count()
        .ok_or_else(|| LiteralError::DynamicShape { ty: ty.clone() })?;
    if expected != found {
        return Err(LiteralError::ElementCount {
            ty: ty.clone(),
            expected,
            found,
        });
    }
    Ok(())
}

pub(crate) fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride *= dims[axis];
    }
    strides
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("ty", &self.ty)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            ty: TensorType,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        TensorLiteral::new(helper.ty, Arc::<[u8]>::from(helper.bytes))
            .map_err(serde::de::Error::custom)
    }
}

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

named_enum!(
    /// Elementwise ops with a single tensor input.
    UnaryOp {
        Relu => "relu",
        Relu6 => "relu6",
        Log => "log",
        Identity => "identity",
        Sigmoid => "sigmoid",
        SigmoidHard => "sigmoid_hard",
        Tanh => "tanh",
        Exp => "exp",
        Exp2 => "exp2",
        Abs => "abs",
        Sqrt => "sqrt",
        Rsqrt => "rsqrt",
        Square => "square",
        Sign => "sign",
        Floor => "floor",
        Ceil => "ceil",
        Round => "round",
        Erf => "erf",
        Gelu => "gelu",
        Softplus => "softplus",
        Softsign => "softsign",
        Sin => "sin",
        Cos => "cos",
        Tan => "tan",
        Sinh => "sinh",
        Cosh => "cosh",
        Asin => "asin",
        Acos => "acos",
        Atan => "atan",
        Atanh => "atanh",
        LogicalNot => "logical_not",
    }
);

named_enum!(
    /// Elementwise activations carrying scalar `alpha`/`beta` parameters.
    ActivationOp {
        Clip => "clip",
        Threshold => "threshold",
        ClampedRelu => "clamped_relu",
        Elu => "elu",
        LeakyRelu => "leaky_relu",
        LinearActivation => "linear_activation",
        ScaledTanh => "scaled_tanh",
        SoftplusParametric => "softplus_parametric",
        ThresholdedRelu => "thresholded_relu",
    }
);

named_enum!(
    /// Elementwise ops with two inputs and numpy broadcasting.
    BinaryOp {
        Add => "add",
        Sub => "sub",
        Mul => "mul",
        RealDiv => "real_div",
        Maximum => "maximum",
        Minimum => "minimum",
    }
);

named_enum!(
    ReduceKind {
        Mean => "reduce_mean",
        Sum => "reduce_sum",
        Max => "reduce_max",
        Min => "reduce_min",
        Prod => "reduce_prod",
        L1Norm => "reduce_l1_norm",
        L2Norm => "reduce_l2_norm",
        LogSum => "reduce_log_sum",
        LogSumExp => "reduce_log_sum_exp",
        SumSquare => "reduce_sum_square",
    }
);

named_enum!(
    PadMode {
        Constant => "constant",
        Reflect => "reflect",
        Replicate => "replicate",
    }
);

named_enum!(
    /// Pooling over the trailing `kernel_sizes.len()` axes with valid padding.
    PoolKind {
        Avg => "avg_pool",
        Max => "max_pool",
        L2 => "l2_pool",
    }
);

/// Permutation payload for `transpose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Attribute payload for the parameterized activations. Unused parameters stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationSpec {
    pub op: ActivationOp,
    pub alpha: f64,
    pub beta: f64,
}

/// Attribute payload for the `reduce_*` family. Empty `axes` reduces every axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keep_dims: bool,
}

/// Attribute payload for `concat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Attribute payload for `pad`.
///
/// `pad` is the flat `[lo0, hi0, lo1, hi1, ...]` list covering the last
/// `pad.len() / 2` axes of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadSpec {
    pub pad: Vec<usize>,
    pub mode: PadMode,
    pub constant_val: f64,
}

/// Attribute payload for the pooling family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub kind: PoolKind,
    pub kernel_sizes: Vec<usize>,
    pub strides: Vec<usize>,
}

/// Opaque op the optimizer knows nothing about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomSpec {
    pub name: String,
}

/// Closed set of operation kinds understood by the IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Const(TensorLiteral),
    Transpose(TransposeSpec),
    Unary(UnaryOp),
    Activation(ActivationSpec),
    Binary(BinaryOp),
    Reduce(ReduceSpec),
    Concat(ConcatSpec),
    Pad(PadSpec),
    Pool(PoolSpec),
    Custom(CustomSpec),
}

impl OpKind {
    /// Textual op type, e.g. `transpose` or `reduce_mean`.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Const(_) => "const",
            OpKind::Transpose(_) => "transpose",
            OpKind::Unary(op) => op.name(),
            OpKind::Activation(spec) => spec.op.name(),
            OpKind::Binary(op) => op.name(),
            OpKind::Reduce(spec) => spec.kind.name(),
            OpKind::Concat(_) => "concat",
            OpKind::Pad(_) => "pad",
            OpKind::Pool(spec) => spec.kind.name(),
            OpKind::Custom(spec) => &spec.name,
        }
    }

    pub fn transpose(perm: impl Into<Vec<usize>>) -> Self {
        OpKind::Transpose(TransposeSpec { perm: perm.into() })
    }

    pub fn as_transpose(&self) -> Option<&TransposeSpec> {
        match self {
            OpKind::Transpose(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<&TensorLiteral> {
        match self {
            OpKind::Const(literal) => Some(literal),
            _ => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, OpKind::Custom(_))
    }
}

/// Stable handle of a value inside one block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ValueId(pub u32);

/// Stable handle of an operation inside one block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

impl Operation {
    /// Named slot of the input at `index` (`x`, `y`, `values[1]`, ...).
    pub fn input_slot(&self, index: usize) -> String {
        match &self.kind {
            OpKind::Binary(_) if index == 0 => "x".to_string(),
            OpKind::Binary(_) if index == 1 => "y".to_string(),
            OpKind::Concat(_) => format!("values[{index}]"),
            OpKind::Custom(_) => format!("arg{index}"),
            _ if index == 0 => "x".to_string(),
            _ => format!("arg{index}"),
        }
    }

    pub fn named_inputs(&self) -> Vec<(String, ValueId)> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(index, value)| (self.input_slot(index), *value))
            .collect()
    }

    /// Returns the single output of the op, if it has exactly one.
    pub fn output(&self) -> Option<ValueId> {
        match self.outputs.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub id: ValueId,
    pub name: String,
    pub ty: TensorType,
}

/// Ordered, acyclic list of operations with named inputs and declared outputs.
///
/// `values` holds one record per live value, sorted by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub operations: Vec<Operation>,
    pub values: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum BlockSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            operations: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn value(&self, id: ValueId) -> Option<&Value> {
        self.values
            .binary_search_by_key(&id, |value| value.id)
            .ok()
            .map(|index| &self.values[index])
    }

    pub fn value_mut(&mut self, id: ValueId) -> Option<&mut Value> {
        let index = self
            .values
            .binary_search_by_key(&id, |value| value.id)
            .ok()?;
        Some(&mut self.values[index])
    }

    /// Inserts or replaces the record for `value.id`, keeping `values` sorted.
    pub fn upsert_value(&mut self, value: Value) {
        match self.values.binary_search_by_key(&value.id, |v| v.id) {
            Ok(index) => self.values[index] = value,
            Err(index) => self.values.insert(index, value),
        }
    }

    pub fn remove_value(&mut self, id: ValueId) -> Option<Value> {
        let index = self.values.binary_search_by_key(&id, |v| v.id).ok()?;
        Some(self.values.remove(index))
    }

    pub fn value_by_name(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|value| value.name == name)
    }

    pub fn type_of(&self, id: ValueId) -> Option<&TensorType> {
        self.value(id).map(|value| &value.ty)
    }

    pub fn name_of(&self, id: ValueId) -> Option<&str> {
        self.value(id).map(|value| value.name.as_str())
    }

    pub fn op(&self, id: OpId) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    pub fn producer_of(&self, value: ValueId) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.outputs.contains(&value))
    }

    pub fn is_input(&self, value: ValueId) -> bool {
        self.inputs.contains(&value)
    }

    /// Payload of `value` when it is produced by a `const` op.
    pub fn constant_of(&self, value: ValueId) -> Option<&TensorLiteral> {
        self.producer_of(value)
            .and_then(|op| op.kind.as_const())
    }

    /// All operations whose type name is `kind`, in block order.
    pub fn find_ops(&self, kind: &str) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.kind.name() == kind)
            .collect()
    }

    /// Op type names in block order, excluding `const`.
    pub fn op_types_in_program(&self) -> Vec<String> {
        self.operations
            .iter()
            .filter(|op| !matches!(op.kind, OpKind::Const(_)))
            .map(|op| op.kind.name().to_string())
            .collect()
    }

    pub fn count_ops(&self, kind: &str) -> usize {
        self.operations
            .iter()
            .filter(|op| op.kind.name() == kind)
            .count()
    }

    pub fn output_types(&self) -> Vec<Option<TensorType>> {
        self.outputs
            .iter()
            .map(|value| self.type_of(*value).cloned())
            .collect()
    }

    pub fn to_json_string(&self) -> Result<String, BlockSerdeError> {
        serde_json::to_string_pretty(self).map_err(BlockSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, BlockSerdeError> {
        serde_json::from_str(src).map_err(BlockSerdeError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .inputs
            .iter()
            .map(|id| format!("%{}: {}", self.display_name(*id), self.display_type(*id)))
            .collect::<Vec<_>>()
            .join(", ");
        write_line(f, 0, &format!("func @{}({params}) {{", self.name))?;
        for op in &self.operations {
            write_line(f, 1, &self.format_operation(op))?;
        }
        let results = self
            .outputs
            .iter()
            .map(|id| format!("%{}", self.display_name(*id)))
            .collect::<Vec<_>>()
            .join(", ");
        write_line(f, 1, &format!("return {results}"))?;
        write_line(f, 0, "}")
    }
}

impl Block {
    fn display_name(&self, id: ValueId) -> String {
        match self.name_of(id) {
            Some(name) => name.to_string(),
            None => format!("<undef{}>", id.0),
        }
    }

    fn display_type(&self, id: ValueId) -> String {
        match self.type_of(id) {
            Some(ty) => ty.to_string(),
            None => "<unknown>".to_string(),
        }
    }

    fn format_operation(&self, op: &Operation) -> String {
        let results = op
            .outputs
            .iter()
            .map(|id| format!("%{}", self.display_name(*id)))
            .collect::<Vec<_>>()
            .join(", ");
        let operands = op
            .inputs
            .iter()
            .map(|id| format!("%{}", self.display_name(*id)))
            .collect::<Vec<_>>()
            .join(", ");
        let mut line = format!("{results} = ");
        match &op.kind {
            OpKind::Custom(spec) => line.push_str(&format!("custom<{}>", spec.name)),
            other => line.push_str(other.name()),
        }
        if !operands.is_empty() {
            line.push(' ');
            line.push_str(&operands);
        }
        let attrs = format_attributes(&op.kind);
        if !attrs.is_empty() {
            line.push(' ');
            line.push_str(&attrs);
        }
        let types = op
            .outputs
            .iter()
            .map(|id| self.display_type(*id))
            .collect::<Vec<_>>();
        if types.len() == 1 {
            line.push_str(&format!(" -> {}", types[0]));
        } else {
            line.push_str(&format!(" -> ({})", types.join(", ")));
        }
        line
    }
}

fn format_attributes(kind: &OpKind) -> String {
    match kind {
        OpKind::Const(literal) => match literal.to_f64_vec() {
            Some(values) => format!("value[{}]", join_display(&values)),
            None => format!("bytes[{}]", join_display(&literal.bytes)),
        },
        OpKind::Transpose(spec) => format!("perm[{}]", join_display(&spec.perm)),
        OpKind::Reduce(spec) => format!(
            "axes[{}] keep_dims[{}]",
            join_display(&spec.axes),
            spec.keep_dims
        ),
        OpKind::Concat(spec) => format!("axis[{}]", spec.axis),
        OpKind::Activation(spec) => format!("alpha[{}] beta[{}]", spec.alpha, spec.beta),
        OpKind::Pad(spec) => format!(
            "pad[{}] mode[{}] constant_val[{}]",
            join_display(&spec.pad),
            spec.mode.name(),
            spec.constant_val
        ),
        OpKind::Pool(spec) => format!(
            "kernel[{}] strides[{}]",
            join_display(&spec.kernel_sizes),
            join_display(&spec.strides)
        ),
        OpKind::Unary(_) | OpKind::Binary(_) | OpKind::Custom(_) => String::new(),
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    f.write_str(line)?;
    f.write_str("\n")
}
