use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::ir::builder::{BlockBuilder, BuildError};
use crate::ir::spec::{
    ActivationOp, ActivationSpec, BinaryOp, Block, ConcatSpec, DType, DimSymbol, Dimension,
    LiteralError, OpKind, PadMode, PadSpec, PoolKind, PoolSpec, ReduceKind, ReduceSpec, Shape,
    TensorLiteral, TensorType, TransposeSpec, UnaryOp, ValueId,
};

/// Errors raised while parsing the block text format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TextIrError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Literal(#[from] LiteralError),
}

impl TextIrError {
    fn new(msg: impl Into<String>) -> Self {
        TextIrError::Message(msg.into())
    }
}

/// Parses a single block written in the compact text format printed by `Block`'s `Display`.
///
/// # Example
/// ```
/// use milopt::ir::text::parse_block;
///
/// let block = parse_block(r#"
/// func @nchw(%x: tensor<f32, 1x2x3x4>) {
///   %t = transpose %x perm[0, 3, 1, 2] -> tensor<f32, 1x4x2x3>
///   %r = relu %t
///   return %r
/// }
/// "#).expect("valid block");
/// assert_eq!(block.op_types_in_program(), vec!["transpose", "relu"]);
/// ```
pub fn parse_block(src: &str) -> Result<Block, TextIrError> {
    let trimmed = src.trim();
    if trimmed.is_empty() {
        return Err(TextIrError::new("input is empty"));
    }
    let header_end = trimmed
        .find('{')
        .ok_or_else(|| TextIrError::new("missing `{` to start block body"))?;
    let body_end = trimmed
        .rfind('}')
        .ok_or_else(|| TextIrError::new("missing `}` to end block body"))?;
    if body_end <= header_end {
        return Err(TextIrError::new("block body is malformed"));
    }
    let (name, params) = parse_header(trimmed[..header_end].trim())?;

    let mut builder = BlockBuilder::new(name);
    let mut value_map: HashMap<String, ValueId> = HashMap::new();
    for Parameter { name, ty } in params {
        let id = builder.add_input(&name, parse_type(&ty)?)?;
        value_map.insert(name, id);
    }

    let mut results: Option<Vec<ValueId>> = None;
    for line in trimmed[header_end + 1..body_end].lines() {
        let statement = line.trim().trim_end_matches(';').trim();
        if statement.is_empty() || statement.starts_with("//") {
            continue;
        }
        if results.is_some() {
            return Err(TextIrError::new("`return` must be the last statement"));
        }
        if let Some(values) = statement.strip_prefix("return") {
            let ids = split_top_level(values.trim(), ',')
                .into_iter()
                .map(|token| lookup(&value_map, token))
                .collect::<Result<Vec<_>, _>>()?;
            results = Some(ids);
            continue;
        }
        parse_statement(statement, &mut builder, &mut value_map)?;
    }

    let results =
        results.ok_or_else(|| TextIrError::new("block must end with a `return` statement"))?;
    Ok(builder.finish(&results)?)
}

struct Parameter {
    name: String,
    ty: String,
}

fn parse_header(header: &str) -> Result<(String, Vec<Parameter>), TextIrError> {
    let header = header
        .strip_prefix("func")
        .ok_or_else(|| TextIrError::new("block header must start with `func`"))?
        .trim_start();
    let open_paren = header
        .find('(')
        .ok_or_else(|| TextIrError::new("missing `(` in block header"))?;
    let close_paren = find_matching(header, open_paren, '(', ')')
        .ok_or_else(|| TextIrError::new("missing `)` to close parameter list"))?;
    let name_section = header[..open_paren].trim();
    let name = name_section
        .strip_prefix('@')
        .unwrap_or(name_section)
        .trim();
    if name.is_empty() {
        return Err(TextIrError::new("block name cannot be empty"));
    }
    if !header[close_paren + 1..].trim().is_empty() {
        return Err(TextIrError::new(
            "unexpected tokens after the parameter list",
        ));
    }

    let params = header[open_paren + 1..close_paren].trim();
    if params.is_empty() {
        return Ok((name.to_string(), Vec::new()));
    }
    let params = split_top_level(params, ',')
        .into_iter()
        .map(|raw| {
            let (name, ty) = raw
                .split_once(':')
                .ok_or_else(|| TextIrError::new("parameter must be `%name: type`"))?;
            let name = normalize_value_name(name);
            if name.is_empty() {
                return Err(TextIrError::new("parameter name cannot be empty"));
            }
            Ok(Parameter {
                name,
                ty: ty.trim().to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((name.to_string(), params))
}

fn parse_statement(
    statement: &str,
    builder: &mut BlockBuilder,
    value_map: &mut HashMap<String, ValueId>,
) -> Result<(), TextIrError> {
    let (lhs, rest) = statement
        .split_once('=')
        .ok_or_else(|| TextIrError::new("statements must be of the form `%result = ...`"))?;
    let results = split_top_level(lhs, ',')
        .into_iter()
        .map(normalize_value_name)
        .collect::<Vec<_>>();
    if results.is_empty() || results.iter().any(|name| name.is_empty()) {
        return Err(TextIrError::new("result identifier cannot be empty"));
    }

    let (op_name, remainder) = parse_op_name(rest)?;
    let (operand_section, type_section) = match remainder.split_once("->") {
        Some((operands, ty)) => (operands, Some(ty.trim())),
        None => (remainder, None),
    };
    let (operand_tokens, attributes) = parse_operands_and_attributes(operand_section)?;
    let inputs = operand_tokens
        .iter()
        .map(|token| lookup(value_map, token))
        .collect::<Result<Vec<_>, _>>()?;
    let declared = type_section.map(parse_type_list).transpose()?;

    if let Some(custom) = op_name
        .strip_prefix("custom<")
        .and_then(|name| name.strip_suffix('>'))
    {
        let types = declared
            .ok_or_else(|| TextIrError::new(format!("custom op `{custom}` needs `-> type`")))?;
        if types.len() != results.len() {
            return Err(TextIrError::new(format!(
                "custom op `{custom}` declares {} types for {} results",
                types.len(),
                results.len()
            )));
        }
        let ids = builder.emit_custom(
            custom,
            &inputs,
            results.iter().cloned().zip(types).collect(),
        )?;
        for (name, id) in results.into_iter().zip(ids) {
            value_map.insert(name, id);
        }
        return Ok(());
    }

    if results.len() != 1 {
        return Err(TextIrError::new(format!(
            "`{op_name}` produces exactly one result"
        )));
    }
    let declared = match declared {
        Some(types) if types.len() == 1 => types.into_iter().next(),
        Some(_) => {
            return Err(TextIrError::new(format!(
                "`{op_name}` declares more than one result type"
            )))
        }
        None => None,
    };
    let attrs: HashMap<&str, &str> = attributes
        .iter()
        .map(|attr| (attr.name.as_str(), attr.value.as_str()))
        .collect();
    let kind = build_kind(&op_name, &attrs, declared.as_ref())?;
    let id = builder.emit_checked(&results[0], kind, &inputs, declared.as_ref())?;
    value_map.insert(results[0].clone(), id);
    Ok(())
}

fn build_kind(
    name: &str,
    attrs: &HashMap<&str, &str>,
    declared: Option<&TensorType>,
) -> Result<OpKind, TextIrError> {
    if let Some(op) = UnaryOp::from_name(name) {
        return Ok(OpKind::Unary(op));
    }
    if let Some(op) = ActivationOp::from_name(name) {
        let param = |key: &str| attrs.get(key).map_or(Ok(0.0), |value| parse_f64(value));
        return Ok(OpKind::Activation(ActivationSpec {
            op,
            alpha: param("alpha")?,
            beta: param("beta")?,
        }));
    }
    if let Some(op) = BinaryOp::from_name(name) {
        return Ok(OpKind::Binary(op));
    }
    if let Some(kind) = ReduceKind::from_name(name) {
        let axes = attrs
            .get("axes")
            .map(|value| parse_usize_list(value))
            .transpose()?
            .unwrap_or_default();
        let keep_dims = attrs
            .get("keep_dims")
            .map(|value| parse_bool(value))
            .transpose()?
            .unwrap_or(false);
        return Ok(OpKind::Reduce(ReduceSpec {
            kind,
            axes,
            keep_dims,
        }));
    }
    if let Some(kind) = PoolKind::from_name(name) {
        let kernel_sizes = parse_usize_list(required(attrs, name, "kernel")?)?;
        let strides = match attrs.get("strides") {
            Some(value) => parse_usize_list(value)?,
            None => vec![1; kernel_sizes.len()],
        };
        return Ok(OpKind::Pool(PoolSpec {
            kind,
            kernel_sizes,
            strides,
        }));
    }
    match name {
        "transpose" => Ok(OpKind::Transpose(TransposeSpec {
            perm: parse_usize_list(required(attrs, name, "perm")?)?,
        })),
        "concat" => {
            let axis = required(attrs, name, "axis")?.trim();
            let axis = axis
                .parse::<usize>()
                .map_err(|_| TextIrError::new(format!("invalid concat axis `{axis}`")))?;
            Ok(OpKind::Concat(ConcatSpec { axis }))
        }
        "pad" => {
            let pad = parse_usize_list(required(attrs, name, "pad")?)?;
            let mode = match attrs.get("mode") {
                Some(value) => PadMode::from_name(value.trim())
                    .ok_or_else(|| TextIrError::new(format!("unknown pad mode `{value}`")))?,
                None => PadMode::Constant,
            };
            let constant_val = match attrs.get("constant_val") {
                Some(value) => parse_f64(value)?,
                None => 0.0,
            };
            Ok(OpKind::Pad(PadSpec {
                pad,
                mode,
                constant_val,
            }))
        }
        "const" => {
            let ty = declared
                .cloned()
                .ok_or_else(|| TextIrError::new("`const` needs `-> type`"))?;
            let literal = if let Some(bytes) = attrs.get("bytes") {
                let bytes = parse_usize_list(bytes)?
                    .into_iter()
                    .map(|byte| {
                        u8::try_from(byte)
                            .map_err(|_| TextIrError::new(format!("byte `{byte}` out of range")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                TensorLiteral::new(ty, Arc::from(bytes))?
            } else {
                let values = parse_f64_list(required(attrs, name, "value")?)?;
                let values = splat(values, &ty)?;
                TensorLiteral::from_f64_values(ty, &values)?
            };
            Ok(OpKind::Const(literal))
        }
        other => Err(TextIrError::new(format!(
            "unsupported operation `{other}` in block text parser"
        ))),
    }
}

/// A single value fills the whole tensor.
fn splat(values: Vec<f64>, ty: &TensorType) -> Result<Vec<f64>, TextIrError> {
    let count = ty
        .element_count()
        .ok_or_else(|| TextIrError::new("constants need a static shape"))?;
    if values.len() == 1 && count != 1 {
        return Ok(vec![values[0]; count]);
    }
    Ok(values)
}

fn required<'a>(
    attrs: &HashMap<&str, &'a str>,
    op: &str,
    name: &str,
) -> Result<&'a str, TextIrError> {
    attrs
        .get(name)
        .copied()
        .ok_or_else(|| TextIrError::new(format!("`{op}` requires attribute `{name}[...]`")))
}

fn lookup(value_map: &HashMap<String, ValueId>, token: &str) -> Result<ValueId, TextIrError> {
    let name = normalize_value_name(token);
    value_map
        .get(&name)
        .copied()
        .ok_or_else(|| TextIrError::new(format!("unknown value `%{name}`")))
}

fn normalize_value_name(name: &str) -> String {
    name.trim().trim_start_matches('%').to_string()
}

fn parse_type_list(src: &str) -> Result<Vec<TensorType>, TextIrError> {
    let trimmed = src.trim();
    if let Some(body) = trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        return split_top_level(body, ',')
            .into_iter()
            .map(parse_type)
            .collect();
    }
    Ok(vec![parse_type(trimmed)?])
}

fn parse_type(src: &str) -> Result<TensorType, TextIrError> {
    let trimmed = src.trim();
    let body = trimmed
        .strip_prefix("tensor<")
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| {
            TextIrError::new(format!(
                "unsupported type `{trimmed}`; expected `tensor<dtype, dims>`"
            ))
        })?;
    let (dtype, dims) = match body.split_once(',') {
        Some((dtype, dims)) => (dtype, dims.trim()),
        None => (body, ""),
    };
    let dtype = DType::from_name(dtype)
        .ok_or_else(|| TextIrError::new(format!("unsupported dtype `{}`", dtype.trim())))?;
    let dims = if dims.is_empty() {
        Vec::new()
    } else {
        parse_dimensions(dims)?
    };
    Ok(TensorType::new(dtype, Shape::new(dims)))
}

fn parse_dimensions(src: &str) -> Result<Vec<Dimension>, TextIrError> {
    src.split('x')
        .map(|dim| {
            let dim = dim.trim();
            if let Some(symbol) = dim.strip_prefix('?') {
                if symbol.is_empty() {
                    return Err(TextIrError::new("dynamic dimension needs a symbol"));
                }
                return Ok(Dimension::Dynamic(DimSymbol::new(symbol)));
            }
            dim.parse::<usize>()
                .map(Dimension::Static)
                .map_err(|_| TextIrError::new(format!("invalid dimension `{dim}`")))
        })
        .collect()
}

fn split_top_level(input: &str, delimiter: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (idx, ch) in input.char_indices() {
        match ch {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => depth = depth.saturating_sub(1),
            c if c == delimiter && depth == 0 => {
                let piece = input[start..idx].trim();
                if !piece.is_empty() {
                    pieces.push(piece);
                }
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    let tail = input[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail);
    }
    pieces
}

fn parse_op_name(src: &str) -> Result<(String, &str), TextIrError> {
    let trimmed = src.trim_start();
    if trimmed.is_empty() {
        return Err(TextIrError::new("operation name is missing"));
    }
    let end = trimmed
        .char_indices()
        .find(|(_, ch)| ch.is_whitespace() || *ch == '(' || *ch == '%')
        .map_or(trimmed.len(), |(idx, _)| idx);
    let name = trimmed[..end].trim();
    if name.is_empty() {
        return Err(TextIrError::new("operation name cannot be empty"));
    }
    Ok((name.to_string(), trimmed[end..].trim_start()))
}

#[derive(Debug, Clone)]
struct AttributeExpr {
    name: String,
    value: String,
}

fn parse_operands_and_attributes(
    section: &str,
) -> Result<(Vec<String>, Vec<AttributeExpr>), TextIrError> {
    let mut operands = Vec::new();
    let mut attrs = Vec::new();
    let chars = section.trim();
    let bytes = chars.as_bytes();
    let len = bytes.len();
    let mut idx = 0usize;

    while idx < len {
        while idx < len && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= len {
            break;
        }
        match bytes[idx] {
            b'(' => {
                let end = find_matching(chars, idx, '(', ')')
                    .ok_or_else(|| TextIrError::new("unmatched `(` in operand list"))?;
                for token in split_top_level(&chars[idx + 1..end], ',') {
                    operands.push(token.to_string());
                }
                idx = end + 1;
            }
            b'%' => {
                let start = idx;
                idx += 1;
                while idx < len
                    && !bytes[idx].is_ascii_whitespace()
                    && bytes[idx] != b','
                    && bytes[idx] != b')'
                {
                    idx += 1;
                }
                operands.push(chars[start..idx].to_string());
            }
            b',' => {
                idx += 1;
            }
            _ => {
                let attr_start = idx;
                while idx < len && (bytes[idx].is_ascii_alphabetic() || bytes[idx] == b'_') {
                    idx += 1;
                }
                if idx >= len || bytes[idx] != b'[' {
                    return Err(TextIrError::new(format!(
                        "unexpected token starting at `{}`",
                        &chars[attr_start..]
                    )));
                }
                let name = chars[attr_start..idx].to_string();
                let end = find_matching(chars, idx, '[', ']')
                    .ok_or_else(|| TextIrError::new("unmatched `[` in attribute"))?;
                let value = chars[idx + 1..end].trim().to_string();
                attrs.push(AttributeExpr { name, value });
                idx = end + 1;
            }
        }
    }

    Ok((operands, attrs))
}

fn find_matching(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0isize;
    for (idx, ch) in src[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + idx);
            }
        }
    }
    None
}

fn parse_usize_list(value: &str) -> Result<Vec<usize>, TextIrError> {
    let inner = value.trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|token| {
            let tok = token.trim();
            tok.parse::<usize>()
                .map_err(|_| TextIrError::new(format!("invalid integer `{tok}`")))
        })
        .collect()
}

fn parse_f64(value: &str) -> Result<f64, TextIrError> {
    let tok = value.trim();
    tok.parse::<f64>()
        .map_err(|_| TextIrError::new(format!("invalid number `{tok}`")))
}

fn parse_f64_list(value: &str) -> Result<Vec<f64>, TextIrError> {
    let inner = value.trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner.split(',').map(parse_f64).collect()
}

fn parse_bool(value: &str) -> Result<bool, TextIrError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(TextIrError::new(format!(
            "invalid boolean literal `{other}`"
        ))),
    }
}

/// Builds a [`Block`] from the text format, panicking on parse errors. Intended for tests.
#[macro_export]
macro_rules! block {
    ($src:expr) => {{
        $crate::ir::text::parse_block($src).expect("failed to parse block text")
    }};
}
