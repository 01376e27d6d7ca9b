use std::collections::HashSet;

use thiserror::Error;

use crate::ir::shape_inference::{ShapeError, ShapeInference, StaticShapeInference};
use crate::ir::spec::{
    Block, CustomSpec, OpId, OpKind, Operation, TensorLiteral, TensorType, Value, ValueId,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("value name `{name}` is already taken")]
    DuplicateName { name: String },
    #[error("value {value:?} does not belong to this block")]
    UnknownValue { value: ValueId },
    #[error("`{op}` declares {declared} but infers {inferred}")]
    TypeMismatch {
        op: String,
        declared: String,
        inferred: String,
    },
}

/// Append-only block construction with shape inference on every emitted op.
pub struct BlockBuilder {
    block: Block,
    inference: StaticShapeInference,
    names: HashSet<String>,
    next_value: u32,
    next_op: u32,
}

impl BlockBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            block: Block::new(name),
            inference: StaticShapeInference,
            names: HashSet::new(),
            next_value: 0,
            next_op: 0,
        }
    }

    pub fn add_input(&mut self, name: &str, ty: TensorType) -> Result<ValueId, BuildError> {
        let id = self.define_value(name.to_string(), ty)?;
        self.block.inputs.push(id);
        Ok(id)
    }

    /// Emits a single-output op with an auto-generated result name.
    pub fn emit(&mut self, kind: OpKind, inputs: &[ValueId]) -> Result<ValueId, BuildError> {
        let name = self.auto_name(kind.name());
        self.emit_named(&name, kind, inputs)
    }

    pub fn emit_named(
        &mut self,
        name: &str,
        kind: OpKind,
        inputs: &[ValueId],
    ) -> Result<ValueId, BuildError> {
        self.emit_checked(name, kind, inputs, None)
    }

    /// Like [`emit_named`](Self::emit_named), but fails unless inference reproduces `declared`.
    pub fn emit_checked(
        &mut self,
        name: &str,
        kind: OpKind,
        inputs: &[ValueId],
        declared: Option<&TensorType>,
    ) -> Result<ValueId, BuildError> {
        for input in inputs {
            if self.block.value(*input).is_none() {
                return Err(BuildError::UnknownValue { value: *input });
            }
        }
        if self.names.contains(name) {
            return Err(BuildError::DuplicateName {
                name: name.to_string(),
            });
        }
        let probe = Operation {
            id: OpId(self.next_op),
            kind,
            inputs: inputs.to_vec(),
            outputs: Vec::new(),
        };
        let ty = self
            .inference
            .infer(&self.block, &probe)?
            .into_iter()
            .next()
            .ok_or_else(|| ShapeError::Arity {
                op: probe.kind.name().to_string(),
                expected: 1,
                found: 0,
            })?;
        if let Some(declared) = declared {
            if *declared != ty {
                return Err(BuildError::TypeMismatch {
                    op: probe.kind.name().to_string(),
                    declared: declared.to_string(),
                    inferred: ty.to_string(),
                });
            }
        }
        let value = self.define_value(name.to_string(), ty)?;
        self.push_op(probe.kind, probe.inputs, vec![value]);
        Ok(value)
    }

    pub fn constant(&mut self, name: &str, literal: TensorLiteral) -> Result<ValueId, BuildError> {
        self.emit_named(name, OpKind::Const(literal), &[])
    }

    /// Emits an opaque op whose output types are taken as declared.
    pub fn emit_custom(
        &mut self,
        op_name: &str,
        inputs: &[ValueId],
        outputs: Vec<(String, TensorType)>,
    ) -> Result<Vec<ValueId>, BuildError> {
        for input in inputs {
            if self.block.value(*input).is_none() {
                return Err(BuildError::UnknownValue { value: *input });
            }
        }
        let ids = outputs
            .into_iter()
            .map(|(name, ty)| self.define_value(name, ty))
            .collect::<Result<Vec<_>, _>>()?;
        self.push_op(
            OpKind::Custom(CustomSpec {
                name: op_name.to_string(),
            }),
            inputs.to_vec(),
            ids.clone(),
        );
        Ok(ids)
    }

    pub fn type_of(&self, value: ValueId) -> Option<&TensorType> {
        self.block.type_of(value)
    }

    pub fn finish(mut self, outputs: &[ValueId]) -> Result<Block, BuildError> {
        for output in outputs {
            if self.block.value(*output).is_none() {
                return Err(BuildError::UnknownValue { value: *output });
            }
        }
        self.block.outputs = outputs.to_vec();
        Ok(self.block)
    }

    fn auto_name(&self, base: &str) -> String {
        let mut index = self.next_value as usize;
        loop {
            let candidate = format!("{base}_{index}");
            if !self.names.contains(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    fn define_value(&mut self, name: String, ty: TensorType) -> Result<ValueId, BuildError> {
        if !self.names.insert(name.clone()) {
            return Err(BuildError::DuplicateName { name });
        }
        let id = ValueId(self.next_value);
        self.next_value += 1;
        self.block.upsert_value(Value { id, name, ty });
        Ok(id)
    }

    fn push_op(&mut self, kind: OpKind, inputs: Vec<ValueId>, outputs: Vec<ValueId>) {
        let id = OpId(self.next_op);
        self.next_op += 1;
        self.block.operations.push(Operation {
            id,
            kind,
            inputs,
            outputs,
        });
    }
}
