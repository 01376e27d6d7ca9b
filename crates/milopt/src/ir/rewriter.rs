use thiserror::Error;

use crate::ir::{
    index::{BlockIndexError, BlockIndices},
    spec::{Block, OpId, OpKind, Operation, TensorType, Value, ValueId},
};

/// Errors raised by [`BlockRewriter`] edit primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("operation {op} is not part of the block")]
    UnknownOp { op: OpId },
    #[error("value {value:?} is not part of the block")]
    UnknownValue { value: ValueId },
    #[error("operation {op} still has live uses of its outputs")]
    LiveUses { op: OpId },
    #[error("operation {op} produces a block output")]
    BlockOutput { op: OpId },
    #[error("cannot replace {old:?} ({old_ty}) with {new:?} ({new_ty}): dtype or rank differ")]
    TypeMismatch {
        old: ValueId,
        new: ValueId,
        old_ty: TensorType,
        new_ty: TensorType,
    },
    #[error("value {value:?} is not available at position {pos}")]
    ForwardReference { value: ValueId, pos: usize },
    #[error("slot {slot} is out of range")]
    InvalidSlot { slot: usize },
    #[error(transparent)]
    Index(#[from] BlockIndexError),
}

/// Mutable block editor with stable op/value identifiers and use-list accounting.
pub struct BlockRewriter<'a> {
    pub block: &'a mut Block,
    indices: BlockIndices,
}

impl<'a> BlockRewriter<'a> {
    /// Creates a rewriter for the provided block, indexing its body.
    pub fn new(block: &'a mut Block) -> Result<Self, BlockIndexError> {
        let indices = BlockIndices::build(block)?;
        Ok(Self { block, indices })
    }

    pub fn op(&self, op: OpId) -> Result<&Operation, RewriteError> {
        let pos = self.position(op)?;
        Ok(&self.block.operations[pos])
    }

    pub fn inputs(&self, op: OpId) -> Result<&[ValueId], RewriteError> {
        Ok(&self.op(op)?.inputs)
    }

    pub fn value(&self, value: ValueId) -> Result<&Value, RewriteError> {
        self.block
            .value(value)
            .ok_or(RewriteError::UnknownValue { value })
    }

    pub fn type_of(&self, value: ValueId) -> Option<&TensorType> {
        self.block.type_of(value)
    }

    pub fn producer_of(&self, value: ValueId) -> Option<OpId> {
        self.indices.producer_of(value)
    }

    pub fn users_of(&self, value: ValueId) -> &[OpId] {
        self.indices.users_of(value)
    }

    pub fn is_block_input(&self, value: ValueId) -> bool {
        self.indices.is_input(value)
    }

    /// Indices of the block-output list that hold `value`.
    pub fn output_slots_of(&self, value: ValueId) -> Vec<usize> {
        self.block
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, output)| **output == value)
            .map(|(slot, _)| slot)
            .collect()
    }

    pub fn ops_in_order(&self) -> Vec<OpId> {
        self.indices.ordered_op_ids()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.indices.contains(op)
    }

    /// Returns `base` if unused, otherwise the first free `base_<n>`.
    pub fn fresh_name(&self, base: &str) -> String {
        if self.indices.value_named(base).is_none() {
            return base.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{base}_{suffix}");
            if self.indices.value_named(&candidate).is_none() {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Rewrites every op input and block-output slot reading `old` to read `new`.
    pub fn replace_uses(&mut self, old: ValueId, new: ValueId) -> Result<(), RewriteError> {
        if old == new {
            return Ok(());
        }
        self.check_replaceable(old, new)?;
        let consumers = self.indices.users_of(old).to_vec();
        for op in consumers {
            self.replace_uses_in(op, old, new)?;
        }
        for output in &mut self.block.outputs {
            if *output == old {
                *output = new;
            }
        }
        Ok(())
    }

    /// Rewrites only `op`'s inputs reading `old` to read `new`.
    pub fn replace_uses_in(
        &mut self,
        op: OpId,
        old: ValueId,
        new: ValueId,
    ) -> Result<(), RewriteError> {
        if old == new {
            return Ok(());
        }
        self.check_replaceable(old, new)?;
        let pos = self.position(op)?;
        self.check_available(new, pos)?;
        for input in &mut self.block.operations[pos].inputs {
            if *input == old {
                *input = new;
            }
        }
        self.indices.update_operand_use(op, old, new, false)?;
        Ok(())
    }

    /// Points input `index` of `op` at `value`, leaving other uses untouched.
    pub fn set_input(&mut self, op: OpId, index: usize, value: ValueId) -> Result<(), RewriteError> {
        let pos = self.position(op)?;
        self.value(value)?;
        self.check_available(value, pos)?;
        let operation = &mut self.block.operations[pos];
        let slot = operation
            .inputs
            .get_mut(index)
            .ok_or(RewriteError::InvalidSlot { slot: index })?;
        let old = std::mem::replace(slot, value);
        let still_uses_old = operation.inputs.contains(&old);
        self.indices
            .update_operand_use(op, old, value, still_uses_old)?;
        Ok(())
    }

    /// Points block-output `slot` at `value`.
    pub fn set_output(&mut self, slot: usize, value: ValueId) -> Result<(), RewriteError> {
        if !self.indices.is_defined(value) {
            return Err(RewriteError::UnknownValue { value });
        }
        let entry = self
            .block
            .outputs
            .get_mut(slot)
            .ok_or(RewriteError::InvalidSlot { slot })?;
        *entry = value;
        Ok(())
    }

    /// Replaces the kind (attributes) of `op`; output types are left for shape inference.
    pub fn set_kind(&mut self, op: OpId, kind: OpKind) -> Result<(), RewriteError> {
        let pos = self.position(op)?;
        self.block.operations[pos].kind = kind;
        Ok(())
    }

    pub fn rename_value(&mut self, value: ValueId, name: &str) -> Result<(), RewriteError> {
        let old = self.value(value)?.name.clone();
        if old == name {
            return Ok(());
        }
        self.indices.rename(value, &old, name)?;
        if let Some(record) = self.block.value_mut(value) {
            record.name = name.to_string();
        }
        Ok(())
    }

    /// Gives `to` the name currently held by `from`; `from` receives a fresh derived name.
    pub fn transfer_name(&mut self, from: ValueId, to: ValueId) -> Result<(), RewriteError> {
        let name = self.value(from)?.name.clone();
        let parked = self.fresh_name(&format!("{name}_old"));
        self.rename_value(from, &parked)?;
        self.rename_value(to, &name)
    }

    pub fn set_value_type(&mut self, value: ValueId, ty: TensorType) -> Result<(), RewriteError> {
        let record = self
            .block
            .value_mut(value)
            .ok_or(RewriteError::UnknownValue { value })?;
        record.ty = ty;
        Ok(())
    }

    /// Inserts a new op immediately before `at`, returning its identifiers.
    pub fn insert_before(
        &mut self,
        at: OpId,
        kind: OpKind,
        inputs: Vec<ValueId>,
        outputs: Vec<(String, TensorType)>,
    ) -> Result<(OpId, Vec<ValueId>), RewriteError> {
        let pos = self.position(at)?;
        self.insert_operation(pos, kind, inputs, outputs)
    }

    /// Appends a new op at the end of the block.
    pub fn append_operation(
        &mut self,
        kind: OpKind,
        inputs: Vec<ValueId>,
        outputs: Vec<(String, TensorType)>,
    ) -> Result<(OpId, Vec<ValueId>), RewriteError> {
        let pos = self.block.operations.len();
        self.insert_operation(pos, kind, inputs, outputs)
    }

    /// Inserts a new op at `pos`; every input must already be available there.
    pub fn insert_operation(
        &mut self,
        pos: usize,
        kind: OpKind,
        inputs: Vec<ValueId>,
        outputs: Vec<(String, TensorType)>,
    ) -> Result<(OpId, Vec<ValueId>), RewriteError> {
        for input in &inputs {
            self.check_available(*input, pos)?;
        }
        let op_id = self.indices.allocate_op();
        let allocated = outputs
            .into_iter()
            .map(|(name, ty)| (self.indices.allocate_value(), name, ty))
            .collect::<Vec<_>>();
        let operation = Operation {
            id: op_id,
            kind,
            inputs,
            outputs: allocated.iter().map(|(id, _, _)| *id).collect(),
        };
        self.indices.insert_operation(pos, &operation, &allocated)?;
        for (id, name, ty) in &allocated {
            self.block.upsert_value(Value {
                id: *id,
                name: name.clone(),
                ty: ty.clone(),
            });
        }
        let ids = operation.outputs.clone();
        self.block.operations.insert(pos, operation);
        Ok((op_id, ids))
    }

    /// Removes `op`; fails while any output is consumed or declared as a block output.
    pub fn remove_operation(&mut self, op: OpId) -> Result<(), RewriteError> {
        let pos = self.position(op)?;
        let operation = &self.block.operations[pos];
        for output in &operation.outputs {
            if self.block.outputs.contains(output) {
                return Err(RewriteError::BlockOutput { op });
            }
            if !self.indices.users_of(*output).is_empty() {
                return Err(RewriteError::LiveUses { op });
            }
        }
        let operation = self.block.operations.remove(pos);
        let mut names = Vec::with_capacity(operation.outputs.len());
        for output in &operation.outputs {
            if let Some(value) = self.block.remove_value(*output) {
                names.push(value.name);
            }
        }
        self.indices.remove_operation(&operation, &names);
        Ok(())
    }

    /// Removes `op` when nothing reads its outputs; returns whether it was removed.
    pub fn erase_if_dead(&mut self, op: OpId) -> Result<bool, RewriteError> {
        let operation = self.op(op)?;
        let dead = operation.outputs.iter().all(|output| {
            self.indices.users_of(*output).is_empty() && !self.block.outputs.contains(output)
        });
        if !dead {
            return Ok(false);
        }
        self.remove_operation(op)?;
        Ok(true)
    }

    /// Verifies basic SSA invariants after mutations.
    pub fn verify(&self) -> bool {
        BlockIndices::build(self.block).is_ok()
    }

    fn position(&self, op: OpId) -> Result<usize, RewriteError> {
        self.indices
            .position(op)
            .ok_or(RewriteError::UnknownOp { op })
    }

    fn check_available(&self, value: ValueId, pos: usize) -> Result<(), RewriteError> {
        match self.indices.available_from(value) {
            Some(from) if from <= pos => Ok(()),
            Some(_) => Err(RewriteError::ForwardReference { value, pos }),
            None => Err(RewriteError::UnknownValue { value }),
        }
    }

    fn check_replaceable(&self, old: ValueId, new: ValueId) -> Result<(), RewriteError> {
        let old_ty = self.value(old)?.ty.clone();
        let new_ty = self.value(new)?.ty.clone();
        if !old_ty.is_compatible_with(&new_ty) {
            return Err(RewriteError::TypeMismatch {
                old,
                new,
                old_ty,
                new_ty,
            });
        }
        Ok(())
    }
}
