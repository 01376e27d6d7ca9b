use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use thiserror::Error;

use crate::ir::spec::{Block, OpId, Operation, TensorType, ValueId};

/// Structural side tables for a single block: positions, producers, users and names.
#[derive(Debug, Clone)]
pub struct BlockIndices {
    pub pos_of: HashMap<OpId, usize>,
    pub producer: HashMap<ValueId, OpId>,
    pub users: HashMap<ValueId, SmallVec<[OpId; 4]>>,
    names: HashMap<String, ValueId>,
    inputs: HashSet<ValueId>,
    pub next_value: u32,
    pub next_op: u32,
}

impl BlockIndices {
    /// Builds indices for the provided block and validates SSA invariants.
    pub fn build(block: &Block) -> Result<Self, BlockIndexError> {
        let mut defined: HashSet<ValueId> = HashSet::new();
        let mut pos_of = HashMap::with_capacity(block.operations.len());
        let mut producer = HashMap::new();
        let mut users: HashMap<ValueId, SmallVec<[OpId; 4]>> = HashMap::new();
        let mut names = HashMap::with_capacity(block.values.len());

        for value in &block.values {
            if names.insert(value.name.clone(), value.id).is_some() {
                return Err(BlockIndexError::DuplicateName {
                    name: value.name.clone(),
                });
            }
        }

        for input in &block.inputs {
            if block.value(*input).is_none() {
                return Err(BlockIndexError::MissingValueRecord { value: *input });
            }
            if !defined.insert(*input) {
                return Err(BlockIndexError::DuplicateValue { value: *input });
            }
        }

        for (index, op) in block.operations.iter().enumerate() {
            if pos_of.insert(op.id, index).is_some() {
                return Err(BlockIndexError::DuplicateOp { op: op.id });
            }
            for input in &op.inputs {
                if !defined.contains(input) {
                    return Err(BlockIndexError::MissingValueDefinition { value: *input });
                }
                push_user(&mut users, *input, op.id);
            }
            for output in &op.outputs {
                if block.value(*output).is_none() {
                    return Err(BlockIndexError::MissingValueRecord { value: *output });
                }
                if !defined.insert(*output) {
                    return Err(BlockIndexError::DuplicateValue { value: *output });
                }
                producer.insert(*output, op.id);
            }
        }

        for output in &block.outputs {
            if !defined.contains(output) {
                return Err(BlockIndexError::MissingValueDefinition { value: *output });
            }
        }

        let max_value = block.values.iter().map(|value| value.id.0).max();
        let max_op = block.operations.iter().map(|op| op.id.0).max();

        Ok(BlockIndices {
            pos_of,
            producer,
            users,
            names,
            inputs: block.inputs.iter().copied().collect(),
            next_value: max_value.map_or(0, |id| id + 1),
            next_op: max_op.map_or(0, |id| id + 1),
        })
    }

    /// Returns the position of the op in block order.
    pub fn position(&self, op: OpId) -> Option<usize> {
        self.pos_of.get(&op).copied()
    }

    /// Returns the op producing the given value; `None` for block inputs.
    pub fn producer_of(&self, value: ValueId) -> Option<OpId> {
        self.producer.get(&value).copied()
    }

    /// Returns the distinct ops consuming the value.
    pub fn users_of(&self, value: ValueId) -> &[OpId] {
        self.users
            .get(&value)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_input(&self, value: ValueId) -> bool {
        self.inputs.contains(&value)
    }

    pub fn is_defined(&self, value: ValueId) -> bool {
        self.inputs.contains(&value) || self.producer.contains_key(&value)
    }

    /// Position at which `value` becomes available: `0` for inputs, producer position + 1 otherwise.
    pub fn available_from(&self, value: ValueId) -> Option<usize> {
        if self.is_input(value) {
            return Some(0);
        }
        let op = self.producer_of(value)?;
        self.position(op).map(|pos| pos + 1)
    }

    pub fn value_named(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.pos_of.contains_key(&op)
    }

    pub fn ordered_op_ids(&self) -> Vec<OpId> {
        let mut entries: Vec<_> = self.pos_of.iter().map(|(op, pos)| (*op, *pos)).collect();
        entries.sort_by_key(|&(_, pos)| pos);
        entries.into_iter().map(|(op, _)| op).collect()
    }

    pub(crate) fn allocate_op(&mut self) -> OpId {
        let op = OpId(self.next_op);
        self.next_op += 1;
        op
    }

    pub(crate) fn allocate_value(&mut self) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        value
    }

    pub(crate) fn insert_operation(
        &mut self,
        pos: usize,
        operation: &Operation,
        outputs: &[(ValueId, String, TensorType)],
    ) -> Result<(), BlockIndexError> {
        for (value, name, _) in outputs {
            if self.producer.contains_key(value) || self.inputs.contains(value) {
                return Err(BlockIndexError::DuplicateValue { value: *value });
            }
            if self.names.contains_key(name) {
                return Err(BlockIndexError::DuplicateName { name: name.clone() });
            }
        }
        for input in &operation.inputs {
            if !self.is_defined(*input) {
                return Err(BlockIndexError::MissingValueDefinition { value: *input });
            }
        }

        self.shift_positions_from(pos, 1);
        self.pos_of.insert(operation.id, pos);
        for (value, name, _) in outputs {
            self.producer.insert(*value, operation.id);
            self.names.insert(name.clone(), *value);
        }
        for input in &operation.inputs {
            push_user(&mut self.users, *input, operation.id);
        }
        Ok(())
    }

    pub(crate) fn remove_operation(&mut self, operation: &Operation, output_names: &[String]) {
        if let Some(pos) = self.pos_of.remove(&operation.id) {
            self.shift_positions_from(pos + 1, -1);
        }
        for output in &operation.outputs {
            self.producer.remove(output);
            self.users.remove(output);
        }
        for name in output_names {
            self.names.remove(name);
        }
        for input in &operation.inputs {
            self.remove_user(*input, operation.id);
        }
    }

    /// Records that `op` no longer reads `from` (if it has no other use of it) and now reads `to`.
    pub(crate) fn update_operand_use(
        &mut self,
        op: OpId,
        from: ValueId,
        to: ValueId,
        still_uses_from: bool,
    ) -> Result<(), BlockIndexError> {
        if !self.is_defined(to) {
            return Err(BlockIndexError::MissingValueDefinition { value: to });
        }
        if !still_uses_from {
            self.remove_user(from, op);
        }
        push_user(&mut self.users, to, op);
        Ok(())
    }

    pub(crate) fn rename(&mut self, value: ValueId, old: &str, new: &str) -> Result<(), BlockIndexError> {
        if self.names.contains_key(new) {
            return Err(BlockIndexError::DuplicateName {
                name: new.to_string(),
            });
        }
        self.names.remove(old);
        self.names.insert(new.to_string(), value);
        Ok(())
    }

    fn remove_user(&mut self, value: ValueId, op: OpId) {
        if let Some(list) = self.users.get_mut(&value) {
            list.retain(|id| *id != op);
            if list.is_empty() {
                self.users.remove(&value);
            }
        }
    }

    fn shift_positions_from(&mut self, start: usize, delta: isize) {
        if delta == 0 {
            return;
        }
        for (_, pos) in self.pos_of.iter_mut() {
            if *pos >= start {
                if delta.is_positive() {
                    *pos += delta.unsigned_abs();
                } else {
                    *pos -= delta.unsigned_abs();
                }
            }
        }
    }
}

fn push_user(users: &mut HashMap<ValueId, SmallVec<[OpId; 4]>>, value: ValueId, op: OpId) {
    let list = users.entry(value).or_default();
    if !list.contains(&op) {
        list.push(op);
    }
}

/// Errors surfaced when indexing a block.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockIndexError {
    #[error("duplicate definition of value {value:?}")]
    DuplicateValue { value: ValueId },
    #[error("value {value:?} is used but never defined")]
    MissingValueDefinition { value: ValueId },
    #[error("value {value:?} has no value record")]
    MissingValueRecord { value: ValueId },
    #[error("value name `{name}` is not unique")]
    DuplicateName { name: String },
    #[error("operation {op} appears more than once")]
    DuplicateOp { op: OpId },
}
