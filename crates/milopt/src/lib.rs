//! Block-structured ML IR plus the graph passes that run over it.
//!
//! The [`ir`] module holds the data model (blocks, operations, values), the
//! mutable [`ir::rewriter::BlockRewriter`], a text format for tests and dumps,
//! a structural verifier and static shape inference. The [`passes`] module
//! holds the optimization passes, most notably
//! [`passes::reduce_transposes`].

pub(crate) mod env;
pub mod ir;
pub mod passes;

pub use ir::spec::{Block, OpId, OpKind, Operation, TensorLiteral, TensorType, Value, ValueId};
pub use passes::{BlockPass, PassError, PassResult};
