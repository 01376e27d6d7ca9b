//! Block IR: data model, editing, construction, text format and checks.

pub mod builder;
pub mod index;
pub mod perm;
pub mod rewriter;
pub mod shape_inference;
pub mod spec;
pub mod text;
pub mod verify;
