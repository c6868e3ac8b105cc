//! Compute operators: each wraps one or more [`crate::pipeline::Pipeline`]s
//! and exposes a `call`-style method that records a dispatch (or a short
//! sequence of dispatches) into a [`crate::command::CommandEncoder`] and
//! returns the output [`crate::tensor::Tensor`].
//!
//! Grounded on `examples/original_source/src/ops/*`: each `Op` subclass there
//! owns its pipeline(s) and is invoked like a function via `operator()`; this
//! port keeps that one-pipeline(-or-few)-per-operator shape but replaces the
//! virtual `Op` base class with concrete structs, per the "capability set"
//! redesign note.

pub mod argmax;
pub mod attention;
pub mod cast;
pub mod concat;
pub mod elementwise;
pub mod embedding;
pub mod feed_forward;
pub mod kv_cache;
pub mod matmul;
pub mod reduce;
pub mod rmsnorm;
pub mod rope;
pub mod slice;
pub mod softmax;
pub mod transpose;

#[inline]
pub(crate) fn group_count(total: usize, local: u32) -> u32 {
    ((total as u64 + local as u64 - 1) / local as u64) as u32
}
