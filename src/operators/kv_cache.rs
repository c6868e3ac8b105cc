//! Per-layer key/value cache: an in-place update against a pre-allocated
//! `(heads, max_len, head_dim)` buffer, and a read that reuses
//! [`super::slice::Slice`] over the filled prefix.
//!
//! Grounded on `examples/original_source/src/ops/update_kv_cache.{h,cpp}` and
//! `read_kvcache_op.{h,cpp}`. The original gives the read its own dedicated
//! kernel; this port decided the read is exactly a slice of
//! `[0:heads, 0:offset+seq, 0:head_dim]` and reuses `Slice` instead of
//! carrying a second near-duplicate shader (see `DESIGN.md`).

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

use super::slice::Slice;

const LOCAL_X: u32 = 32;
const LOCAL_Y: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    heads: u32,
    seq: u32,
    head_dim: u32,
    max_len: u32,
    offset: u32,
}

pub struct KvCache {
    update: Rc<Pipeline>,
    slice: Slice,
}

impl KvCache {
    pub fn new(device: &Arc<Device>) -> Result<KvCache, EngineError> {
        let update = Pipeline::new(
            device,
            shaders::code(shaders::KV_CACHE_UPDATE),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 5,
                local_x: LOCAL_X,
                local_y: LOCAL_Y,
                local_z: 1,
            },
        )?;
        let slice = Slice::new(device)?;
        Ok(KvCache { update: Rc::new(update), slice })
    }

    /// Writes `input` (`(heads, seq, head_dim)`) into `cache`'s rows
    /// `[offset, offset + seq)`. `cache` must already be allocated with its
    /// full `(heads, max_len, head_dim)` extent.
    pub fn update(
        &self,
        command: &mut CommandEncoder,
        cache: &Tensor,
        input: &Tensor,
        offset: usize,
    ) -> Result<(), EngineError> {
        if input.dtype() != DType::Fp32 || cache.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "kv_cache_update",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }
        let (heads, seq, head_dim) = input.shape();
        let (cache_heads, max_len, cache_head_dim) = cache.shape();
        if heads != cache_heads || head_dim != cache_head_dim {
            return Err(ShapeError::InvalidShape {
                op: "kv_cache_update",
                shape: input.shape(),
                reason: format!("must match cache heads/head_dim {:?}", cache.shape()),
            }
            .into());
        }
        if offset + seq > max_len {
            return Err(ShapeError::InvalidShape {
                op: "kv_cache_update",
                shape: input.shape(),
                reason: format!("offset {offset} + seq {seq} exceeds max_len {max_len}"),
            }
            .into());
        }

        self.update.set_group(
            super::group_count(head_dim, LOCAL_X),
            super::group_count(seq, LOCAL_Y),
            heads as u32,
        )?;
        let push = Push {
            heads: heads as u32,
            seq: seq as u32,
            head_dim: head_dim as u32,
            max_len: max_len as u32,
            offset: offset as u32,
        };
        command.record_pipeline(&self.update, &[input, cache], bytemuck::bytes_of(&push));
        Ok(())
    }

    /// Reads back the filled prefix `[0:heads, 0:len, 0:head_dim]`.
    pub fn read(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        cache: &Tensor,
        len: usize,
    ) -> Result<Tensor, EngineError> {
        let (heads, _, head_dim) = cache.shape();
        self.slice.call(command, device, cache, 0, 0, 0, heads, len, head_dim)
    }
}
