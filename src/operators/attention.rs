//! Multi-head causal self-attention with a persistent per-layer KV cache.
//!
//! Grounded on `examples/original_source/src/ops/multiheadattention_v2.{h,cpp}`,
//! which composes projection matmuls, rotary embedding, cache read/write and
//! a causal softmax around the same primitives rather than a single fused
//! kernel; this port keeps that decomposition.

use std::sync::Arc;

use crate::command::{CommandEncoder, DeferredTask};
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::tensor::Tensor;

use super::kv_cache::KvCache;
use super::matmul::{Activation, Broadcast, MatMul};
use super::rope::Rope;
use super::softmax::Softmax;
use super::transpose::Transpose;

pub struct MultiHeadAttention {
    heads: usize,
    head_dim: usize,
    q_proj: MatMul,
    k_proj: MatMul,
    v_proj: MatMul,
    o_proj: MatMul,
    qk: MatMul,
    weighted: MatMul,
    rope: Rope,
    softmax: Softmax,
    k_cache: KvCache,
    v_cache: KvCache,
    transpose: Transpose,
}

impl MultiHeadAttention {
    pub fn new(device: &Arc<Device>, heads: usize, head_dim: usize) -> Result<MultiHeadAttention, EngineError> {
        Ok(MultiHeadAttention {
            heads,
            head_dim,
            q_proj: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            k_proj: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            v_proj: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            o_proj: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            qk: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            weighted: MatMul::new(device, Activation::None, Broadcast::PerChannel, false)?,
            rope: Rope::new(device)?,
            softmax: Softmax::new(device, true)?,
            k_cache: KvCache::new(device)?,
            v_cache: KvCache::new(device)?,
            transpose: Transpose::new(device)?,
        })
    }

    /// `x` is `(1, seq, dim)`, `dim = heads * head_dim`. `k_cache`/`v_cache`
    /// are each `(heads, max_len, head_dim)`, pre-allocated for the whole
    /// sequence. `past_length` is the number of cached positions already
    /// written. Returns `(1, seq, dim)`.
    #[allow(clippy::too_many_arguments)]
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        x: &Tensor,
        w_q: &Tensor,
        w_k: &Tensor,
        w_v: &Tensor,
        w_o: &Tensor,
        k_cache: &Tensor,
        v_cache: &Tensor,
        past_length: usize,
    ) -> Result<Tensor, EngineError> {
        let (_, seq, _) = x.shape();

        let q = self.q_proj.call(command, device, x, w_q, 1.0, 0.0)?;
        let k = self.k_proj.call(command, device, x, w_k, 1.0, 0.0)?;
        let v = self.v_proj.call(command, device, x, w_v, 1.0, 0.0)?;

        q.reshape((seq, self.heads, self.head_dim))?;
        k.reshape((seq, self.heads, self.head_dim))?;
        v.reshape((seq, self.heads, self.head_dim))?;

        let q_heads = self.transpose.call(command, device, &q)?;
        let k_heads = self.transpose.call(command, device, &k)?;
        let v_heads = self.transpose.call(command, device, &v)?;
        command.defer(DeferredTask::ReleaseStaging(q));
        command.defer(DeferredTask::ReleaseStaging(k));
        command.defer(DeferredTask::ReleaseStaging(v));

        self.k_cache.update(command, k_cache, &k_heads, past_length)?;
        self.v_cache.update(command, v_cache, &v_heads, past_length)?;
        command.defer(DeferredTask::ReleaseStaging(k_heads));
        command.defer(DeferredTask::ReleaseStaging(v_heads));

        let kv_len = past_length + seq;
        let k_full = self.k_cache.read(command, device, k_cache, kv_len)?;
        let v_full = self.v_cache.read(command, device, v_cache, kv_len)?;

        let key_offset = past_length
            .checked_add(seq)
            .and_then(|total| total.checked_sub(k_full.height()))
            .ok_or_else(|| ShapeError::NegativeRopeOffset {
                offset: past_length,
                q_height: seq,
                k_height: k_full.height(),
            })?;

        let q_rot = self.rope.call(command, device, &q_heads, past_length)?;
        let k_rot = self.rope.call(command, device, &k_full, key_offset)?;
        command.defer(DeferredTask::ReleaseStaging(q_heads));
        command.defer(DeferredTask::ReleaseStaging(k_full));

        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let scores = self.qk.call(command, device, &q_rot, &k_rot, scale, 0.0)?;
        command.defer(DeferredTask::ReleaseStaging(q_rot));
        command.defer(DeferredTask::ReleaseStaging(k_rot));

        let probs = self.softmax.call(command, device, &scores, past_length)?;
        command.defer(DeferredTask::ReleaseStaging(scores));

        let weighted = self.weighted.call(command, device, &probs, &v_full, 1.0, 0.0)?;
        command.defer(DeferredTask::ReleaseStaging(probs));
        command.defer(DeferredTask::ReleaseStaging(v_full));

        let merged = self.transpose.call(command, device, &weighted)?;
        command.defer(DeferredTask::ReleaseStaging(weighted));
        merged.reshape((1, seq, self.heads * self.head_dim))?;

        let out = self.o_proj.call(command, device, &merged, w_o, 1.0, 0.0)?;
        command.defer(DeferredTask::ReleaseStaging(merged));
        Ok(out)
    }
}
