//! SwiGLU feed-forward block: `down(silu(x · Wgate^T) ⊙ (x · Wup^T))`.
//!
//! Grounded on `examples/original_source/src/ops/feed_forward.{h,cpp}`, which
//! composes the same `MatMul`/elementwise primitives rather than owning a
//! dedicated fused kernel.

use std::sync::Arc;

use crate::command::{CommandEncoder, DeferredTask};
use crate::device::Device;
use crate::error::EngineError;
use crate::tensor::Tensor;

use super::elementwise::{BinOp, Elementwise};
use super::matmul::{Activation, Broadcast, MatMul};

pub struct FeedForward {
    gate: MatMul,
    up: MatMul,
    down: MatMul,
    mul: Elementwise,
}

impl FeedForward {
    pub fn new(device: &Arc<Device>) -> Result<FeedForward, EngineError> {
        Ok(FeedForward {
            gate: MatMul::new(device, Activation::SiLU, Broadcast::PerChannel, true)?,
            up: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            down: MatMul::new(device, Activation::None, Broadcast::PerChannel, true)?,
            mul: Elementwise::new(device, BinOp::Mul)?,
        })
    }

    /// `x` is `(1, seq, dim)`. `w_gate`/`w_up` are `(1, ff_dim, dim)`,
    /// `w_down` is `(1, dim, ff_dim)` (all stored out-features-major, so
    /// every projection here transposes its weight).
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        x: &Tensor,
        w_gate: &Tensor,
        w_up: &Tensor,
        w_down: &Tensor,
    ) -> Result<Tensor, EngineError> {
        let gate = self.gate.call(command, device, x, w_gate, 1.0, 0.0)?;
        let up = self.up.call(command, device, x, w_up, 1.0, 0.0)?;
        let prod = self.mul.call(command, device, &gate, &up)?;
        command.defer(DeferredTask::ReleaseStaging(gate));
        command.defer(DeferredTask::ReleaseStaging(up));
        let out = self.down.call(command, device, &prod, w_down, 1.0, 0.0)?;
        command.defer(DeferredTask::ReleaseStaging(prod));
        Ok(out)
    }
}
