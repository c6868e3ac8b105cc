//! `C = act(scale · A · Bᵀ? + bias)`, optionally broadcasting one side's
//! channels across the other's.
//!
//! Grounded on `examples/original_source/src/ops/mat_mul.cpp`: one pipeline
//! per `(act, transpose_b, broadcast_type)` combination, a 2D-tiled 32x32
//! dispatch with channel as the third dimension, and output channel count
//! `max(a.channels(), b.channels())`.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Constant, Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::Tensor;

/// Fused activation applied after the scale/bias, matching the original
/// engine's `act` pipeline constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    None,
    SiLU,
}

/// Which side, if either, broadcasts a single channel across the other's
/// channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    /// Channels must match on both sides.
    PerChannel,
    /// `b` has exactly one channel, broadcast across `a`'s.
    Rhs,
    /// `a` has exactly one channel, broadcast across `b`'s.
    Lhs,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    c: u32,
    m: u32,
    n: u32,
    k: u32,
    scale: f32,
    bias: f32,
}

pub struct MatMul {
    pipeline: Rc<Pipeline>,
    transpose_b: bool,
    broadcast: Broadcast,
}

impl MatMul {
    pub fn new(
        device: &Arc<Device>,
        act: Activation,
        broadcast: Broadcast,
        transpose_b: bool,
    ) -> Result<MatMul, EngineError> {
        let specialization = [
            Constant::I32(match act {
                Activation::None => 0,
                Activation::SiLU => 1,
            }),
            Constant::I32(transpose_b as i32),
            Constant::I32(match broadcast {
                Broadcast::PerChannel => 0,
                Broadcast::Rhs => 1,
                Broadcast::Lhs => 2,
            }),
        ];
        let info = ShaderInfo {
            binding_count: 3,
            push_constant_count: 6,
            local_x: 32,
            local_y: 32,
            local_z: 1,
        };
        let pipeline = Pipeline::new(device, shaders::code(shaders::MATMUL), &specialization, info)?;
        Ok(MatMul {
            pipeline: Rc::new(pipeline),
            transpose_b,
            broadcast,
        })
    }

    /// `a(ca, m, k) × b(cb, k, n)` (or `b(cb, n, k)` when `transpose_b`),
    /// producing `(max(ca, cb), m, n)`.
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        a: &Tensor,
        b: &Tensor,
        scale: f32,
        bias: f32,
    ) -> Result<Tensor, EngineError> {
        match self.broadcast {
            Broadcast::PerChannel if a.channels() != b.channels() => {
                return Err(ShapeError::ContractingDimMismatch {
                    op: "matmul",
                    lhs: a.shape(),
                    rhs: b.shape(),
                }
                .into());
            }
            Broadcast::Rhs if b.channels() != 1 => {
                return Err(ShapeError::InvalidShape {
                    op: "matmul",
                    shape: b.shape(),
                    reason: "broadcast_type=rhs requires b.channels() == 1".into(),
                }
                .into());
            }
            Broadcast::Lhs if a.channels() != 1 => {
                return Err(ShapeError::InvalidShape {
                    op: "matmul",
                    shape: a.shape(),
                    reason: "broadcast_type=lhs requires a.channels() == 1".into(),
                }
                .into());
            }
            _ => {}
        }

        let k = a.width();
        let b_k = if self.transpose_b { b.width() } else { b.height() };
        if k != b_k {
            return Err(ShapeError::ContractingDimMismatch {
                op: "matmul",
                lhs: a.shape(),
                rhs: b.shape(),
            }
            .into());
        }

        let channels = a.channels().max(b.channels());
        let m = a.height();
        let n = if self.transpose_b { b.height() } else { b.width() };

        let out = Tensor::new(
            device,
            (channels, m, n),
            a.dtype(),
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        self.pipeline.set_group(
            super::group_count(n, 32),
            super::group_count(m, 32),
            channels as u32,
        )?;

        let push = Push {
            c: channels as u32,
            m: m as u32,
            n: n as u32,
            k: k as u32,
            scale,
            bias,
        };
        command.record_pipeline(&self.pipeline, &[a, b, &out], bytemuck::bytes_of(&push));
        Ok(out)
    }
}
