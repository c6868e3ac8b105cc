//! Three-stage RMSNorm: `y = x · w / sqrt(mean(x²) + eps)`.
//!
//! Grounded on `examples/original_source/src/ops/rms_norm_v2.cpp`'s
//! partial/reduce/apply split, generalized over arbitrary row counts the
//! same way [`super::reduce::Reduce`] is.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::{CommandEncoder, DeferredTask};
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

const CHUNK_SIZE: usize = 256;
const REDUCE_LOCAL: u32 = 256;
const APPLY_LOCAL_X: u32 = 32;
const APPLY_LOCAL_Y: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PartialPush {
    row_size: u32,
    chunk_size: u32,
    num_chunks: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ReducePush {
    row_size: u32,
    num_chunks: u32,
    eps: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ApplyPush {
    row_size: u32,
    rows: u32,
}

pub struct RmsNorm {
    partial: Rc<Pipeline>,
    reduce: Rc<Pipeline>,
    apply: Rc<Pipeline>,
}

impl RmsNorm {
    pub fn new(device: &Arc<Device>) -> Result<RmsNorm, EngineError> {
        let partial = Pipeline::new(
            device,
            shaders::code(shaders::RMSNORM_PARTIAL),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 3,
                local_x: REDUCE_LOCAL,
                local_y: 1,
                local_z: 1,
            },
        )?;
        let reduce = Pipeline::new(
            device,
            shaders::code(shaders::RMSNORM_REDUCE),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 3,
                local_x: REDUCE_LOCAL,
                local_y: 1,
                local_z: 1,
            },
        )?;
        let apply = Pipeline::new(
            device,
            shaders::code(shaders::RMSNORM_APPLY),
            &[],
            ShaderInfo {
                binding_count: 4,
                push_constant_count: 2,
                local_x: APPLY_LOCAL_X,
                local_y: APPLY_LOCAL_Y,
                local_z: 1,
            },
        )?;
        Ok(RmsNorm {
            partial: Rc::new(partial),
            reduce: Rc::new(reduce),
            apply: Rc::new(apply),
        })
    }

    /// `weight` is a flat `(1, 1, row_size)` tensor broadcast across every row.
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
        weight: &Tensor,
        eps: f32,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "rmsnorm",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }
        let (c, h, w) = input.shape();
        if weight.width() != w {
            return Err(ShapeError::InvalidShape {
                op: "rmsnorm",
                shape: weight.shape(),
                reason: format!("weight width {} does not match row size {w}", weight.width()),
            }
            .into());
        }

        let rows = c * h;
        let num_chunks = w.div_ceil(CHUNK_SIZE).max(1);

        let partials = Tensor::new(
            device,
            (1, rows, num_chunks),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        self.partial.set_group(num_chunks as u32, rows as u32, 1)?;
        let partial_push = PartialPush {
            row_size: w as u32,
            chunk_size: CHUNK_SIZE as u32,
            num_chunks: num_chunks as u32,
        };
        command.record_pipeline(&self.partial, &[input, &partials], bytemuck::bytes_of(&partial_push));

        let inv_rms = Tensor::new(
            device,
            (1, rows, 1),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        self.reduce.set_group(rows as u32, 1, 1)?;
        let reduce_push = ReducePush {
            row_size: w as u32,
            num_chunks: num_chunks as u32,
            eps,
        };
        command.record_pipeline(&self.reduce, &[&partials, &inv_rms], bytemuck::bytes_of(&reduce_push));
        command.defer(DeferredTask::ReleaseStaging(partials));

        let output = Tensor::new(
            device,
            (c, h, w),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        self.apply
            .set_group(super::group_count(w, APPLY_LOCAL_X), super::group_count(rows, APPLY_LOCAL_Y), 1)?;
        let apply_push = ApplyPush { row_size: w as u32, rows: rows as u32 };
        command.record_pipeline(
            &self.apply,
            &[input, &inv_rms, weight, &output],
            bytemuck::bytes_of(&apply_push),
        );
        command.defer(DeferredTask::ReleaseStaging(inv_rms));

        Ok(output)
    }
}
