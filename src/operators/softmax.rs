//! Three-stage softmax, optionally causal-masked.
//!
//! Grounded on `examples/original_source/src/ops/softmax.cpp`, which owns a
//! private `Reduce(max)` instance to compute a row bias before its own
//! exp/sum/divide stages; this port keeps that shape, reusing
//! [`super::reduce::Reduce`] in its masked form (see `DESIGN.md`) instead of
//! duplicating the reduction tree.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::{CommandEncoder, DeferredTask};
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Constant, Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

use super::reduce::{Reduce, ReduceOp};

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
    offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ReducePush {
    num_chunks: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ApplyPush {
    row_size: u32,
    rows: u32,
}

pub struct Softmax {
    causal: bool,
    bias: Reduce,
    partial: Rc<Pipeline>,
    reduce: Rc<Pipeline>,
    apply: Rc<Pipeline>,
}

impl Softmax {
    pub fn new(device: &Arc<Device>, causal: bool) -> Result<Softmax, EngineError> {
        let bias = Reduce::new(device, ReduceOp::Max, causal)?;

        let partial = Pipeline::new(
            device,
            shaders::code(shaders::SOFTMAX_PARTIAL),
            &[Constant::I32(causal as i32)],
            ShaderInfo {
                binding_count: 4,
                push_constant_count: 4,
                local_x: REDUCE_LOCAL,
                local_y: 1,
                local_z: 1,
            },
        )?;
        let reduce = Pipeline::new(
            device,
            shaders::code(shaders::SOFTMAX_REDUCE),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 1,
                local_x: REDUCE_LOCAL,
                local_y: 1,
                local_z: 1,
            },
        )?;
        let apply = Pipeline::new(
            device,
            shaders::code(shaders::SOFTMAX_APPLY),
            &[],
            ShaderInfo {
                binding_count: 3,
                push_constant_count: 2,
                local_x: APPLY_LOCAL_X,
                local_y: APPLY_LOCAL_Y,
                local_z: 1,
            },
        )?;

        Ok(Softmax {
            causal,
            bias,
            partial: Rc::new(partial),
            reduce: Rc::new(reduce),
            apply: Rc::new(apply),
        })
    }

    /// `offset` is added to each row's own index when this `Softmax` was
    /// constructed with `causal = true`: column `j` is masked once `j >
    /// offset + row`. Ignored when not causal.
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
        offset: usize,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "softmax",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }
        let (c, h, w) = input.shape();
        let rows = c * h;
        let num_chunks = w.div_ceil(CHUNK_SIZE).max(1);
        let offset = if self.causal { offset } else { 0 };

        let bias = self.bias.call_masked(command, device, input, offset)?;

        let exp_out = Tensor::new(
            device,
            (c, h, w),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
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
            offset: offset as u32,
        };
        command.record_pipeline(
            &self.partial,
            &[input, &bias, &exp_out, &partials],
            bytemuck::bytes_of(&partial_push),
        );
        command.defer(DeferredTask::ReleaseStaging(bias));

        let inv_sum = Tensor::new(
            device,
            (1, rows, 1),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        self.reduce.set_group(rows as u32, 1, 1)?;
        let reduce_push = ReducePush { num_chunks: num_chunks as u32 };
        command.record_pipeline(&self.reduce, &[&partials, &inv_sum], bytemuck::bytes_of(&reduce_push));
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
        command.record_pipeline(&self.apply, &[&exp_out, &inv_sum, &output], bytemuck::bytes_of(&apply_push));
        command.defer(DeferredTask::ReleaseStaging(exp_out));
        command.defer(DeferredTask::ReleaseStaging(inv_sum));

        Ok(output)
    }
}
