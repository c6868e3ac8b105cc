//! Row-wise argmax over the last axis: `(c, h, w) -> (c, h, 1)` uint32.
//!
//! Grounded on `examples/original_source/src/ops/argop.h`, mirroring
//! [`super::reduce::Reduce`]'s two-stage partial/final shape.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::command::DeferredTask;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

const LOCAL_X: u32 = 256;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct PartialPush {
    row_size: u32,
    chunk_size: u32,
    num_chunks: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FinalPush {
    num_chunks: u32,
}

pub struct ArgMax {
    partial: Rc<Pipeline>,
    final_stage: Rc<Pipeline>,
}

impl ArgMax {
    pub fn new(device: &Arc<Device>) -> Result<ArgMax, EngineError> {
        let partial = Pipeline::new(
            device,
            shaders::code(shaders::ARGMAX_PARTIAL),
            &[],
            ShaderInfo {
                binding_count: 3,
                push_constant_count: 3,
                local_x: LOCAL_X,
                local_y: 1,
                local_z: 1,
            },
        )?;
        let final_stage = Pipeline::new(
            device,
            shaders::code(shaders::ARGMAX_FINAL),
            &[],
            ShaderInfo {
                binding_count: 3,
                push_constant_count: 1,
                local_x: LOCAL_X,
                local_y: 1,
                local_z: 1,
            },
        )?;
        Ok(ArgMax { partial: Rc::new(partial), final_stage: Rc::new(final_stage) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "argmax",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }
        let (c, h, w) = input.shape();
        let rows = c * h;
        let row_size = w;
        let num_chunks = row_size.div_ceil(LOCAL_X as usize).max(1);

        let partial_vals = Tensor::new(
            device,
            (1, rows, num_chunks),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        let partial_idxs = Tensor::new(
            device,
            (1, rows, num_chunks),
            DType::Uint32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        self.partial.set_group(num_chunks as u32, rows as u32, 1)?;
        let partial_push = PartialPush {
            row_size: row_size as u32,
            chunk_size: LOCAL_X,
            num_chunks: num_chunks as u32,
        };
        command.record_pipeline(
            &self.partial,
            &[input, &partial_vals, &partial_idxs],
            bytemuck::bytes_of(&partial_push),
        );

        let output = Tensor::new(
            device,
            (1, rows, 1),
            DType::Uint32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        self.final_stage.set_group(rows as u32, 1, 1)?;
        let final_push = FinalPush { num_chunks: num_chunks as u32 };
        command.record_pipeline(
            &self.final_stage,
            &[&partial_vals, &partial_idxs, &output],
            bytemuck::bytes_of(&final_push),
        );

        command.defer(DeferredTask::ReleaseStaging(partial_vals));
        command.defer(DeferredTask::ReleaseStaging(partial_idxs));

        output.reshape((c, h, 1))?;
        Ok(output)
    }
}
