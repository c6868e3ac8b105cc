//! Element-wise fp32<->fp16 cast.
//!
//! Grounded on `examples/original_source/src/ops/cast.cpp`.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

const LOCAL_X: u32 = 256;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    count: u32,
}

pub struct CastF32ToF16 {
    pipeline: Rc<Pipeline>,
}

impl CastF32ToF16 {
    pub fn new(device: &Arc<Device>) -> Result<CastF32ToF16, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::CAST_F32_TO_F16),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 1,
                local_x: LOCAL_X,
                local_y: 1,
                local_z: 1,
            },
        )?;
        Ok(CastF32ToF16 { pipeline: Rc::new(pipeline) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "cast_f32_to_f16",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }
        let output = Tensor::new(
            device,
            input.shape(),
            DType::Fp16,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        let count = input.elements();
        self.pipeline.set_group(super::group_count(count, LOCAL_X), 1, 1)?;
        let push = Push { count: count as u32 };
        command.record_pipeline(&self.pipeline, &[input, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}

pub struct CastF16ToF32 {
    pipeline: Rc<Pipeline>,
}

impl CastF16ToF32 {
    pub fn new(device: &Arc<Device>) -> Result<CastF16ToF32, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::CAST_F16_TO_F32),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 1,
                local_x: LOCAL_X,
                local_y: 1,
                local_z: 1,
            },
        )?;
        Ok(CastF16ToF32 { pipeline: Rc::new(pipeline) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp16 {
            return Err(ShapeError::DTypeMismatch {
                op: "cast_f16_to_f32",
                expected: DType::Fp16,
                actual: input.dtype(),
            }
            .into());
        }
        let output = Tensor::new(
            device,
            input.shape(),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        let count = input.elements();
        self.pipeline.set_group(super::group_count(count, LOCAL_X), 1, 1)?;
        let push = Push { count: count as u32 };
        command.record_pipeline(&self.pipeline, &[input, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}
