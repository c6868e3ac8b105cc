//! Rotary position embedding: rotates adjacent `(x_2i, x_2i+1)` pairs by
//! `theta_i · position`, `theta_i = 10000^(-2i/head_dim)`.
//!
//! Grounded on `examples/original_source/src/ops/rope.cpp`; one `Rope`
//! instance is shared between the query and key rotations in
//! [`super::attention::MultiHeadAttention`], since the shader only ever
//! differs by the `offset` push constant.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

const LOCAL_X: u32 = 32;
const LOCAL_Y: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    channels: u32,
    height: u32,
    width: u32,
    offset: u32,
}

pub struct Rope {
    pipeline: Rc<Pipeline>,
}

impl Rope {
    pub fn new(device: &Arc<Device>) -> Result<Rope, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::ROPE),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 4,
                local_x: LOCAL_X,
                local_y: LOCAL_Y,
                local_z: 1,
            },
        )?;
        Ok(Rope { pipeline: Rc::new(pipeline) })
    }

    /// `input` is `(heads, seq, head_dim)`; `offset` is the absolute position
    /// of `input`'s row 0. `head_dim` must be even.
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
        offset: usize,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "rope",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }
        let (channels, height, width) = input.shape();
        if width % 2 != 0 {
            return Err(ShapeError::InvalidShape {
                op: "rope",
                shape: input.shape(),
                reason: "head_dim must be even".into(),
            }
            .into());
        }

        let output = Tensor::new(
            device,
            (channels, height, width),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        let half_width = width / 2;
        self.pipeline.set_group(
            super::group_count(half_width, LOCAL_X),
            super::group_count(height, LOCAL_Y),
            channels as u32,
        )?;
        let push = Push {
            channels: channels as u32,
            height: height as u32,
            width: width as u32,
            offset: offset as u32,
        };
        command.record_pipeline(&self.pipeline, &[input, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}
