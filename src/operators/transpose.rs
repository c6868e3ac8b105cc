//! Type-0 transpose: `(c, h, w) -> (h, c, w)`.
//!
//! Grounded on `examples/original_source/src/ops/transpose.cpp`'s tiled
//! permutation; only the one permutation the transformer block needs
//! (channel/height swap, width untouched) is implemented, matching the
//! spec's single named transpose type.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::EngineError;
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::Tensor;

const LOCAL_X: u32 = 32;
const LOCAL_Y: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    c: u32,
    h: u32,
    w: u32,
}

pub struct Transpose {
    pipeline: Rc<Pipeline>,
}

impl Transpose {
    pub fn new(device: &Arc<Device>) -> Result<Transpose, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::TRANSPOSE),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 3,
                local_x: LOCAL_X,
                local_y: LOCAL_Y,
                local_z: 1,
            },
        )?;
        Ok(Transpose { pipeline: Rc::new(pipeline) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
    ) -> Result<Tensor, EngineError> {
        let (c, h, w) = input.shape();
        let output = Tensor::new(
            device,
            (h, c, w),
            input.dtype(),
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        self.pipeline
            .set_group(super::group_count(w, LOCAL_X), super::group_count(c, LOCAL_Y), h as u32)?;
        let push = Push { c: c as u32, h: h as u32, w: w as u32 };
        command.record_pipeline(&self.pipeline, &[input, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}
