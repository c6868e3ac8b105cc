//! Copies `[c0:c0+ec, h0:h0+eh, w0:w0+ew]` out of a tensor into a fresh one.
//!
//! Grounded on `examples/original_source/src/ops/slice.cpp`. Also backs the
//! KV-cache read in [`super::kv_cache`], since a cache read is exactly a
//! slice along the height axis starting at 0 (see `DESIGN.md`).

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::Tensor;

const LOCAL_X: u32 = 32;
const LOCAL_Y: u32 = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    in_h: u32,
    in_w: u32,
    c0: u32,
    h0: u32,
    w0: u32,
    ec: u32,
    eh: u32,
    ew: u32,
}

pub struct Slice {
    pipeline: Rc<Pipeline>,
}

impl Slice {
    pub fn new(device: &Arc<Device>) -> Result<Slice, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::SLICE),
            &[],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 8,
                local_x: LOCAL_X,
                local_y: LOCAL_Y,
                local_z: 1,
            },
        )?;
        Ok(Slice { pipeline: Rc::new(pipeline) })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
        c0: usize,
        h0: usize,
        w0: usize,
        ec: usize,
        eh: usize,
        ew: usize,
    ) -> Result<Tensor, EngineError> {
        let (in_c, in_h, in_w) = input.shape();
        if c0 + ec > in_c || h0 + eh > in_h || w0 + ew > in_w {
            return Err(ShapeError::InvalidShape {
                op: "slice",
                shape: input.shape(),
                reason: format!(
                    "requested [{c0}:{}, {h0}:{}, {w0}:{}] out of bounds",
                    c0 + ec,
                    h0 + eh,
                    w0 + ew
                ),
            }
            .into());
        }

        let output = Tensor::new(
            device,
            (ec, eh, ew),
            input.dtype(),
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        self.pipeline
            .set_group(super::group_count(ew, LOCAL_X), super::group_count(eh, LOCAL_Y), ec as u32)?;
        let push = Push {
            in_h: in_h as u32,
            in_w: in_w as u32,
            c0: c0 as u32,
            h0: h0 as u32,
            w0: w0 as u32,
            ec: ec as u32,
            eh: eh as u32,
            ew: ew as u32,
        };
        command.record_pipeline(&self.pipeline, &[input, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}
