//! Token embedding gather: `out[h, w, :] = table[indices[h, w], :]`.
//!
//! Grounded on `examples/original_source/src/ops/embedding.cpp`.

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
    h: u32,
    w: u32,
    dim: u32,
}

pub struct Embedding {
    pipeline: Rc<Pipeline>,
}

impl Embedding {
    pub fn new(device: &Arc<Device>) -> Result<Embedding, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::EMBEDDING),
            &[],
            ShaderInfo {
                binding_count: 3,
                push_constant_count: 3,
                local_x: LOCAL_X,
                local_y: LOCAL_Y,
                local_z: 1,
            },
        )?;
        Ok(Embedding { pipeline: Rc::new(pipeline) })
    }

    /// `indices` is `(1, h, w)` uint32, `table` is `(1, vocab, dim)` fp32.
    /// Returns `(h, w, dim)` fp32.
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        indices: &Tensor,
        table: &Tensor,
    ) -> Result<Tensor, EngineError> {
        if indices.dtype() != DType::Uint32 {
            return Err(ShapeError::DTypeMismatch {
                op: "embedding",
                expected: DType::Uint32,
                actual: indices.dtype(),
            }
            .into());
        }
        if table.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "embedding",
                expected: DType::Fp32,
                actual: table.dtype(),
            }
            .into());
        }
        let (_, h, w) = indices.shape();
        let (_, _, dim) = table.shape();

        let output = Tensor::new(
            device,
            (h, w, dim),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        self.pipeline.set_group(
            super::group_count(dim, LOCAL_X),
            super::group_count(w, LOCAL_Y),
            h as u32,
        )?;
        let push = Push { h: h as u32, w: w as u32, dim: dim as u32 };
        command.record_pipeline(&self.pipeline, &[indices, table, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}
