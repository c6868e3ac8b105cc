//! Two-stage row-wise reduction (sum / max / min / mean), and the masked
//! variant [`Reduce::call_masked`] that [`super::softmax::Softmax`] uses
//! internally to compute a causal row-max bias.
//!
//! Grounded on `examples/original_source/src/ops/reduce.h`: a partial
//! pass over row chunks followed by a per-row final combine, with `op_type`
//! selecting the monoid. Masking is this port's own generalization (see
//! `DESIGN.md`) so [`super::softmax::Softmax`] can reuse the same shaders
//! instead of duplicating the reduction tree.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::{CommandEncoder, DeferredTask};
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Constant, Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::{DType, Tensor};

const CHUNK_SIZE: usize = 256;
const LOCAL_SIZE: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    Mean,
}

impl ReduceOp {
    fn id(self) -> i32 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Max => 1,
            ReduceOp::Min => 2,
            ReduceOp::Mean => 3,
        }
    }
}

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
struct FinalPush {
    row_size: u32,
    num_chunks: u32,
}

pub struct Reduce {
    op: ReduceOp,
    partial: Rc<Pipeline>,
    final_stage: Rc<Pipeline>,
}

impl Reduce {
    pub fn new(device: &Arc<Device>, op: ReduceOp, masked: bool) -> Result<Reduce, EngineError> {
        let partial_info = ShaderInfo {
            binding_count: 2,
            push_constant_count: 4,
            local_x: LOCAL_SIZE,
            local_y: 1,
            local_z: 1,
        };
        let partial = Pipeline::new(
            device,
            shaders::code(shaders::REDUCE_PARTIAL),
            &[Constant::I32(op.id()), Constant::I32(masked as i32)],
            partial_info,
        )?;

        let final_info = ShaderInfo {
            binding_count: 2,
            push_constant_count: 2,
            local_x: LOCAL_SIZE,
            local_y: 1,
            local_z: 1,
        };
        let final_stage = Pipeline::new(
            device,
            shaders::code(shaders::REDUCE_FINAL),
            &[Constant::I32(op.id())],
            final_info,
        )?;

        Ok(Reduce {
            op,
            partial: Rc::new(partial),
            final_stage: Rc::new(final_stage),
        })
    }

    pub fn op(&self) -> ReduceOp {
        self.op
    }

    /// Reduces along the last axis: `(c, h, w) -> (c, h, 1)`.
    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
    ) -> Result<Tensor, EngineError> {
        self.call_masked(command, device, input, 0)
    }

    /// Same as [`Reduce::call`], but when this `Reduce` was constructed with
    /// `masked = true`, only columns `<= offset + row` (row taken within its
    /// own `h` slice) participate.
    pub fn call_masked(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
        offset: usize,
    ) -> Result<Tensor, EngineError> {
        if input.dtype() != DType::Fp32 {
            return Err(ShapeError::DTypeMismatch {
                op: "reduce",
                expected: DType::Fp32,
                actual: input.dtype(),
            }
            .into());
        }

        let (c, h, w) = input.shape();
        let rows = c * h;
        let row_size = w;
        let num_chunks = row_size.div_ceil(CHUNK_SIZE).max(1);

        let partials = Tensor::new(
            device,
            (1, rows, num_chunks),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        self.partial.set_group(num_chunks as u32, rows as u32, 1)?;
        let partial_push = PartialPush {
            row_size: row_size as u32,
            chunk_size: CHUNK_SIZE as u32,
            num_chunks: num_chunks as u32,
            offset: offset as u32,
        };
        command.record_pipeline(&self.partial, &[input, &partials], bytemuck::bytes_of(&partial_push));

        let output = Tensor::new(
            device,
            (1, rows, 1),
            DType::Fp32,
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        self.final_stage.set_group(rows as u32, 1, 1)?;
        let final_push = FinalPush {
            row_size: row_size as u32,
            num_chunks: num_chunks as u32,
        };
        command.record_pipeline(&self.final_stage, &[&partials, &output], bytemuck::bytes_of(&final_push));
        command.defer(DeferredTask::ReleaseStaging(partials));

        output.reshape((c, h, 1))?;
        Ok(output)
    }
}
