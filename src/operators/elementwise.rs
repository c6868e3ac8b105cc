//! Element-wise binary and scalar arithmetic.
//!
//! Grounded on `examples/original_source/src/ops/elementwise.cpp`.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Constant, Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::Tensor;

const LOCAL_X: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    fn id(self) -> i32 {
        match self {
            BinOp::Add => 0,
            BinOp::Sub => 1,
            BinOp::Mul => 2,
            BinOp::Div => 3,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    count: u32,
}

/// Binary element-wise op over two tensors of identical shape.
pub struct Elementwise {
    pipeline: Rc<Pipeline>,
}

impl Elementwise {
    pub fn new(device: &Arc<Device>, op: BinOp) -> Result<Elementwise, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::ELEMENTWISE),
            &[Constant::I32(op.id())],
            ShaderInfo {
                binding_count: 3,
                push_constant_count: 1,
                local_x: LOCAL_X,
                local_y: 1,
                local_z: 1,
            },
        )?;
        Ok(Elementwise { pipeline: Rc::new(pipeline) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        a: &Tensor,
        b: &Tensor,
    ) -> Result<Tensor, EngineError> {
        if a.shape() != b.shape() {
            return Err(ShapeError::InvalidShape {
                op: "elementwise",
                shape: b.shape(),
                reason: format!("operand shape must match {:?}", a.shape()),
            }
            .into());
        }
        if a.dtype() != b.dtype() {
            return Err(ShapeError::DTypeMismatch {
                op: "elementwise",
                expected: a.dtype(),
                actual: b.dtype(),
            }
            .into());
        }

        let output = Tensor::new(
            device,
            a.shape(),
            a.dtype(),
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        let count = a.elements();
        self.pipeline.set_group(super::group_count(count, LOCAL_X), 1, 1)?;
        let push = Push { count: count as u32 };
        command.record_pipeline(&self.pipeline, &[a, b, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ConstantPush {
    count: u32,
    operand: f32,
}

/// Binary op against a uniform scalar, broadcast over every element.
pub struct ElementwiseConstant {
    pipeline: Rc<Pipeline>,
}

impl ElementwiseConstant {
    pub fn new(device: &Arc<Device>, op: BinOp) -> Result<ElementwiseConstant, EngineError> {
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::ELEMENTWISE_CONSTANT),
            &[Constant::I32(op.id())],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 2,
                local_x: LOCAL_X,
                local_y: 1,
                local_z: 1,
            },
        )?;
        Ok(ElementwiseConstant { pipeline: Rc::new(pipeline) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        input: &Tensor,
        operand: f32,
    ) -> Result<Tensor, EngineError> {
        let output = Tensor::new(
            device,
            input.shape(),
            input.dtype(),
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;
        let count = input.elements();
        self.pipeline.set_group(super::group_count(count, LOCAL_X), 1, 1)?;
        let push = ConstantPush { count: count as u32, operand };
        command.record_pipeline(&self.pipeline, &[input, &output], bytemuck::bytes_of(&push));
        Ok(output)
    }
}
