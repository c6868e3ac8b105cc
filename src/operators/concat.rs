//! Concatenation along channel, height or width: one dispatch per input,
//! each writing its own elements into the pre-allocated output's offset.
//!
//! Grounded on `examples/original_source/src/ops/concat.cpp`.

use std::rc::Rc;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::command::CommandEncoder;
use crate::device::Device;
use crate::error::{EngineError, ShapeError};
use crate::pipeline::{Constant, Pipeline, ShaderInfo};
use crate::shaders;
use crate::tensor::Tensor;

const LOCAL_X: u32 = 32;
const LOCAL_Y: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Channel,
    Height,
    Width,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Push {
    in_c: u32,
    in_h: u32,
    in_w: u32,
    out_h: u32,
    out_w: u32,
    offset: u32,
}

pub struct Concat {
    axis: Axis,
    pipeline: Rc<Pipeline>,
}

impl Concat {
    pub fn new(device: &Arc<Device>, axis: Axis) -> Result<Concat, EngineError> {
        let id = match axis {
            Axis::Channel => 0,
            Axis::Height => 1,
            Axis::Width => 2,
        };
        let pipeline = Pipeline::new(
            device,
            shaders::code(shaders::CONCAT),
            &[Constant::I32(id)],
            ShaderInfo {
                binding_count: 2,
                push_constant_count: 6,
                local_x: LOCAL_X,
                local_y: LOCAL_Y,
                local_z: 1,
            },
        )?;
        Ok(Concat { axis, pipeline: Rc::new(pipeline) })
    }

    pub fn call(
        &self,
        command: &mut CommandEncoder,
        device: &Arc<Device>,
        inputs: &[&Tensor],
    ) -> Result<Tensor, EngineError> {
        if inputs.is_empty() {
            return Err(ShapeError::InvalidShape {
                op: "concat",
                shape: (0, 0, 0),
                reason: "concat requires at least one input".into(),
            }
            .into());
        }
        let (c0, h0, w0) = inputs[0].shape();
        let mut out_c = c0;
        let mut out_h = h0;
        let mut out_w = w0;
        for t in &inputs[1..] {
            let (c, h, w) = t.shape();
            match self.axis {
                Axis::Channel => {
                    if h != h0 || w != w0 {
                        return Err(ShapeError::InvalidShape {
                            op: "concat",
                            shape: t.shape(),
                            reason: "non-concat axes must match".into(),
                        }
                        .into());
                    }
                    out_c += c;
                }
                Axis::Height => {
                    if c != c0 || w != w0 {
                        return Err(ShapeError::InvalidShape {
                            op: "concat",
                            shape: t.shape(),
                            reason: "non-concat axes must match".into(),
                        }
                        .into());
                    }
                    out_h += h;
                }
                Axis::Width => {
                    if c != c0 || h != h0 {
                        return Err(ShapeError::InvalidShape {
                            op: "concat",
                            shape: t.shape(),
                            reason: "non-concat axes must match".into(),
                        }
                        .into());
                    }
                    out_w += w;
                }
            }
        }

        let output = Tensor::new(
            device,
            (out_c, out_h, out_w),
            inputs[0].dtype(),
            ash::vk::BufferUsageFlags::empty(),
            false,
        )?;

        let mut offset = 0u32;
        for t in inputs {
            let (in_c, in_h, in_w) = t.shape();
            self.pipeline
                .set_group(super::group_count(in_w, LOCAL_X), super::group_count(in_h, LOCAL_Y), in_c as u32)?;
            let push = Push {
                in_c: in_c as u32,
                in_h: in_h as u32,
                in_w: in_w as u32,
                out_h: out_h as u32,
                out_w: out_w as u32,
                offset,
            };
            command.record_pipeline(&self.pipeline, &[t, &output], bytemuck::bytes_of(&push));
            offset += match self.axis {
                Axis::Channel => in_c as u32,
                Axis::Height => in_h as u32,
                Axis::Width => in_w as u32,
            };
        }

        Ok(output)
    }
}
