//! GPU-accelerated transformer inference engine for LLaMA-family models,
//! built directly on Vulkan compute via `ash` rather than a higher-level
//! graphics/compute abstraction.
//!
//! The crate is organized bottom-up: [`device`] owns the Vulkan instance and
//! logical device, [`suballocator`] carves `vkDeviceMemory` into tensor-sized
//! blocks, [`tensor`] is a rank-3 GPU buffer view, [`pipeline`] compiles one
//! Vulkan compute pipeline per shader/specialization combination, and
//! [`command`] records dispatches with barriers and drives the
//! submit/fence/deferred-task cycle. [`operators`] composes those into the
//! named tensor operations a transformer needs, and [`model`] composes the
//! operators into a full decode step. [`container`] defines the input shapes
//! an external model-file parser is expected to hand [`model::Model::init`];
//! parsing the container format itself, tokenization, sampling and the CLI
//! are out of scope for this crate (see `DESIGN.md`).

pub mod command;
pub mod config;
pub mod container;
pub mod device;
pub mod error;
pub mod float;
pub mod model;
pub mod operators;
pub mod pipeline;
mod shaders;
pub mod suballocator;
pub mod tensor;

pub use config::EngineConfig;
pub use container::{ElementType, Metadata, MetadataValue, TensorCatalog, TensorDescriptor};
pub use device::{Capabilities, Device};
pub use error::{EngineError, Result};
pub use model::Model;
pub use tensor::{DType, Tensor};
