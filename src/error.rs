//! Layered error types.
//!
//! Each subsystem owns a narrow error enum; [`EngineError`] composes them so
//! callers at the public boundary get one `match`-able type while still being
//! able to walk the `source()` chain down to the `ash::vk::Result` or detail
//! that actually failed.

use thiserror::Error;

/// Errors raised while creating the instance, selecting a physical device, or
/// creating the logical device. Always fatal: the engine cannot proceed.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to load the Vulkan loader/entry point")]
    Loader(#[source] ash::LoadingError),

    #[error("vkCreateInstance failed")]
    InstanceCreation(#[source] ash::vk::Result),

    #[error("requested physical device index {requested} but only {available} device(s) were enumerated")]
    DeviceIndexOutOfRange { requested: usize, available: usize },

    #[error("vkCreateDevice failed")]
    LogicalDeviceCreation(#[source] ash::vk::Result),

    #[error("no memory type satisfies mask {type_mask:#x} with property flags {flags:?}")]
    NoSuitableMemoryType {
        type_mask: u32,
        flags: ash::vk::MemoryPropertyFlags,
    },

    #[error("no queue family satisfies flags {0:?}")]
    NoSuitableQueueFamily(ash::vk::QueueFlags),

    #[error("vulkan call failed")]
    Vulkan(#[from] ash::vk::Result),
}

/// Errors raised by the suballocator.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("out of device memory servicing a {size} byte request (type index {type_index})")]
    OutOfDeviceMemory { size: u64, type_index: u32 },

    #[error("vkAllocateMemory failed while growing the pool")]
    SlabAllocation(#[source] ash::vk::Result),

    #[error("vkMapMemory failed for a host-visible slab")]
    MapFailed(#[source] ash::vk::Result),

    #[error("no memory type satisfies the request")]
    NoSuitableMemoryType(#[from] Box<DeviceError>),
}

/// Errors raised creating or operating on a [`crate::tensor::Tensor`].
#[derive(Debug, Error)]
pub enum TensorError {
    #[error("failed to create the backing buffer")]
    BufferCreation(#[source] ash::vk::Result),

    #[error("failed to allocate backing memory for tensor")]
    Allocation(#[from] AllocatorError),

    #[error("flush/invalidate requested on a non-host-visible tensor")]
    NotHostVisible,

    #[error("reshape from {old:?} to {new:?} changes element count")]
    ReshapeElementCountMismatch {
        old: (usize, usize, usize),
        new: (usize, usize, usize),
    },

    #[error("vkFlushMappedMemoryRanges/vkInvalidateMappedMemoryRanges failed")]
    MappedRangeOp(#[source] ash::vk::Result),
}

/// Shape or dtype mismatches surfaced by an individual operator call.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("{op}: contracting dimension mismatch, lhs={lhs:?} rhs={rhs:?}")]
    ContractingDimMismatch {
        op: &'static str,
        lhs: (usize, usize, usize),
        rhs: (usize, usize, usize),
    },

    #[error("{op}: expected dtype {expected:?}, got {actual:?}")]
    DTypeMismatch {
        op: &'static str,
        expected: crate::tensor::DType,
        actual: crate::tensor::DType,
    },

    #[error("{op}: shape {shape:?} invalid: {reason}")]
    InvalidShape {
        op: &'static str,
        shape: (usize, usize, usize),
        reason: String,
    },

    #[error("rope: key_offset = offset ({offset}) + query.height ({q_height}) - key.height ({k_height}) is negative")]
    NegativeRopeOffset {
        offset: usize,
        q_height: usize,
        k_height: usize,
    },

    #[error("pipeline workgroup size {local:?} exceeds device limit {limit:?} (product {product} > max {max_invocations})")]
    WorkgroupTooLarge {
        local: [u32; 3],
        limit: [u32; 3],
        product: u64,
        max_invocations: u32,
    },
}

/// Container (metadata/tensor catalog) validation errors. Fatal at model init.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("missing required metadata key `{0}`")]
    MissingMetadataKey(String),

    #[error("missing required tensor `{0}`")]
    MissingTensor(String),

    #[error("tensor `{name}` declares {declared} bytes but {actual} bytes were supplied")]
    SizeMismatch {
        name: String,
        declared: usize,
        actual: usize,
    },

    #[error("tensor `{name}` has unsupported element type {element_type}")]
    UnsupportedElementType { name: String, element_type: String },

    #[error("token_embd.weight width {d_model} is not divisible by llama.attention.head_count {head_count}")]
    InvalidHeadCount { d_model: usize, head_count: usize },
}

/// Fence / queue submission errors. Always fatal: once a wait times out,
/// whatever the command was going to produce must be treated as lost.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fence wait timed out after {timeout_secs}s")]
    FenceTimeout { timeout_secs: u64 },

    #[error("vkQueueSubmit failed")]
    Submit(#[source] ash::vk::Result),

    #[error("a deferred task failed: {0}")]
    DeferredTaskFailed(String),
}

/// Top-level error type returned from the public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("vulkan call failed")]
    Vulkan(#[from] ash::vk::Result),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
