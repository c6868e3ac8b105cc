//! Tensor: a rank-3 (channels, height, width) GPU buffer view with a shared
//! producer/consumer status cell used by the command encoder's barrier
//! emission algorithm.
//!
//! Grounded on `examples/original_source/src/core/tensor.{h,cpp}`: the
//! original stores `access_` and `stage_` directly on the tensor and mutates
//! them as operators run, so that the next operator to touch the tensor knows
//! what barrier to emit. This port keeps that single-cell design (rather than
//! a list of outstanding accesses) since the engine never fans a tensor out
//! to more than one in-flight consumer at a time; [`Device`] owns the only
//! queue so this cell never needs cross-thread synchronization.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::error::TensorError;
use crate::suballocator::Allocation;

/// Element type carried by a tensor's backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Fp32,
    Fp16,
    Uint32,
    Int8,
    /// Block-quantized: 34 bytes per 32 elements. [`DType::elem_size`] is
    /// meaningless for this variant; use [`crate::float::q8_0_block_count`]
    /// and [`crate::float::Q8_0_BLOCK_BYTES`] instead.
    Q8_0,
}

impl DType {
    /// Byte size of a single element. Panics for [`DType::Q8_0`], which is
    /// only ever sized in whole blocks.
    pub fn elem_size(self) -> usize {
        match self {
            DType::Fp32 => 4,
            DType::Fp16 => 2,
            DType::Uint32 => 4,
            DType::Int8 => 1,
            DType::Q8_0 => panic!("Q8_0 has no fixed per-element size; use block helpers"),
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DType::Q8_0)
    }
}

/// Last-known GPU access state of a tensor's buffer, used to compute the
/// pipeline barrier a consumer must insert before reading or writing it.
#[derive(Debug, Clone, Copy)]
pub struct TensorStatus {
    pub access: vk::AccessFlags,
    pub stage: vk::PipelineStageFlags,
}

impl Default for TensorStatus {
    fn default() -> Self {
        Self {
            access: vk::AccessFlags::empty(),
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        }
    }
}

pub(crate) struct TensorInner {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Allocation,
    shape: Cell<(usize, usize, usize)>,
    dtype: DType,
    host_visible: bool,
    status: Rc<Cell<TensorStatus>>,
}

/// A GPU-resident tensor. Cloning a `Tensor` is cheap and shares the same
/// backing buffer, allocation and status cell as the original — it is a view,
/// not a copy. The last clone to drop frees the buffer and returns the
/// allocation to the device's suballocator.
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

impl Tensor {
    /// Creates a new tensor with its own freshly allocated buffer.
    ///
    /// `usage` is additive to `STORAGE_BUFFER`, which every tensor carries so
    /// it can be bound as a shader resource; callers add `TRANSFER_SRC`/
    /// `TRANSFER_DST` for staging tensors.
    pub fn new(
        device: &Arc<Device>,
        shape: (usize, usize, usize),
        dtype: DType,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<Tensor, TensorError> {
        let elements = shape.0 * shape.1 * shape.2;
        let size = tight_bytes(elements, dtype).max(1);

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage | vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.raw().create_buffer(&buffer_info, None) }
            .map_err(TensorError::BufferCreation)?;

        let requirements = unsafe { device.raw().get_buffer_memory_requirements(buffer) };
        let memory_flags = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let type_index = device
            .find_memory_type(requirements.memory_type_bits, memory_flags)
            .map_err(|e| TensorError::Allocation(crate::error::AllocatorError::NoSuitableMemoryType(Box::new(e))))?;

        let allocation = {
            let mut allocator = device.suballocator().lock();
            let mut allocation = allocator.allocate(
                device.raw(),
                type_index,
                requirements.size,
                requirements.alignment,
            )?;
            if host_visible {
                allocator.ensure_mapped(device.raw(), allocation.slab_index)?;
                allocation.mapped_ptr = allocator
                    .slab_mapped_ptr(allocation.slab_index)
                    .map(|p| unsafe { std::ptr::NonNull::new_unchecked(p.as_ptr().add(allocation.offset as usize)) });
            }
            allocation
        };

        unsafe {
            device
                .raw()
                .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
                .map_err(TensorError::BufferCreation)?;
        }

        Ok(Tensor {
            inner: Rc::new(TensorInner {
                device: device.clone(),
                buffer,
                allocation,
                shape: Cell::new(shape),
                dtype,
                host_visible,
                status: Rc::new(Cell::new(TensorStatus::default())),
            }),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.inner.buffer
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.inner.shape.get()
    }

    pub fn channels(&self) -> usize {
        self.shape().0
    }

    pub fn height(&self) -> usize {
        self.shape().1
    }

    pub fn width(&self) -> usize {
        self.shape().2
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn elements(&self) -> usize {
        let (c, h, w) = self.shape();
        c * h * w
    }

    /// Total backing byte size: `ceil(elems·elem_size / A)·A`, where `A` is
    /// the device's non-coherent atom size (quantized tensors use whole
    /// Q8_0 blocks in place of `elem_size`).
    pub fn bytes(&self) -> u64 {
        let tight = tight_bytes(self.elements(), self.inner.dtype).max(1);
        let atom = self.inner.device.non_coherent_atom_size().max(1);
        align_up(tight, atom)
    }

    pub fn is_host_visible(&self) -> bool {
        self.inner.host_visible
    }

    pub fn status(&self) -> TensorStatus {
        self.inner.status.get()
    }

    pub(crate) fn set_status(&self, status: TensorStatus) {
        self.inner.status.set(status);
    }

    /// Two tensors are the same underlying view iff they share a status cell.
    pub fn is_same_view(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner.status, &other.inner.status)
    }

    /// Reinterprets the tensor's shape without touching its buffer. The new
    /// shape must have the same element count as the old one.
    pub fn reshape(&self, new_shape: (usize, usize, usize)) -> Result<(), TensorError> {
        let old_shape = self.shape();
        let old_count = old_shape.0 * old_shape.1 * old_shape.2;
        let new_count = new_shape.0 * new_shape.1 * new_shape.2;
        if old_count != new_count {
            return Err(TensorError::ReshapeElementCountMismatch {
                old: old_shape,
                new: new_shape,
            });
        }
        self.inner.shape.set(new_shape);
        Ok(())
    }

    /// Raw host pointer to the start of this tensor's region, for
    /// host-visible tensors only.
    pub fn mapped_ptr(&self) -> Result<*mut u8, TensorError> {
        self.inner
            .allocation
            .mapped_ptr
            .map(|p| p.as_ptr())
            .ok_or(TensorError::NotHostVisible)
    }

    /// Copies `src` into the tensor's mapped host memory. `src.len()` must not
    /// exceed [`Tensor::bytes`].
    pub fn write_bytes(&self, src: &[u8]) -> Result<(), TensorError> {
        let ptr = self.mapped_ptr()?;
        debug_assert!(src.len() as u64 <= self.bytes());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, src.len());
        }
        Ok(())
    }

    /// Copies the tensor's mapped host memory into `dst`. `dst.len()` must not
    /// exceed [`Tensor::bytes`].
    pub fn read_bytes(&self, dst: &mut [u8]) -> Result<(), TensorError> {
        let ptr = self.mapped_ptr()?;
        debug_assert!(dst.len() as u64 <= self.bytes());
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Flushes host writes so the device can observe them. Required before
    /// submitting a command that reads a host-visible, non-coherent tensor;
    /// a no-op is not safe to assume since `HOST_COHERENT` is not guaranteed
    /// on every platform this engine might run on in the future, so the call
    /// is always issued for host-visible tensors.
    pub fn flush(&self) -> Result<(), TensorError> {
        if !self.inner.host_visible {
            return Err(TensorError::NotHostVisible);
        }
        let atom = self.inner.device.non_coherent_atom_size().max(1);
        let size = align_up(self.bytes(), atom);
        let range = vk::MappedMemoryRange::builder()
            .memory(self.inner.allocation.memory)
            .offset(self.inner.allocation.offset)
            .size(size);
        unsafe {
            self.inner
                .device
                .raw()
                .flush_mapped_memory_ranges(&[*range])
        }
        .map_err(TensorError::MappedRangeOp)
    }

    /// Invalidates host caches so a subsequent host read observes a GPU
    /// write. Required after waiting on a fence for a command that wrote a
    /// host-visible tensor.
    pub fn invalidate(&self) -> Result<(), TensorError> {
        if !self.inner.host_visible {
            return Err(TensorError::NotHostVisible);
        }
        let atom = self.inner.device.non_coherent_atom_size().max(1);
        let size = align_up(self.bytes(), atom);
        let range = vk::MappedMemoryRange::builder()
            .memory(self.inner.allocation.memory)
            .offset(self.inner.allocation.offset)
            .size(size);
        unsafe {
            self.inner
                .device
                .raw()
                .invalidate_mapped_memory_ranges(&[*range])
        }
        .map_err(TensorError::MappedRangeOp)
    }
}

impl Drop for TensorInner {
    fn drop(&mut self) {
        unsafe {
            self.device.raw().destroy_buffer(self.buffer, None);
        }
        self.device.suballocator().lock().free(self.allocation);
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("host_visible", &self.is_host_visible())
            .finish()
    }
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

#[inline]
fn tight_bytes(elements: usize, dtype: DType) -> u64 {
    if dtype.is_quantized() {
        (crate::float::q8_0_block_count(elements) * crate::float::Q8_0_BLOCK_BYTES) as u64
    } else {
        (elements * dtype.elem_size()) as u64
    }
}
