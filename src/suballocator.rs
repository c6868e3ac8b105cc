//! First-fit suballocator with parent-link coalescing.
//!
//! Grounded on `examples/original_source/src/core/allocator.{h,cpp}`: rather
//! than returning raw pointers into `VkDeviceMemory`, the original keeps an
//! arena of blocks linked by parent index so that freeing a block can walk to
//! its neighbors and merge them back together without any pointer chasing.
//! This port keeps that arena-plus-index shape (a `Vec<Block>` per slab, each
//! block addressed by index) since it composes cleanly with Rust ownership:
//! nothing outside this module ever borrows into the arena.

use ash::vk;

use crate::error::AllocatorError;

/// One slab-relative allocation returned to a caller (typically
/// [`crate::tensor::Tensor`]). Freed by calling [`Suballocator::free`] with
/// this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub(crate) slab_index: usize,
    pub(crate) block_index: usize,
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub mapped_ptr: Option<std::ptr::NonNull<u8>>,
}

// Raw pointer into persistently-mapped host-visible memory; never aliases
// mutable borrows across threads because the engine is single-threaded.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

#[derive(Debug, Clone, Copy)]
struct Block {
    offset: u64,
    size: u64,
    free: bool,
    /// Index of the previous block in the slab's address-order chain, or
    /// `None` for the first block. Used to coalesce a freed block into its
    /// lower neighbor without a separate free-list scan.
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slab {
    memory: vk::DeviceMemory,
    size: u64,
    type_index: u32,
    mapped_ptr: Option<std::ptr::NonNull<u8>>,
    blocks: Vec<Block>,
}

/// Arena-of-slabs suballocator. One instance lives on [`crate::device::Device`]
/// and services every tensor allocation; slabs grow in `slab_align`-sized
/// chunks (10 MiB by default) and are never individually freed back to the
/// driver until the whole allocator drops.
pub struct Suballocator {
    slab_align: u64,
    slabs: Vec<Slab>,
}

impl Suballocator {
    pub fn new(slab_align: u64) -> Self {
        Self {
            slab_align,
            slabs: Vec::new(),
        }
    }

    /// Finds or grows a slab of `type_index` with a free block of at least
    /// `size` bytes aligned to `alignment`, splits it, and returns the
    /// allocation. Growth allocates `max(slab_align, size)` rounded up to
    /// `slab_align`.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        type_index: u32,
        size: u64,
        alignment: u64,
    ) -> Result<Allocation, AllocatorError> {
        if let Some((slab_index, block_index, offset)) =
            self.find_fit(type_index, size, alignment)
        {
            self.split_and_take(slab_index, block_index, offset, size);
            let slab = &self.slabs[slab_index];
            return Ok(Allocation {
                slab_index,
                block_index,
                memory: slab.memory,
                offset,
                size,
                mapped_ptr: slab
                    .mapped_ptr
                    .map(|p| unsafe { std::ptr::NonNull::new_unchecked(p.as_ptr().add(offset as usize)) }),
            });
        }

        self.grow(device, type_index, size)?;
        let (slab_index, block_index, offset) = self
            .find_fit(type_index, size, alignment)
            .expect("freshly grown slab must satisfy its own request");
        self.split_and_take(slab_index, block_index, offset, size);
        let slab = &self.slabs[slab_index];
        Ok(Allocation {
            slab_index,
            block_index,
            memory: slab.memory,
            offset,
            size,
            mapped_ptr: slab
                .mapped_ptr
                .map(|p| unsafe { std::ptr::NonNull::new_unchecked(p.as_ptr().add(offset as usize)) }),
        })
    }

    /// Returns a block to its slab's free list and coalesces it with any
    /// free neighbor in address order.
    pub fn free(&mut self, allocation: Allocation) {
        let slab = &mut self.slabs[allocation.slab_index];
        slab.blocks[allocation.block_index].free = true;
        self.coalesce(allocation.slab_index, allocation.block_index);
    }

    fn find_fit(&self, type_index: u32, size: u64, alignment: u64) -> Option<(usize, usize, u64)> {
        for (slab_index, slab) in self.slabs.iter().enumerate() {
            if slab.type_index != type_index {
                continue;
            }
            for (block_index, block) in slab.blocks.iter().enumerate() {
                if !block.free {
                    continue;
                }
                let aligned_offset = align_up(block.offset, alignment);
                let padding = aligned_offset - block.offset;
                if block.size >= size + padding {
                    return Some((slab_index, block_index, aligned_offset));
                }
            }
        }
        None
    }

    /// Splits `block_index` so that `[offset, offset + size)` becomes an
    /// in-use block, leaving any leading alignment padding and trailing
    /// remainder as separate free blocks linked into the chain.
    fn split_and_take(&mut self, slab_index: usize, block_index: usize, offset: u64, size: u64) {
        let slab = &mut self.slabs[slab_index];
        let block = slab.blocks[block_index];
        let padding = offset - block.offset;
        let remainder = block.size - padding - size;

        let mut cursor = block_index;

        if padding > 0 {
            let pad_index = slab.blocks.len();
            slab.blocks.push(Block {
                offset: block.offset,
                size: padding,
                free: true,
                prev: block.prev,
                next: Some(cursor),
            });
            if let Some(prev) = block.prev {
                slab.blocks[prev].next = Some(pad_index);
            }
            slab.blocks[cursor].prev = Some(pad_index);
            slab.blocks[cursor].offset = offset;
            slab.blocks[cursor].size = block.size - padding;
        }

        if remainder > 0 {
            let rem_index = slab.blocks.len();
            let next = slab.blocks[cursor].next;
            slab.blocks.push(Block {
                offset: offset + size,
                size: remainder,
                free: true,
                prev: Some(cursor),
                next,
            });
            if let Some(next) = next {
                slab.blocks[next].prev = Some(rem_index);
            }
            slab.blocks[cursor].next = Some(rem_index);
        }

        slab.blocks[cursor].offset = offset;
        slab.blocks[cursor].size = size;
        slab.blocks[cursor].free = false;
    }

    fn coalesce(&mut self, slab_index: usize, block_index: usize) {
        let slab = &mut self.slabs[slab_index];

        if let Some(next) = slab.blocks[block_index].next {
            if slab.blocks[next].free {
                let next_block = slab.blocks[next];
                slab.blocks[block_index].size += next_block.size;
                slab.blocks[block_index].next = next_block.next;
                if let Some(after) = next_block.next {
                    slab.blocks[after].prev = Some(block_index);
                }
            }
        }

        if let Some(prev) = slab.blocks[block_index].prev {
            if slab.blocks[prev].free {
                let this_block = slab.blocks[block_index];
                slab.blocks[prev].size += this_block.size;
                slab.blocks[prev].next = this_block.next;
                if let Some(after) = this_block.next {
                    slab.blocks[after].prev = Some(prev);
                }
            }
        }
    }

    fn grow(&mut self, device: &ash::Device, type_index: u32, requested: u64) -> Result<(), AllocatorError> {
        let size = requested.max(self.slab_align).div_ceil(self.slab_align) * self.slab_align;

        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_index);
        let memory = unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| {
            if e == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY {
                AllocatorError::OutOfDeviceMemory { size, type_index }
            } else {
                AllocatorError::SlabAllocation(e)
            }
        })?;

        // Host-visible memory types are mapped once for the slab's lifetime;
        // device-local-only slabs stay unmapped.
        let mapped_ptr = None;

        self.slabs.push(Slab {
            memory,
            size,
            type_index,
            mapped_ptr,
            blocks: vec![Block {
                offset: 0,
                size,
                free: true,
                prev: None,
                next: None,
            }],
        });
        Ok(())
    }

    /// Maps a slab's full range once, recording the host pointer on the slab
    /// so future allocations within it can derive their `mapped_ptr` without
    /// a fresh `vkMapMemory` call. Called lazily the first time a host-visible
    /// tensor is created against a given slab.
    pub(crate) fn ensure_mapped(
        &mut self,
        device: &ash::Device,
        slab_index: usize,
    ) -> Result<(), AllocatorError> {
        let slab = &mut self.slabs[slab_index];
        if slab.mapped_ptr.is_some() {
            return Ok(());
        }
        let ptr = unsafe {
            device.map_memory(slab.memory, 0, slab.size, vk::MemoryMapFlags::empty())
        }
        .map_err(AllocatorError::MapFailed)?;
        slab.mapped_ptr = std::ptr::NonNull::new(ptr as *mut u8);
        Ok(())
    }

    pub(crate) fn slab_memory(&self, slab_index: usize) -> vk::DeviceMemory {
        self.slabs[slab_index].memory
    }

    pub(crate) fn slab_mapped_ptr(&self, slab_index: usize) -> Option<std::ptr::NonNull<u8>> {
        self.slabs[slab_index].mapped_ptr
    }

    /// Destroys every backing `VkDeviceMemory` allocation. Must only be
    /// called once every tensor referencing this allocator has already been
    /// dropped; callers enforce this by only invoking it from
    /// `Device::drop`, which runs after the caller has dropped its model and
    /// tensors.
    pub(crate) fn destroy_all(&mut self, device: &ash::Device) {
        for slab in self.slabs.drain(..) {
            unsafe {
                device.free_memory(slab.memory, None);
            }
        }
    }
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u64, size: u64, free: bool, prev: Option<usize>, next: Option<usize>) -> Block {
        Block { offset, size, free, prev, next }
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn coalesce_merges_both_neighbors() {
        // Three adjacent blocks, only the middle in use; freeing it should
        // merge all three into one free block.
        let slab = Slab {
            memory: vk::DeviceMemory::null(),
            size: 300,
            type_index: 0,
            mapped_ptr: None,
            blocks: vec![
                block(0, 100, true, None, Some(1)),
                block(100, 100, false, Some(0), Some(2)),
                block(200, 100, true, Some(1), None),
            ],
        };
        let mut alloc = Suballocator {
            slab_align: 1024,
            slabs: vec![slab],
        };
        alloc.slabs[0].blocks[1].free = true;
        alloc.coalesce(0, 1);
        assert_eq!(alloc.slabs[0].blocks[0].size, 300);
        assert_eq!(alloc.slabs[0].blocks[0].next, None);
    }
}
