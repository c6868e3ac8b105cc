//! Command buffer recording, barrier emission, submission and deferred
//! post-fence work.
//!
//! Grounded on `examples/original_source/src/core/command.h`'s `Command`
//! class: one command buffer per `Command`, a single fence, and a queue of
//! host-side work that must run only after that fence has signaled (staging
//! buffer teardown, copying a download out of a staging tensor, reading back
//! a timestamp query). The original models that queue as
//! `std::vector<std::function<VkResult(void)>>`; this port replaces the
//! closures with a tagged [`DeferredTask`] enum, since Rust has no
//! captures-by-shared-reference closure that would let the engine keep
//! borrowing a caller's output slice across the `wait()` call — the enum
//! carries everything the task needs to run explicitly instead.

use ash::vk;

use crate::device::Device;
use crate::error::SyncError;
use crate::pipeline::Pipeline;
use crate::tensor::{Tensor, TensorStatus};

/// Host-side work that must happen only after the command buffer's fence has
/// signaled.
pub(crate) enum DeferredTask {
    /// Keeps a staging tensor alive until the transfer it backed has
    /// completed; dropped (freeing its buffer) once the task runs.
    ReleaseStaging(Tensor),
    /// Invalidates `staging`'s host cache, then copies `len` bytes out of it
    /// into `dst`. `dst` must remain valid until [`CommandEncoder::wait`]
    /// runs, which callers guarantee by calling `wait`/`submit_and_wait`
    /// before `dst` goes out of scope.
    CopyOut {
        staging: Tensor,
        dst: std::ptr::NonNull<u8>,
        len: usize,
    },
    /// Reads back `pipeline`'s timestamp query pair and logs the elapsed
    /// device time for the dispatch just recorded.
    QueryTimestamp { pipeline: std::rc::Rc<Pipeline> },
}

/// Records one primary command buffer's worth of work: uploads, downloads,
/// and pipeline dispatches with barriers, submits it, and runs any deferred
/// host-side work after the fence signals.
pub struct CommandEncoder {
    device: std::sync::Arc<Device>,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    deferred: Vec<DeferredTask>,
}

impl CommandEncoder {
    pub fn new(device: &std::sync::Arc<Device>) -> Result<CommandEncoder, SyncError> {
        let queue_family = device
            .require_queue(vk::QueueFlags::TRANSFER | vk::QueueFlags::COMPUTE)
            .map_err(|_| SyncError::DeferredTaskFailed("no transfer+compute queue family".into()))?;
        let queue = unsafe { device.raw().get_device_queue(queue_family, 0) };

        let fence_info = vk::FenceCreateInfo::builder();
        let fence = unsafe { device.raw().create_fence(&fence_info, None) }
            .map_err(|_| SyncError::DeferredTaskFailed("vkCreateFence failed".into()))?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = unsafe { device.raw().create_command_pool(&pool_info, None) }
            .map_err(|_| SyncError::DeferredTaskFailed("vkCreateCommandPool failed".into()))?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.raw().allocate_command_buffers(&alloc_info) }
            .map_err(|_| SyncError::DeferredTaskFailed("vkAllocateCommandBuffers failed".into()))?[0];

        Ok(CommandEncoder {
            device: device.clone(),
            queue,
            command_pool,
            command_buffer,
            fence,
            deferred: Vec::new(),
        })
    }

    pub fn begin(&self) -> Result<(), SyncError> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .raw()
                .begin_command_buffer(self.command_buffer, &begin_info)
        }
        .map_err(|_| SyncError::DeferredTaskFailed("vkBeginCommandBuffer failed".into()))
    }

    pub fn end(&self) -> Result<(), SyncError> {
        unsafe { self.device.raw().end_command_buffer(self.command_buffer) }
            .map_err(|_| SyncError::DeferredTaskFailed("vkEndCommandBuffer failed".into()))
    }

    pub fn submit(&self) -> Result<(), SyncError> {
        let buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers);
        unsafe {
            self.device
                .raw()
                .queue_submit(self.queue, &[*submit_info], self.fence)
        }
        .map_err(SyncError::Submit)
    }

    /// Waits for the fence, resets it, then drains every deferred task in
    /// order. The first task failure is remembered and returned, but every
    /// task still runs so later staging tensors are released.
    pub fn wait(&mut self) -> Result<(), SyncError> {
        let timeout_ns = self.device.fence_timeout_secs() * 1_000_000_000;
        let fences = [self.fence];
        let wait_result = unsafe {
            self.device
                .raw()
                .wait_for_fences(&fences, true, timeout_ns)
        };
        if wait_result == Err(vk::Result::TIMEOUT) {
            return Err(SyncError::FenceTimeout {
                timeout_secs: self.device.fence_timeout_secs(),
            });
        }
        wait_result.map_err(|_| SyncError::DeferredTaskFailed("vkWaitForFences failed".into()))?;
        unsafe {
            self.device
                .raw()
                .reset_fences(&fences)
                .map_err(|_| SyncError::DeferredTaskFailed("vkResetFences failed".into()))?;
        }

        let mut first_error = None;
        for task in self.deferred.drain(..) {
            if let Err(e) = run_deferred(task) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn submit_and_wait(&mut self) -> Result<(), SyncError> {
        self.submit()?;
        self.wait()
    }

    pub(crate) fn defer(&mut self, task: DeferredTask) {
        self.deferred.push(task);
    }

    /// Copies `bytes` into `dst`. If `dst` is host-visible, writes directly
    /// and marks it with a host-write access/stage; otherwise allocates a
    /// host-visible staging tensor, writes into it, and records a
    /// transfer-copy into `dst` with the appropriate barriers.
    pub fn upload(&mut self, bytes: &[u8], dst: &Tensor) -> Result<(), SyncError> {
        if bytes.len() as u64 > dst.bytes() {
            return Err(SyncError::DeferredTaskFailed(format!(
                "upload source is {} bytes but destination tensor only has {}",
                bytes.len(),
                dst.bytes()
            )));
        }

        if dst.is_host_visible() {
            dst.write_bytes(bytes)
                .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;
            dst.flush()
                .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;
            dst.set_status(TensorStatus {
                access: vk::AccessFlags::HOST_WRITE,
                stage: vk::PipelineStageFlags::HOST,
            });
            return Ok(());
        }

        let staging = Tensor::new(
            &self.device,
            dst.shape(),
            dst.dtype(),
            vk::BufferUsageFlags::TRANSFER_SRC,
            true,
        )
        .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;
        staging
            .write_bytes(bytes)
            .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;
        staging
            .flush()
            .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;

        self.emit_buffer_barrier(
            staging.buffer(),
            staging.bytes(),
            vk::AccessFlags::HOST_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::HOST,
            vk::PipelineStageFlags::TRANSFER,
        );

        let region = vk::BufferCopy::builder().size(staging.bytes());
        unsafe {
            self.device.raw().cmd_copy_buffer(
                self.command_buffer,
                staging.buffer(),
                dst.buffer(),
                &[*region],
            );
        }
        dst.set_status(TensorStatus {
            access: vk::AccessFlags::TRANSFER_WRITE,
            stage: vk::PipelineStageFlags::TRANSFER,
        });

        self.deferred.push(DeferredTask::ReleaseStaging(staging));
        Ok(())
    }

    /// Copies `src`'s contents into `dst`, a plain host byte buffer, once the
    /// command buffer's fence signals. If `src` is host-visible the
    /// invalidate + copy is itself deferred (the GPU write may not be
    /// visible to the host until the fence signals); otherwise a staging
    /// tensor is created and the transfer-then-copy is recorded now with the
    /// final host copy deferred.
    pub fn download(&mut self, src: &Tensor, dst: &mut [u8]) -> Result<(), SyncError> {
        if (dst.len() as u64) < src.bytes() {
            return Err(SyncError::DeferredTaskFailed(format!(
                "download destination is {} bytes but source tensor has {}",
                dst.len(),
                src.bytes()
            )));
        }
        let dst_ptr = std::ptr::NonNull::new(dst.as_mut_ptr())
            .expect("caller-provided download destination must not be null");
        let len = src.bytes() as usize;

        if src.is_host_visible() {
            let status = src.status();
            self.emit_buffer_barrier(
                src.buffer(),
                src.bytes(),
                status.access,
                vk::AccessFlags::HOST_READ,
                status.stage,
                vk::PipelineStageFlags::HOST,
            );
            self.deferred.push(DeferredTask::CopyOut {
                staging: src.clone(),
                dst: dst_ptr,
                len,
            });
            return Ok(());
        }

        let staging = Tensor::new(
            &self.device,
            src.shape(),
            src.dtype(),
            vk::BufferUsageFlags::TRANSFER_DST,
            true,
        )
        .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;

        let status = src.status();
        self.emit_buffer_barrier(
            src.buffer(),
            src.bytes(),
            status.access,
            vk::AccessFlags::TRANSFER_READ,
            status.stage,
            vk::PipelineStageFlags::TRANSFER,
        );

        let region = vk::BufferCopy::builder().size(src.bytes());
        unsafe {
            self.device.raw().cmd_copy_buffer(
                self.command_buffer,
                src.buffer(),
                staging.buffer(),
                &[*region],
            );
        }

        self.emit_buffer_barrier(
            staging.buffer(),
            staging.bytes(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::HOST_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
        );

        self.deferred.push(DeferredTask::CopyOut {
            staging,
            dst: dst_ptr,
            len,
        });
        Ok(())
    }

    /// Barrier emission algorithm: every binding transitions from its
    /// tensor's last recorded (access, stage) to shader read|write at the
    /// compute stage, then the pipeline is bound, pushed constants and
    /// descriptor set are attached, and the dispatch is recorded. After
    /// recording, every binding's status is updated to (shader write,
    /// compute) so the next consumer barriers correctly.
    pub fn record_pipeline(
        &mut self,
        pipeline: &std::rc::Rc<Pipeline>,
        bindings: &[&Tensor],
        push_constants: &[u8],
    ) {
        for tensor in bindings {
            let status = tensor.status();
            if status.access.is_empty() {
                continue;
            }
            self.emit_buffer_barrier(
                tensor.buffer(),
                tensor.bytes(),
                status.access,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                status.stage,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            );
        }

        pipeline.update_bindings(bindings);

        unsafe {
            let raw = self.device.raw();
            raw.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.raw(),
            );
            if !push_constants.is_empty() {
                raw.cmd_push_constants(
                    self.command_buffer,
                    pipeline.layout(),
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    push_constants,
                );
            }
            raw.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout(),
                0,
                &[pipeline.descriptor_set()],
                &[],
            );
            if let Some(query_pool) = pipeline.query_pool() {
                raw.cmd_reset_query_pool(self.command_buffer, query_pool, 0, 2);
                raw.cmd_write_timestamp(
                    self.command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    query_pool,
                    0,
                );
            }
            let (x, y, z) = pipeline.group();
            raw.cmd_dispatch(self.command_buffer, x, y, z);
            if let Some(query_pool) = pipeline.query_pool() {
                raw.cmd_write_timestamp(
                    self.command_buffer,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    query_pool,
                    1,
                );
                self.deferred.push(DeferredTask::QueryTimestamp {
                    pipeline: pipeline.clone(),
                });
            }
        }

        for tensor in bindings {
            tensor.set_status(TensorStatus {
                access: vk::AccessFlags::SHADER_WRITE,
                stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            });
        }
    }

    fn emit_buffer_barrier(
        &self,
        buffer: vk::Buffer,
        size: u64,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(size);
        unsafe {
            self.device.raw().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[*barrier],
                &[],
            );
        }
    }
}

fn run_deferred(task: DeferredTask) -> Result<(), SyncError> {
    match task {
        DeferredTask::ReleaseStaging(_tensor) => Ok(()),
        DeferredTask::CopyOut { staging, dst, len } => {
            staging
                .invalidate()
                .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;
            let src_ptr = staging
                .mapped_ptr()
                .map_err(|e| SyncError::DeferredTaskFailed(e.to_string()))?;
            unsafe {
                std::ptr::copy_nonoverlapping(src_ptr, dst.as_ptr(), len);
            }
            Ok(())
        }
        DeferredTask::QueryTimestamp { pipeline } => {
            if let Some(nanos) = pipeline.read_elapsed_nanos() {
                log::debug!("dispatch took {nanos}ns");
            }
            Ok(())
        }
    }
}

impl Drop for CommandEncoder {
    fn drop(&mut self) {
        self.deferred.clear();
        unsafe {
            let raw = self.device.raw();
            raw.free_command_buffers(self.command_pool, &[self.command_buffer]);
            raw.destroy_command_pool(self.command_pool, None);
            raw.destroy_fence(self.fence, None);
        }
    }
}
