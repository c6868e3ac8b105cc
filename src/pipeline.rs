//! Compute pipeline objects: shader module + descriptor layout + pipeline
//! layout + descriptor pool/set, bundled the way
//! `examples/original_source/src/core/pipeline.{h,cpp}` bundles them.
//!
//! Every binding in this engine is a storage buffer (no samplers, no uniform
//! buffers), so the descriptor set layout is always `binding_count` storage
//! buffers at consecutive indices, push constants are a single
//! `PushConstants`-sized range, and specialization constants always end with
//! the workgroup's `(x, y, z)` size at the reserved ids 253/254/255.

use ash::vk;

use crate::device::Device;
use crate::error::ShapeError;
use crate::tensor::Tensor;

/// One scalar specialization or push constant. Matches the original engine's
/// `ConstantType` union: every constant is exactly 4 bytes, reinterpreted as
/// whichever of `i32`/`f32`/`u32` the shader declares it as.
#[derive(Debug, Clone, Copy)]
pub enum Constant {
    I32(i32),
    F32(f32),
    U32(u32),
}

impl Constant {
    fn to_bytes(self) -> [u8; 4] {
        match self {
            Constant::I32(v) => v.to_ne_bytes(),
            Constant::F32(v) => v.to_ne_bytes(),
            Constant::U32(v) => v.to_ne_bytes(),
        }
    }
}

/// Static shape of a pipeline: how many bindings, push constants and
/// specialization constants it declares, plus its requested local workgroup
/// size (clamped to the device's limits at creation time).
#[derive(Debug, Clone, Copy)]
pub struct ShaderInfo {
    pub binding_count: u32,
    pub push_constant_count: u32,
    pub local_x: u32,
    pub local_y: u32,
    pub local_z: u32,
}

const WORKGROUP_SPECIALIZATION_BASE_ID: u32 = 253;

/// A compute pipeline bound to a specific SPIR-V module, descriptor layout
/// and specialization constants. One `Pipeline` is created per operator
/// kernel variant (e.g. "matmul fp16" and "matmul fp32" are two pipelines)
/// and reused across every dispatch of that kernel.
pub struct Pipeline {
    device: std::sync::Arc<Device>,
    module: vk::ShaderModule,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_update_template: Option<vk::DescriptorUpdateTemplate>,
    query_pool: Option<vk::QueryPool>,
    info: ShaderInfo,
    group: std::cell::Cell<(u32, u32, u32)>,
}

impl Pipeline {
    pub fn new(
        device: &std::sync::Arc<Device>,
        spirv: &[u32],
        specialization: &[Constant],
        mut info: ShaderInfo,
    ) -> Result<Pipeline, ShapeError> {
        let limits = device.limits();
        info.local_x = info.local_x.min(limits.max_compute_work_group_size[0]);
        info.local_y = info.local_y.min(limits.max_compute_work_group_size[1]);
        info.local_z = info.local_z.min(limits.max_compute_work_group_size[2]);
        let product = info.local_x as u64 * info.local_y as u64 * info.local_z as u64;
        if product > limits.max_compute_work_group_invocations as u64 {
            return Err(ShapeError::WorkgroupTooLarge {
                local: [info.local_x, info.local_y, info.local_z],
                limit: limits.max_compute_work_group_size,
                product,
                max_invocations: limits.max_compute_work_group_invocations,
            });
        }

        let module = Self::create_shader_module(device, spirv);
        let descriptor_set_layout = Self::create_descriptor_set_layout(device, info.binding_count);
        let pipeline_layout =
            Self::create_pipeline_layout(device, descriptor_set_layout, info.push_constant_count);
        let (descriptor_pool, descriptor_set) =
            Self::create_descriptor_set(device, descriptor_set_layout);
        let pipeline = Self::create_compute_pipeline(
            device,
            module,
            pipeline_layout,
            specialization,
            info,
        );
        let descriptor_update_template = if device.capabilities().descriptor_update_template {
            Some(Self::create_descriptor_update_template(
                device,
                descriptor_set_layout,
                pipeline_layout,
                info.binding_count,
            ))
        } else {
            None
        };
        let query_pool = if device.capabilities().timestamp_queries {
            Some(Self::create_query_pool(device))
        } else {
            None
        };

        Ok(Pipeline {
            device: device.clone(),
            module,
            descriptor_set_layout,
            descriptor_pool,
            descriptor_set,
            pipeline_layout,
            pipeline,
            descriptor_update_template,
            query_pool,
            info,
            group: std::cell::Cell::new((0, 0, 0)),
        })
    }

    fn create_query_pool(device: &Device) -> vk::QueryPool {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);
        unsafe { device.raw().create_query_pool(&create_info, None) }
            .expect("vkCreateQueryPool failed")
    }

    pub fn query_pool(&self) -> Option<vk::QueryPool> {
        self.query_pool
    }

    /// Reads back the two timestamps written around the pipeline's last
    /// dispatch and returns the elapsed device time in nanoseconds. Blocks
    /// until both queries are available; only called from a deferred task
    /// after the command buffer's fence has already signaled.
    pub fn read_elapsed_nanos(&self) -> Option<u64> {
        let pool = self.query_pool?;
        let mut timestamps = [0u64; 2];
        unsafe {
            self.device
                .raw()
                .get_query_pool_results(
                    pool,
                    0,
                    &mut timestamps,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .ok()?;
        }
        let period = self.device.limits().timestamp_period as f64;
        Some(((timestamps[1] - timestamps[0]) as f64 * period) as u64)
    }

    fn create_shader_module(device: &Device, spirv: &[u32]) -> vk::ShaderModule {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        unsafe { device.raw().create_shader_module(&create_info, None) }
            .expect("vkCreateShaderModule failed for an embedded, build-time-validated SPIR-V blob")
    }

    fn create_descriptor_set_layout(
        device: &Device,
        binding_count: u32,
    ) -> vk::DescriptorSetLayout {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..binding_count)
            .map(|i| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { device.raw().create_descriptor_set_layout(&create_info, None) }
            .expect("vkCreateDescriptorSetLayout failed")
    }

    fn create_pipeline_layout(
        device: &Device,
        set_layout: vk::DescriptorSetLayout,
        push_constant_count: u32,
    ) -> vk::PipelineLayout {
        let set_layouts = [set_layout];
        let range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_count * 4);
        let ranges = [*range];
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(if push_constant_count > 0 { &ranges } else { &[] });
        unsafe { device.raw().create_pipeline_layout(&create_info, None) }
            .expect("vkCreatePipelineLayout failed")
    }

    fn create_descriptor_set(
        device: &Device,
        set_layout: vk::DescriptorSetLayout,
    ) -> (vk::DescriptorPool, vk::DescriptorSet) {
        let pool_size = vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(1024);
        let pool_sizes = [*pool_size];
        let pool_create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.raw().create_descriptor_pool(&pool_create_info, None) }
            .expect("vkCreateDescriptorPool failed");

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = unsafe { device.raw().allocate_descriptor_sets(&alloc_info) }
            .expect("vkAllocateDescriptorSets failed")[0];
        (pool, set)
    }

    /// Specialization constants are laid out as the caller-provided leading
    /// constants followed by the three workgroup-size constants at reserved
    /// ids 253/254/255, matching the original shader constants contract.
    fn create_compute_pipeline(
        device: &Device,
        module: vk::ShaderModule,
        layout: vk::PipelineLayout,
        specialization: &[Constant],
        info: ShaderInfo,
    ) -> vk::Pipeline {
        let mut all_constants: Vec<Constant> = specialization.to_vec();
        all_constants.push(Constant::U32(info.local_x));
        all_constants.push(Constant::U32(info.local_y));
        all_constants.push(Constant::U32(info.local_z));

        let mut map_entries: Vec<vk::SpecializationMapEntry> = Vec::with_capacity(all_constants.len());
        for (i, _) in specialization.iter().enumerate() {
            map_entries.push(
                *vk::SpecializationMapEntry::builder()
                    .constant_id(i as u32)
                    .offset((i * 4) as u32)
                    .size(4),
            );
        }
        for i in 0..3u32 {
            map_entries.push(
                *vk::SpecializationMapEntry::builder()
                    .constant_id(WORKGROUP_SPECIALIZATION_BASE_ID + i)
                    .offset((specialization.len() + i as usize) as u32 * 4)
                    .size(4),
            );
        }

        let data: Vec<u8> = all_constants.iter().flat_map(|c| c.to_bytes()).collect();
        let specialization_info = vk::SpecializationInfo::builder()
            .map_entries(&map_entries)
            .data(&data);

        let entry_point = std::ffi::CString::new("main").unwrap();
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .specialization_info(&specialization_info);

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(*stage)
            .layout(layout);

        unsafe {
            device
                .raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &[*create_info], None)
        }
        .expect("vkCreateComputePipelines failed")[0]
    }

    fn create_descriptor_update_template(
        device: &Device,
        set_layout: vk::DescriptorSetLayout,
        pipeline_layout: vk::PipelineLayout,
        binding_count: u32,
    ) -> vk::DescriptorUpdateTemplate {
        let entries: Vec<vk::DescriptorUpdateTemplateEntry> = (0..binding_count)
            .map(|i| {
                *vk::DescriptorUpdateTemplateEntry::builder()
                    .dst_binding(i)
                    .dst_array_element(0)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .offset(i as usize * std::mem::size_of::<vk::DescriptorBufferInfo>())
                    .stride(std::mem::size_of::<vk::DescriptorBufferInfo>())
            })
            .collect();
        let create_info = vk::DescriptorUpdateTemplateCreateInfo::builder()
            .descriptor_update_entries(&entries)
            .template_type(vk::DescriptorUpdateTemplateType::DESCRIPTOR_SET)
            .descriptor_set_layout(set_layout)
            .pipeline_bind_point(vk::PipelineBindPoint::COMPUTE)
            .pipeline_layout(pipeline_layout);
        unsafe {
            device
                .raw()
                .create_descriptor_update_template(&create_info, None)
        }
        .expect("vkCreateDescriptorUpdateTemplate failed")
    }

    /// Rewrites every binding in the descriptor set to point at `bindings[i]`
    /// at index `i`. Uses the update template when the device supports it,
    /// falling back to a `vkUpdateDescriptorSets` batch otherwise.
    pub fn update_bindings(&self, bindings: &[&Tensor]) {
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = bindings
            .iter()
            .map(|t| {
                *vk::DescriptorBufferInfo::builder()
                    .buffer(t.buffer())
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
            })
            .collect();

        if let Some(template) = self.descriptor_update_template {
            unsafe {
                self.device.raw().update_descriptor_set_with_template(
                    self.descriptor_set,
                    template,
                    buffer_infos.as_ptr() as *const std::ffi::c_void,
                );
            }
        } else {
            let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
                .iter()
                .enumerate()
                .map(|(i, info)| {
                    *vk::WriteDescriptorSet::builder()
                        .dst_set(self.descriptor_set)
                        .dst_binding(i as u32)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(std::slice::from_ref(info))
                })
                .collect();
            unsafe {
                self.device.raw().update_descriptor_sets(&writes, &[]);
            }
        }
    }

    /// Records the dispatch's workgroup count, validating it against the
    /// device's `maxComputeWorkGroupCount` limit.
    pub fn set_group(&self, x: u32, y: u32, z: u32) -> Result<(), ShapeError> {
        let limits = self.device.limits();
        if x > limits.max_compute_work_group_count[0]
            || y > limits.max_compute_work_group_count[1]
            || z > limits.max_compute_work_group_count[2]
        {
            return Err(ShapeError::WorkgroupTooLarge {
                local: [self.info.local_x, self.info.local_y, self.info.local_z],
                limit: limits.max_compute_work_group_size,
                product: x as u64 * y as u64 * z as u64,
                max_invocations: limits.max_compute_work_group_invocations,
            });
        }
        self.group.set((x, y, z));
        Ok(())
    }

    pub fn group(&self) -> (u32, u32, u32) {
        self.group.get()
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub fn info(&self) -> ShaderInfo {
        self.info
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            let raw = self.device.raw();
            raw.destroy_pipeline(self.pipeline, None);
            raw.destroy_shader_module(self.module, None);
            raw.destroy_pipeline_layout(self.pipeline_layout, None);
            if let Some(template) = self.descriptor_update_template {
                raw.destroy_descriptor_update_template(template, None);
            }
            if let Some(pool) = self.query_pool {
                raw.destroy_query_pool(pool, None);
            }
            raw.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            raw.destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}
