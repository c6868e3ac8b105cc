//! Vulkan instance/device bring-up: the one object every other subsystem
//! borrows from.
//!
//! Grounded on `wgpu-hal`'s `vulkan::Instance`/`vulkan::Adapter`/`DeviceShared`
//! split (instance owns the loader and debug messenger, the logical device
//! owns the dispatch table and capability flags) and on the original engine's
//! single-file `GPUDevice`, which folds instance + physical device + logical
//! device + queue selection into one object since this engine only ever
//! targets one adapter per process.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;

use crate::config::EngineConfig;
use crate::error::DeviceError;
use crate::suballocator::Suballocator;

/// Feature/extension flags that change which code path an operator takes.
/// Named explicitly (rather than exposing raw `vk::PhysicalDeviceFeatures`)
/// so callers outside this crate never need to know Vulkan structs exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub storage_16bit: bool,
    pub fp16_arithmetic: bool,
    pub descriptor_update_template: bool,
    pub timestamp_queries: bool,
}

struct DebugMessenger {
    loader: ash::extensions::ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("{message_type:?}: {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("{message_type:?}: {message}")
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::debug!("{message_type:?}: {message}"),
        _ => log::trace!("{message_type:?}: {message}"),
    }
    vk::FALSE
}

/// Owns the Vulkan instance, the selected logical device, its queue, memory
/// properties and the one suballocator shared by every tensor.
///
/// Created once at engine start, destroyed once at shutdown; every other
/// handle in the crate (tensors, pipelines, commands) holds an `Arc<Device>`
/// and must drop before the `Device` itself is dropped, matching the
/// suballocator teardown invariant in the data model.
pub struct Device {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue_family_index: u32,
    queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    capabilities: Capabilities,
    suballocator: parking_lot::Mutex<Suballocator>,
    fence_timeout_secs: u64,
}

// SAFETY: all Vulkan handles here are only ever driven from the single host
// thread that owns the `Device`; we mark it `Send + Sync` purely so the
// engine's handle types (Arc<Device>) can be embedded in multi-threaded host
// applications without forcing unsafe on the caller. No method performs
// unsynchronized concurrent device access.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    pub fn init(config: &EngineConfig) -> Result<Arc<Device>, DeviceError> {
        let entry = unsafe { ash::Entry::load().map_err(DeviceError::Loader)? };

        let app_name = CString::new(config.application_name).unwrap();
        let engine_name = CString::new("vkllama").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut layer_names: Vec<CString> = Vec::new();
        if config.want_validation_layers() {
            layer_names.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        }
        let layer_name_ptrs: Vec<*const i8> =
            layer_names.iter().map(|l| l.as_ptr()).collect();

        let mut ext_names: Vec<*const i8> = Vec::new();
        if config.want_validation_layers() {
            ext_names.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }
        #[cfg(target_os = "macos")]
        ext_names.push(vk::KhrPortabilityEnumerationFn::name().as_ptr());

        let create_flags = if cfg!(target_os = "macos") {
            vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
        } else {
            vk::InstanceCreateFlags::empty()
        };

        let instance_create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&ext_names)
            .flags(create_flags);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(DeviceError::InstanceCreation)?
        };

        let debug_messenger = if config.want_validation_layers() {
            let loader = ash::extensions::ext::DebugUtils::new(&entry, &instance);
            let info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&info, None) }
                    .map_err(DeviceError::Vulkan)?;
            Some(DebugMessenger { loader, messenger })
        } else {
            None
        };

        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(DeviceError::Vulkan)?
        };
        if config.physical_device_index >= physical_devices.len() {
            return Err(DeviceError::DeviceIndexOutOfRange {
                requested: config.physical_device_index,
                available: physical_devices.len(),
            });
        }
        let physical_device = physical_devices[config.physical_device_index];

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "selected physical device {:?} (vendor {:#x}, driver {:#x})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) },
            properties.vendor_id,
            properties.driver_version,
        );

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let queue_family_index = queue_family_properties
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
            })
            .ok_or(DeviceError::NoSuitableQueueFamily(
                vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            ))? as u32;

        let priorities = [0.5f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);

        let available_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(physical_device)
                .map_err(DeviceError::Vulkan)?
        };
        let has_extension = |name: &CStr| {
            available_extensions
                .iter()
                .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
        };

        let mut device_extension_ptrs: Vec<*const i8> = Vec::new();
        let wants_update_template = has_extension(
            ash::extensions::khr::DescriptorUpdateTemplate::name(),
        );
        if wants_update_template {
            device_extension_ptrs
                .push(ash::extensions::khr::DescriptorUpdateTemplate::name().as_ptr());
        }
        let wants_16bit_storage = has_extension(vk::Khr16bitStorageFn::name());
        if wants_16bit_storage {
            device_extension_ptrs.push(vk::Khr16bitStorageFn::name().as_ptr());
        }
        #[cfg(target_os = "macos")]
        device_extension_ptrs.push(vk::KhrPortabilitySubsetFn::name().as_ptr());

        let mut storage_16bit_features =
            vk::PhysicalDevice16BitStorageFeatures::builder().storage_buffer16_bit_access(true);
        let mut float16_int8_features =
            vk::PhysicalDeviceShaderFloat16Int8FeaturesKHR::builder().shader_float16(true);

        let supports_16bit_storage_feature = {
            let mut features16 = vk::PhysicalDevice16BitStorageFeatures::default();
            let mut features2 =
                vk::PhysicalDeviceFeatures2::builder().push_next(&mut features16);
            unsafe {
                instance.get_physical_device_features2(physical_device, &mut features2);
            }
            features16.storage_buffer16_bit_access == vk::TRUE
        };
        let supports_fp16_arithmetic_feature = {
            let mut featuresf16 = vk::PhysicalDeviceShaderFloat16Int8FeaturesKHR::default();
            let mut features2 =
                vk::PhysicalDeviceFeatures2::builder().push_next(&mut featuresf16);
            unsafe {
                instance.get_physical_device_features2(physical_device, &mut features2);
            }
            featuresf16.shader_float16 == vk::TRUE
        };

        let queue_create_infos = [*queue_create_info];
        let mut device_features = vk::PhysicalDeviceFeatures2::builder().features(
            vk::PhysicalDeviceFeatures::builder().shader_int64(false).build(),
        );
        if supports_16bit_storage_feature && wants_16bit_storage {
            device_features = device_features.push_next(&mut storage_16bit_features);
        }
        if supports_fp16_arithmetic_feature {
            device_features = device_features.push_next(&mut float16_int8_features);
        }

        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_extension_ptrs)
            .push_next(&mut device_features);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(DeviceError::LogicalDeviceCreation)?
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let capabilities = Capabilities {
            storage_16bit: supports_16bit_storage_feature && wants_16bit_storage,
            fp16_arithmetic: supports_fp16_arithmetic_feature,
            descriptor_update_template: wants_update_template,
            timestamp_queries: properties.limits.timestamp_compute_and_graphics == vk::TRUE,
        };
        if !capabilities.fp16_arithmetic {
            log::warn!("device lacks VK_KHR_shader_float16_int8; falling back to FP32 arithmetic in shaders that would otherwise use FP16 math");
        }
        if !capabilities.descriptor_update_template {
            log::warn!("device lacks VK_KHR_descriptor_update_template; pipelines will fall back to per-binding vkUpdateDescriptorSets");
        }

        let suballocator = Suballocator::new(config.slab_align);

        Ok(Arc::new(Device {
            entry,
            instance,
            debug_messenger,
            physical_device,
            device,
            queue_family_index,
            queue,
            memory_properties,
            properties,
            capabilities,
            suballocator: parking_lot::Mutex::new(suballocator),
            fence_timeout_secs: config.fence_timeout_secs,
        }))
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn fence_timeout_secs(&self) -> u64 {
        self.fence_timeout_secs
    }

    pub fn non_coherent_atom_size(&self) -> u64 {
        self.properties.limits.non_coherent_atom_size
    }

    pub(crate) fn suballocator(&self) -> &parking_lot::Mutex<Suballocator> {
        &self.suballocator
    }

    /// First-fit memory type index lookup: the first bit set in `type_mask`
    /// whose property flags are a superset of `flags`.
    pub fn find_memory_type(
        &self,
        type_mask: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, DeviceError> {
        for i in 0..self.memory_properties.memory_type_count {
            let supported = (type_mask & (1 << i)) != 0;
            let compatible = self.memory_properties.memory_types[i as usize]
                .property_flags
                .contains(flags);
            if supported && compatible {
                return Ok(i);
            }
        }
        Err(DeviceError::NoSuitableMemoryType { type_mask, flags })
    }

    /// First queue family whose flags are a superset of `flags`.
    pub fn require_queue(&self, flags: vk::QueueFlags) -> Result<u32, DeviceError> {
        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(self.physical_device)
        };
        families
            .iter()
            .position(|f| f.queue_flags.contains(flags))
            .map(|i| i as u32)
            .ok_or(DeviceError::NoSuitableQueueFamily(flags))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            // All tensors/pipelines/commands must have been dropped already
            // so every allocation has been returned to the suballocator.
            self.suballocator.lock().destroy_all(&self.device);
            self.device.destroy_device(None);
            if let Some(messenger) = self.debug_messenger.take() {
                messenger
                    .loader
                    .destroy_debug_utils_messenger(messenger.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("queue_family_index", &self.queue_family_index)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
