//! Engine-wide tuning knobs, consumed once at [`crate::device::Device::init`]
//! and [`crate::model::Model::init`] time.

use crate::tensor::DType;

/// Default suballocator slab size: 10 MiB, per the suballocator's slab-growth
/// contract.
pub const DEFAULT_SLAB_ALIGN: u64 = 10 * 1024 * 1024;

/// Default fence wait timeout: 60 seconds.
pub const DEFAULT_FENCE_TIMEOUT_SECS: u64 = 60;

/// Builder for engine-wide configuration. Immutable once passed to
/// [`crate::device::Device::init`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) physical_device_index: usize,
    pub(crate) slab_align: u64,
    pub(crate) validation_layers: Option<bool>,
    pub(crate) preferred_dtype: DType,
    pub(crate) fence_timeout_secs: u64,
    pub(crate) application_name: &'static str,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            physical_device_index: 0,
            slab_align: DEFAULT_SLAB_ALIGN,
            validation_layers: None,
            preferred_dtype: DType::Fp16,
            fence_timeout_secs: DEFAULT_FENCE_TIMEOUT_SECS,
            application_name: "vkllama",
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which physical device to select, in `vkEnumeratePhysicalDevices` order.
    pub fn physical_device_index(mut self, index: usize) -> Self {
        self.physical_device_index = index;
        self
    }

    /// Overrides the suballocator's slab growth size. Must stay a sane
    /// multiple of typical buffer alignments; the default (10 MiB) matches
    /// every known driver's minimum allocation granularity.
    pub fn slab_align(mut self, bytes: u64) -> Self {
        self.slab_align = bytes;
        self
    }

    /// Force validation layers on/off. `None` (the default) enables them in
    /// debug builds only, mirroring the device contract.
    pub fn validation_layers(mut self, enabled: bool) -> Self {
        self.validation_layers = Some(enabled);
        self
    }

    pub fn preferred_dtype(mut self, dtype: DType) -> Self {
        self.preferred_dtype = dtype;
        self
    }

    pub fn fence_timeout_secs(mut self, secs: u64) -> Self {
        self.fence_timeout_secs = secs;
        self
    }

    pub(crate) fn want_validation_layers(&self) -> bool {
        self.validation_layers.unwrap_or(cfg!(debug_assertions))
    }
}
