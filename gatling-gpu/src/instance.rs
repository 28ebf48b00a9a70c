use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use gatling_types::{AdapterInfo, DeviceFeatures, DeviceLimits};

use crate::{device::Device, DeviceError};

pub(crate) struct InstanceShared {
    pub entry: ash::Entry,
    pub raw: ash::Instance,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe { self.raw.destroy_instance(None) };
    }
}

/// Entry point of the device layer: loads the Vulkan library, creates an
/// instance and enumerates compute-capable adapters.
pub struct Instance {
    shared: Arc<InstanceShared>,
}

impl Instance {
    pub fn new() -> Result<Self, DeviceError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| DeviceError::Loader(e.to_string()))?;

        let app_name = CString::new("gatling").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 3, 0))
            .engine_name(&app_name)
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
        let raw = unsafe { entry.create_instance(&create_info, None) }?;
        log::debug!("created vulkan instance (api 1.1)");

        Ok(Self {
            shared: Arc::new(InstanceShared { entry, raw }),
        })
    }

    /// All physical devices exposing a compute queue, most capable first
    /// (discrete GPUs before integrated ones).
    pub fn enumerate_adapters(&self) -> Result<Vec<Adapter>, DeviceError> {
        let raw_devices = unsafe { self.shared.raw.enumerate_physical_devices() }?;
        let mut adapters = Vec::new();
        for raw in raw_devices {
            match Adapter::describe(&self.shared, raw) {
                Some(adapter) => adapters.push(adapter),
                None => log::debug!("skipping adapter without a compute queue"),
            }
        }
        adapters.sort_by_key(|a| match a.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            _ => 3,
        });
        Ok(adapters)
    }

    /// Convenience path: open a device on the best adapter that meets the
    /// minimum feature set, or fail with `UnsupportedHardware`.
    pub fn open_default_device(&self) -> Result<Device, DeviceError> {
        let adapters = self.enumerate_adapters()?;
        for adapter in &adapters {
            if adapter.features().contains(DeviceFeatures::MINIMUM) {
                return adapter.open();
            }
        }
        Err(DeviceError::UnsupportedHardware(format!(
            "none of the {} adapters supports {:?}",
            adapters.len(),
            DeviceFeatures::MINIMUM
        )))
    }
}

/// One physical device plus everything queried up front about it.
pub struct Adapter {
    pub(crate) shared: Arc<InstanceShared>,
    pub(crate) raw: vk::PhysicalDevice,
    pub(crate) family_index: u32,
    pub(crate) features: DeviceFeatures,
    pub(crate) limits: DeviceLimits,
    device_type: vk::PhysicalDeviceType,
    name: String,
    vendor_id: u32,
    device_id: u32,
}

impl Adapter {
    fn describe(shared: &Arc<InstanceShared>, raw: vk::PhysicalDevice) -> Option<Self> {
        let instance = &shared.raw;
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let family_index = queue_families
            .iter()
            .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))?
            as u32;

        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let core_features = unsafe { instance.get_physical_device_features(raw) };
        let extensions = unsafe { instance.enumerate_device_extension_properties(raw) }.ok()?;
        let has_extension = |name: &CStr| {
            extensions
                .iter()
                .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == name)
        };

        let mut features = DeviceFeatures::empty();
        if core_features.sampler_anisotropy != 0 {
            features |= DeviceFeatures::SAMPLER_ANISOTROPY;
        }
        if core_features.shader_int16 != 0 {
            features |= DeviceFeatures::SHADER_INT16;
        }
        if has_extension(vk::KhrAccelerationStructureFn::name()) {
            features |= DeviceFeatures::ACCELERATION_STRUCTURE;
        }
        if has_extension(vk::KhrRayTracingPipelineFn::name()) {
            features |= DeviceFeatures::RAY_TRACING_PIPELINE;
        }
        if has_extension(vk::KhrShaderClockFn::name()) {
            features |= DeviceFeatures::SHADER_CLOCK;
        }
        if has_extension(vk::KhrShaderNonSemanticInfoFn::name()) {
            features |= DeviceFeatures::DEBUG_PRINTF;
        }
        if properties.limits.timestamp_compute_and_graphics != 0 {
            features |= DeviceFeatures::TIMESTAMPS;
        }

        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: properties
                .limits
                .min_storage_buffer_offset_alignment,
            max_push_constant_size: properties.limits.max_push_constants_size,
            max_compute_workgroup_invocations: properties
                .limits
                .max_compute_work_group_invocations,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            timestamp_period_ns: properties.limits.timestamp_period,
        };

        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Some(Self {
            shared: Arc::clone(shared),
            raw,
            family_index,
            features,
            limits,
            device_type: properties.device_type,
            name,
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
        })
    }

    pub fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            features: self.features,
        }
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    /// Create the logical device, its queue, command pool, query pool and
    /// memory allocator. Fails with `UnsupportedHardware` when the
    /// adapter is missing the minimum feature set.
    pub fn open(&self) -> Result<Device, DeviceError> {
        let missing = DeviceFeatures::MINIMUM - self.features;
        if !missing.is_empty() {
            return Err(DeviceError::UnsupportedHardware(format!(
                "adapter `{}` is missing {missing:?}",
                self.name
            )));
        }
        log::info!(
            "opening device on `{}` (features {:?})",
            self.name,
            self.features
        );
        Device::open(self)
    }
}
