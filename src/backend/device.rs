// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Physical device selection (first adapter meeting every requirement)
// - Logical device + one queue per distinct family
// - Depth format detection
// - Memory allocator + transient command pool for one-off transfers

use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::command::{BeginFlags, CommandBuffer};
use super::surface::SurfaceProvider;
use crate::error::{BackendError, BackendResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Depth formats tried in order, highest precision first.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Queue family indices resolved for the selected adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices; one queue gets created per entry.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present].into_iter().collect();
        set.into_iter().collect()
    }
}

/// Surface capabilities, formats and present modes for one adapter/surface pair
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_loader: &ash::extensions::khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// What one adapter offers, gathered before deciding whether it qualifies
#[derive(Debug, Clone, Default)]
pub struct AdapterReport {
    pub name: String,
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
    pub missing_extensions: Vec<String>,
    pub swapchain_adequate: bool,
    pub sampler_anisotropy: bool,
}

impl AdapterReport {
    pub fn queue_families(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics_family?,
            present: self.present_family?,
        })
    }

    pub fn is_suitable(&self) -> bool {
        self.queue_families().is_some()
            && self.missing_extensions.is_empty()
            && self.swapchain_adequate
            && self.sampler_anisotropy
    }
}

/// First adapter that qualifies. Enumeration order decides; there is no scoring.
pub fn first_suitable_adapter(reports: &[AdapterReport]) -> Option<usize> {
    reports.iter().position(AdapterReport::is_suitable)
}

/// Pick the graphics family and a presentation family, preferring one family for both.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> (Option<u32>, Option<u32>) {
    let mut graphics = None;
    let mut present = None;

    for (index, props) in families.iter().enumerate() {
        let index = index as u32;
        let is_graphics = props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = supports_present(index);

        if is_graphics && can_present {
            return (Some(index), Some(index));
        }
        if is_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    (graphics, present)
}

/// First candidate whose optimal tiling supports depth/stencil attachment use.
pub fn pick_depth_format(
    candidates: &[vk::Format],
    optimal_features: impl Fn(vk::Format) -> vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        optimal_features(format).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,
    pub instance: ash::Instance,
    pub entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    pub depth_format: vk::Format,

    /// Pool for single-use transfer command buffers
    transient_pool: Mutex<vk::CommandPool>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
}

impl VulkanDevice {
    /// Create the Vulkan device against the surface of `surface_provider`.
    ///
    /// Every failure here is fatal for the renderer: missing layers, no
    /// qualifying adapter, no depth format.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        surface_provider: &dyn SurfaceProvider,
    ) -> BackendResult<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        if enable_validation && !Self::validation_layer_available(&entry)? {
            return Err(BackendError::MissingValidationLayer(
                VALIDATION_LAYER.to_string_lossy().into_owned(),
            ));
        }

        let instance = Self::create_instance(&entry, app_name, enable_validation, surface_provider)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = surface_provider.create_surface(&entry, &instance)?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        let (physical_device, queue_families, swapchain_support) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let depth_format = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| unsafe {
            instance
                .get_physical_device_format_properties(physical_device, format)
                .optimal_tiling_features
        })
        .ok_or(BackendError::NoDepthFormat)?;
        log::info!("Depth format: {:?}", depth_format);
        log::debug!(
            "Surface offers {} formats, present modes {:?}",
            swapchain_support.formats.len(),
            swapchain_support.present_modes
        );

        let device = Self::create_logical_device(&instance, physical_device, &queue_families)?;
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let transient_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            surface_loader,
            instance,
            entry,
            graphics_queue,
            present_queue,
            queue_families,
            depth_format,
            transient_pool: Mutex::new(transient_pool),
            debug_utils,
            properties,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> BackendResult<bool> {
        let layers = entry.enumerate_instance_layer_properties()?;
        Ok(has_layer(&layers, VALIDATION_LAYER))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        surface_provider: &dyn SurfaceProvider,
    ) -> BackendResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_default();
        let engine_name = c"Strata";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = surface_provider.required_instance_extensions()?;
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> BackendResult<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<(vk::PhysicalDevice, QueueFamilies, SwapchainSupport)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        let mut reports = Vec::with_capacity(devices.len());
        let mut supports = Vec::with_capacity(devices.len());
        for &device in &devices {
            let (report, support) = Self::inspect_adapter(instance, surface_loader, surface, device)?;
            if !report.is_suitable() {
                log::debug!("Adapter '{}' rejected: {:?}", report.name, report);
            }
            reports.push(report);
            supports.push(support);
        }

        let index = first_suitable_adapter(&reports).ok_or(BackendError::NoSuitableAdapter)?;
        let families = reports[index]
            .queue_families()
            .ok_or(BackendError::NoSuitableAdapter)?;
        log::info!(
            "Queue families: graphics={} present={}",
            families.graphics,
            families.present
        );

        Ok((devices[index], families, supports.swap_remove(index)))
    }

    fn inspect_adapter(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> BackendResult<(AdapterReport, SwapchainSupport)> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let (graphics_family, present_family) = find_queue_families(&queue_families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });

        let available: Vec<String> = unsafe { instance.enumerate_device_extension_properties(device) }?
            .iter()
            .map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        let missing_extensions = Self::required_device_extensions()
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !available.contains(name))
            .collect();

        let support = SwapchainSupport::query(surface_loader, device, surface)?;

        let report = AdapterReport {
            name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            graphics_family,
            present_family,
            missing_extensions,
            swapchain_adequate: support.is_adequate(),
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
        };

        Ok((report, support))
    }

    fn required_device_extensions() -> [&'static CStr; 1] {
        [ash::extensions::khr::Swapchain::name()]
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
    ) -> BackendResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<_> = Self::required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder().sampler_anisotropy(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }?;
        Ok(device)
    }

    /// Re-query surface support. Capabilities change with the window, so the
    /// swapchain calls this on every (re)creation.
    pub fn query_swapchain_support(&self) -> BackendResult<SwapchainSupport> {
        SwapchainSupport::query(&self.surface_loader, self.physical_device, self.surface)
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Allocate a transient command buffer and begin it for one-time submission.
    pub fn allocate_and_begin_single_use(&self) -> BackendResult<CommandBuffer> {
        let pool = *self.transient_pool.lock();
        let mut cmd = CommandBuffer::allocate(&self.device, pool, true)?;
        cmd.begin(&self.device, BeginFlags::single_use())?;
        Ok(cmd)
    }

    /// End, submit, wait for the graphics queue to drain, then free.
    pub fn end_single_use(&self, mut cmd: CommandBuffer) -> BackendResult<()> {
        cmd.end(&self.device)?;
        cmd.submit(&self.device, self.graphics_queue, &[], vk::Fence::null())?;
        unsafe { self.device.queue_wait_idle(self.graphics_queue) }?;

        let pool = self.transient_pool.lock();
        cmd.free(&self.device, *pool);
        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_command_pool(*self.transient_pool.get_mut(), None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

fn has_layer(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers
        .iter()
        .any(|layer| (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_char;

    fn layer(name: &CStr) -> vk::LayerProperties {
        let mut properties = vk::LayerProperties::default();
        for (dst, &src) in properties.layer_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        properties
    }

    #[test]
    fn test_validation_layer_lookup() {
        let layers = [layer(c"VK_LAYER_MESA_device_select"), layer(VALIDATION_LAYER)];
        assert!(has_layer(&layers, VALIDATION_LAYER));
        assert!(!has_layer(&layers[..1], VALIDATION_LAYER));
        assert!(!has_layer(&[], VALIDATION_LAYER));
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn suitable(name: &str) -> AdapterReport {
        AdapterReport {
            name: name.to_string(),
            graphics_family: Some(0),
            present_family: Some(0),
            missing_extensions: vec![],
            swapchain_adequate: true,
            sampler_anisotropy: true,
        }
    }

    #[test]
    fn test_first_qualifying_adapter_wins() {
        let mut no_aniso = suitable("integrated");
        no_aniso.sampler_anisotropy = false;
        let reports = vec![no_aniso, suitable("first"), suitable("second")];

        assert_eq!(first_suitable_adapter(&reports), Some(1));
    }

    #[test]
    fn test_no_adapter_qualifies() {
        let mut missing_ext = suitable("a");
        missing_ext.missing_extensions = vec!["VK_KHR_swapchain".into()];
        let mut no_present = suitable("b");
        no_present.present_family = None;
        let mut no_modes = suitable("c");
        no_modes.swapchain_adequate = false;

        assert_eq!(first_suitable_adapter(&[missing_ext, no_present, no_modes]), None);
    }

    #[test]
    fn test_queue_families_prefer_shared_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let (graphics, present) = find_queue_families(&families, |i| i == 1 || i == 2);
        assert_eq!((graphics, present), (Some(2), Some(2)));
    }

    #[test]
    fn test_queue_families_split() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let (graphics, present) = find_queue_families(&families, |i| i == 1);
        assert_eq!((graphics, present), (Some(0), Some(1)));

        let unique = QueueFamilies { graphics: 0, present: 1 }.unique();
        assert_eq!(unique, vec![0, 1]);
        assert_eq!(QueueFamilies { graphics: 3, present: 3 }.unique(), vec![3]);
    }

    #[test]
    fn test_depth_format_candidate_order() {
        let only_d24 = |format: vk::Format| {
            if format == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            }
        };
        assert_eq!(
            pick_depth_format(&DEPTH_FORMAT_CANDIDATES, only_d24),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );

        let all = |_| vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert_eq!(pick_depth_format(&DEPTH_FORMAT_CANDIDATES, all), Some(vk::Format::D32_SFLOAT));

        let none = |_| vk::FormatFeatureFlags::SAMPLED_IMAGE;
        assert_eq!(pick_depth_format(&DEPTH_FORMAT_CANDIDATES, none), None);
    }
}
