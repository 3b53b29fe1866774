//! Physical device capability probing.
use crate::queue::ResolvedQueueFamilies;
use ash::extensions::khr::Surface;
use ash::prelude::VkResult;
use ash::{vk, Instance};
use std::{
    collections::HashSet,
    ffi::{CStr, CString},
};

/// Queue family indices satisfying the graphics and presentation roles.
/// Both may refer to the same family.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct QueueFamilyIndices {
    /// First queue family supporting graphics commands.
    pub graphics_family: Option<u32>,
    /// First queue family able to present to the surface.
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Returns true if both roles have a queue family.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// The resolved families, if both roles are covered.
    #[inline]
    pub fn complete(&self) -> Option<ResolvedQueueFamilies> {
        Some(ResolvedQueueFamilies {
            graphics: self.graphics_family?,
            present: self.present_family?,
        })
    }
}

/// Surface capabilities, formats and present modes of a device/surface pair.
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    /// Image count, extent and transform bounds.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported format and color space pairs.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    /// A swapchain can only be created with at least one format and one
    /// present mode.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Everything the selector needs to know about a physical device.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    /// The probed device.
    pub physical_device: vk::PhysicalDevice,
    /// Properties, including type and limits.
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported core features.
    pub features: vk::PhysicalDeviceFeatures,
    /// Queue families for the graphics and presentation roles.
    pub queue_families: QueueFamilyIndices,
    /// Whether all required device extensions are supported.
    pub extensions_supported: bool,
    /// Swapchain support, empty if the extensions are not supported.
    pub swapchain_support: SwapchainSupport,
}

impl DeviceProbe {
    /// Name of the physical device.
    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Driver queries needed to probe a physical device against one surface.
pub trait DeviceQuery {
    /// Properties of `physical_device`.
    fn properties(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties;

    /// Core features supported by `physical_device`.
    fn features(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures;

    /// Queue families in device-reported order.
    fn queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties>;

    /// Whether `queue_family_index` can present to the surface.
    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> VkResult<bool>;

    /// Names of all device extensions.
    fn extension_names(&self, physical_device: vk::PhysicalDevice) -> VkResult<Vec<CString>>;

    /// Surface capabilities.
    fn surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR>;

    /// Supported surface formats.
    fn surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>>;

    /// Supported present modes.
    fn surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::PresentModeKHR>>;
}

/// [`DeviceQuery`] backed by a live instance and surface.
pub struct SurfaceQuery<'a> {
    instance: &'a Instance,
    surface_loader: &'a Surface,
    surface: vk::SurfaceKHR,
}

impl<'a> SurfaceQuery<'a> {
    /// `surface` must have been created from `instance`, and both must
    /// outlive the query.
    pub unsafe fn new(
        instance: &'a Instance,
        surface_loader: &'a Surface,
        surface: vk::SurfaceKHR,
    ) -> Self {
        SurfaceQuery {
            instance,
            surface_loader,
            surface,
        }
    }
}

impl DeviceQuery for SurfaceQuery<'_> {
    fn properties(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
        unsafe { self.instance.get_physical_device_properties(physical_device) }
    }

    fn features(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures {
        unsafe { self.instance.get_physical_device_features(physical_device) }
    }

    fn queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    fn surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> VkResult<bool> {
        unsafe {
            self.surface_loader.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.surface,
            )
        }
    }

    fn extension_names(&self, physical_device: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
        let extension_properties = unsafe {
            self.instance
                .enumerate_device_extension_properties(physical_device)?
        };

        Ok(extension_properties
            .iter()
            .map(|extension| unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }.to_owned())
            .collect())
    }

    fn surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
        }
    }

    fn surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
        }
    }

    fn surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
        }
    }
}

/// Finds the first graphics family and the first presentation family.
/// Scanning stops as soon as both roles are covered.
pub fn find_queue_families(
    query: &impl DeviceQuery,
    physical_device: vk::PhysicalDevice,
) -> VkResult<QueueFamilyIndices> {
    let mut indices = QueueFamilyIndices::default();
    for (i, queue_family) in query
        .queue_family_properties(physical_device)
        .iter()
        .enumerate()
    {
        let i = i as u32;

        if indices.graphics_family.is_none()
            && queue_family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        {
            indices.graphics_family = Some(i);
        }

        if indices.present_family.is_none() && query.surface_support(physical_device, i)? {
            indices.present_family = Some(i);
        }

        if indices.is_complete() {
            break;
        }
    }

    Ok(indices)
}

/// Returns true if every `required` extension is in `available`.
/// Names are compared exactly.
pub fn check_extension_support<R, A>(required: &[R], available: &[A]) -> bool
where
    R: AsRef<CStr>,
    A: AsRef<CStr>,
{
    let mut missing: HashSet<&CStr> = required.iter().map(|name| name.as_ref()).collect();
    for extension in available {
        missing.remove(extension.as_ref());
    }

    missing.is_empty()
}

/// Queries swapchain support for the query's surface. Never cached.
pub fn query_swapchain_support(
    query: &impl DeviceQuery,
    physical_device: vk::PhysicalDevice,
) -> VkResult<SwapchainSupport> {
    Ok(SwapchainSupport {
        capabilities: query.surface_capabilities(physical_device)?,
        formats: query.surface_formats(physical_device)?,
        present_modes: query.surface_present_modes(physical_device)?,
    })
}

/// Collects a [`DeviceProbe`] for `physical_device`.
pub fn probe_device<E: AsRef<CStr>>(
    query: &impl DeviceQuery,
    physical_device: vk::PhysicalDevice,
    required_extensions: &[E],
) -> VkResult<DeviceProbe> {
    let queue_families = find_queue_families(query, physical_device)?;
    let extensions_supported =
        check_extension_support(required_extensions, &query.extension_names(physical_device)?);

    let swapchain_support = if extensions_supported {
        query_swapchain_support(query, physical_device)?
    } else {
        SwapchainSupport::default()
    };

    Ok(DeviceProbe {
        physical_device,
        properties: query.properties(physical_device),
        features: query.features(physical_device),
        queue_families,
        extensions_supported,
        swapchain_support,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ash::vk::Handle;
    use cstr::cstr;
    use std::{cell::Cell, collections::HashMap};

    /// Fake device description for [`FakeQuery`].
    #[derive(Clone)]
    pub(crate) struct FakeDevice {
        pub device_type: vk::PhysicalDeviceType,
        pub max_image_dimension_2d: u32,
        pub geometry_shader: bool,
        /// Queue flags and presentation support, per family.
        pub queue_families: Vec<(vk::QueueFlags, bool)>,
        pub extensions: Vec<CString>,
        pub formats: Vec<vk::SurfaceFormatKHR>,
        pub present_modes: Vec<vk::PresentModeKHR>,
    }

    impl FakeDevice {
        pub(crate) fn discrete() -> FakeDevice {
            FakeDevice {
                device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
                max_image_dimension_2d: 16384,
                geometry_shader: true,
                queue_families: vec![(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true)],
                extensions: vec![cstr!("VK_KHR_swapchain").to_owned()],
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            }
        }

        pub(crate) fn integrated() -> FakeDevice {
            FakeDevice {
                device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
                max_image_dimension_2d: 8192,
                ..FakeDevice::discrete()
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeQuery {
        devices: HashMap<u64, FakeDevice>,
        pub surface_support_calls: Cell<usize>,
    }

    impl FakeQuery {
        pub(crate) fn new(devices: impl IntoIterator<Item = FakeDevice>) -> FakeQuery {
            FakeQuery {
                devices: devices
                    .into_iter()
                    .enumerate()
                    .map(|(i, device)| (i as u64 + 1, device))
                    .collect(),
                surface_support_calls: Cell::new(0),
            }
        }

        pub(crate) fn physical_devices(&self) -> Vec<vk::PhysicalDevice> {
            let mut handles: Vec<_> = self.devices.keys().copied().collect();
            handles.sort_unstable();
            handles.into_iter().map(vk::PhysicalDevice::from_raw).collect()
        }

        fn device(&self, physical_device: vk::PhysicalDevice) -> &FakeDevice {
            &self.devices[&physical_device.as_raw()]
        }
    }

    impl DeviceQuery for FakeQuery {
        fn properties(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceProperties {
            let device = self.device(physical_device);
            vk::PhysicalDeviceProperties {
                device_type: device.device_type,
                limits: vk::PhysicalDeviceLimits {
                    max_image_dimension2_d: device.max_image_dimension_2d,
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        fn features(&self, physical_device: vk::PhysicalDevice) -> vk::PhysicalDeviceFeatures {
            vk::PhysicalDeviceFeatures {
                geometry_shader: self.device(physical_device).geometry_shader.into(),
                ..Default::default()
            }
        }

        fn queue_family_properties(
            &self,
            physical_device: vk::PhysicalDevice,
        ) -> Vec<vk::QueueFamilyProperties> {
            self.device(physical_device)
                .queue_families
                .iter()
                .map(|&(queue_flags, _)| vk::QueueFamilyProperties {
                    queue_flags,
                    queue_count: 1,
                    ..Default::default()
                })
                .collect()
        }

        fn surface_support(
            &self,
            physical_device: vk::PhysicalDevice,
            queue_family_index: u32,
        ) -> VkResult<bool> {
            self.surface_support_calls
                .set(self.surface_support_calls.get() + 1);
            Ok(self.device(physical_device).queue_families[queue_family_index as usize].1)
        }

        fn extension_names(&self, physical_device: vk::PhysicalDevice) -> VkResult<Vec<CString>> {
            Ok(self.device(physical_device).extensions.clone())
        }

        fn surface_capabilities(
            &self,
            _physical_device: vk::PhysicalDevice,
        ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
            Ok(vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                ..Default::default()
            })
        }

        fn surface_formats(
            &self,
            physical_device: vk::PhysicalDevice,
        ) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
            Ok(self.device(physical_device).formats.clone())
        }

        fn surface_present_modes(
            &self,
            physical_device: vk::PhysicalDevice,
        ) -> VkResult<Vec<vk::PresentModeKHR>> {
            Ok(self.device(physical_device).present_modes.clone())
        }
    }

    #[test]
    fn extension_support_is_a_subset_check() {
        let swapchain = cstr!("VK_KHR_swapchain");
        let maintenance = cstr!("VK_KHR_maintenance1");
        let none: [&CStr; 0] = [];

        assert!(check_extension_support(&none, &none));
        assert!(check_extension_support(&none, &[swapchain]));
        assert!(check_extension_support(&[swapchain], &[maintenance, swapchain]));
        assert!(!check_extension_support(&[swapchain, maintenance], &[swapchain]));
        assert!(!check_extension_support(&[swapchain], &[cstr!("vk_khr_swapchain")]));
    }

    #[test]
    fn queue_families_take_first_match_per_role() {
        let device = FakeDevice {
            queue_families: vec![
                (vk::QueueFlags::TRANSFER, false),
                (vk::QueueFlags::GRAPHICS, false),
                (vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false),
                (vk::QueueFlags::COMPUTE, true),
                (vk::QueueFlags::GRAPHICS, true),
            ],
            ..FakeDevice::discrete()
        };
        let query = FakeQuery::new([device]);
        let indices = find_queue_families(&query, query.physical_devices()[0]).unwrap();

        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(3));
        assert!(indices.is_complete());
        // Scanning stops after family 3.
        assert_eq!(query.surface_support_calls.get(), 4);
    }

    #[test]
    fn queue_families_may_be_incomplete() {
        let device = FakeDevice {
            queue_families: vec![(vk::QueueFlags::COMPUTE, true)],
            ..FakeDevice::discrete()
        };
        let query = FakeQuery::new([device]);
        let indices = find_queue_families(&query, query.physical_devices()[0]).unwrap();

        assert_eq!(indices.graphics_family, None);
        assert_eq!(indices.present_family, Some(0));
        assert!(!indices.is_complete());
        assert_eq!(indices.complete(), None);
    }

    #[test]
    fn probe_skips_swapchain_query_without_extension() {
        let device = FakeDevice {
            extensions: Vec::new(),
            ..FakeDevice::discrete()
        };
        let query = FakeQuery::new([device]);
        let probe = probe_device(
            &query,
            query.physical_devices()[0],
            &[cstr!("VK_KHR_swapchain")],
        )
        .unwrap();

        assert!(!probe.extensions_supported);
        assert!(!probe.swapchain_support.is_adequate());
    }

    #[test]
    fn swapchain_adequacy_needs_formats_and_present_modes() {
        let mut support = SwapchainSupport {
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(support.is_adequate());

        support.present_modes.clear();
        assert!(!support.is_adequate());

        support.present_modes.push(vk::PresentModeKHR::FIFO);
        support.formats.clear();
        assert!(!support.is_adequate());
    }
}
