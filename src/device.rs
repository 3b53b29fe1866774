//! Device selection and creation utils.
use crate::{
    probe::{probe_device, DeviceProbe, DeviceQuery, SurfaceQuery},
    queue::{QueueSetup, Queues, ResolvedQueueFamilies},
    BootstrapSmallVec, InstanceMetadata,
};
use ash::extensions::khr::{self, Surface};
use ash::{vk, Device, Instance};
use std::{
    borrow::Cow,
    ffi::{CStr, CString},
    fmt, mem,
    os::raw::c_char,
    slice,
};
use thiserror::Error;

/// Errors that can occur during device selection and creation.
#[derive(Debug, Error)]
pub enum DeviceCreationError {
    /// Vulkan Error.
    #[error("vulkan error")]
    VulkanError(#[from] vk::Result),
    /// The instance reports no physical devices.
    #[error("no physical devices with vulkan support")]
    NoPhysicalDevices,
    /// No physical device met the requirements.
    #[error("no physical device met the requirements")]
    RequirementsNotMet,
}

/// Rating of a physical device. Zero means the device is unsuitable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceScore(pub u64);

impl DeviceScore {
    /// Score of a device that can't be used.
    pub const UNSUITABLE: DeviceScore = DeviceScore(0);

    /// Bonus for discrete GPUs.
    pub const DISCRETE_GPU_BONUS: u64 = 1000;

    /// Bonus for covering both the graphics and presentation roles.
    pub const COMPLETE_QUEUES_BONUS: u64 = 10;

    /// Returns true unless the score is zero.
    #[inline]
    pub fn is_suitable(self) -> bool {
        self != DeviceScore::UNSUITABLE
    }
}

impl fmt::Display for DeviceScore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

fn features_as_slice(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    // SAFETY: `VkPhysicalDeviceFeatures` is a `repr(C)` struct made up
    // entirely of `VkBool32` fields.
    unsafe {
        slice::from_raw_parts(
            (features as *const vk::PhysicalDeviceFeatures).cast::<vk::Bool32>(),
            mem::size_of::<vk::PhysicalDeviceFeatures>() / mem::size_of::<vk::Bool32>(),
        )
    }
}

/// Returns true if every feature enabled in `required` is enabled in
/// `supported`.
pub fn supports_features(
    supported: &vk::PhysicalDeviceFeatures,
    required: &vk::PhysicalDeviceFeatures,
) -> bool {
    features_as_slice(supported)
        .iter()
        .zip(features_as_slice(required))
        .all(|(&supported, &required)| required == vk::FALSE || supported != vk::FALSE)
}

/// Scores a probed device.
///
/// Discrete GPUs get [`DeviceScore::DISCRETE_GPU_BONUS`], complete queue
/// families get [`DeviceScore::COMPLETE_QUEUES_BONUS`], and the maximum 2D
/// image dimension breaks ties within a class. Devices missing a required
/// feature, a required extension, swapchain support or one of the queue
/// roles are [`DeviceScore::UNSUITABLE`].
pub fn score_device(
    probe: &DeviceProbe,
    required_features: &vk::PhysicalDeviceFeatures,
) -> DeviceScore {
    if !supports_features(&probe.features, required_features)
        || !probe.extensions_supported
        || !probe.swapchain_support.is_adequate()
        || !probe.queue_families.is_complete()
    {
        return DeviceScore::UNSUITABLE;
    }

    let mut score = 0;
    if probe.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
        score += DeviceScore::DISCRETE_GPU_BONUS;
    }

    if probe.queue_families.is_complete() {
        score += DeviceScore::COMPLETE_QUEUES_BONUS;
    }

    score += u64::from(probe.properties.limits.max_image_dimension2_d);
    DeviceScore(score)
}

/// Returns the highest scoring candidate. Of equally scored candidates the
/// last one wins. Returns `None` if there are no candidates.
pub fn pick_best<T>(
    candidates: impl IntoIterator<Item = (T, DeviceScore)>,
) -> Option<(T, DeviceScore)> {
    candidates
        .into_iter()
        .fold(None, |best, (candidate, score)| match best {
            Some((_, best_score)) if best_score > score => best,
            _ => Some((candidate, score)),
        })
}

/// What a physical device must provide to be selected.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Device extensions which must be supported. They will be enabled.
    pub extensions: BootstrapSmallVec<CString>,
    /// Core features which must be supported. They will be enabled.
    pub features: vk::PhysicalDeviceFeatures,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        DeviceRequirements {
            extensions: BootstrapSmallVec::from_iter([khr::Swapchain::name().to_owned()]),
            features: vk::PhysicalDeviceFeatures {
                geometry_shader: vk::TRUE,
                ..Default::default()
            },
        }
    }
}

/// A physical device chosen by [`select_physical_device`].
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    /// Probe results of the device.
    pub probe: DeviceProbe,
    /// Score of the device.
    pub score: DeviceScore,
    /// Queue families for the graphics and presentation roles.
    pub queue_families: ResolvedQueueFamilies,
}

impl SelectedDevice {
    /// The selected physical device.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.probe.physical_device
    }
}

/// Probes and scores every device in `physical_devices` and returns the
/// best one.
pub fn select_physical_device(
    query: &impl DeviceQuery,
    physical_devices: &[vk::PhysicalDevice],
    requirements: &DeviceRequirements,
) -> Result<SelectedDevice, DeviceCreationError> {
    if physical_devices.is_empty() {
        return Err(DeviceCreationError::NoPhysicalDevices);
    }

    let mut candidates = Vec::with_capacity(physical_devices.len());
    for &physical_device in physical_devices {
        let probe = probe_device(query, physical_device, requirements.extensions.as_slice())?;
        let score = score_device(&probe, &requirements.features);
        tracing::debug!(
            device = %probe.device_name(),
            device_type = ?probe.properties.device_type,
            %score,
            "rated physical device"
        );
        candidates.push((probe, score));
    }

    match pick_best(candidates) {
        Some((probe, score)) if score.is_suitable() => {
            let queue_families = probe
                .queue_families
                .complete()
                .ok_or(DeviceCreationError::RequirementsNotMet)?;

            Ok(SelectedDevice {
                probe,
                score,
                queue_families,
            })
        }
        _ => Err(DeviceCreationError::RequirementsNotMet),
    }
}

/// Metadata for after device creation.
#[derive(Debug, Clone)]
pub struct DeviceMetadata {
    device_handle: vk::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    enabled_features: vk::PhysicalDeviceFeatures,
    score: DeviceScore,
    queue_families: ResolvedQueueFamilies,
    queue_setups: BootstrapSmallVec<QueueSetup>,
    surface: vk::SurfaceKHR,
    enabled_extensions: BootstrapSmallVec<CString>,
}

impl DeviceMetadata {
    /// The device this metadata belongs to.
    #[inline]
    pub fn device_handle(&self) -> vk::Device {
        self.device_handle
    }

    /// The physical device this device belongs to.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The surface this device was selected for.
    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Properties of the physical device.
    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Name of the physical device.
    #[inline]
    pub fn device_name(&self) -> Cow<str> {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()).to_string_lossy() }
    }

    /// Type of the physical device.
    #[inline]
    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.properties.device_type
    }

    /// The score which got this device selected.
    #[inline]
    pub fn score(&self) -> DeviceScore {
        self.score
    }

    /// Features enabled on the device.
    #[inline]
    pub fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    /// Queue families for the graphics and presentation roles.
    #[inline]
    pub fn queue_families(&self) -> ResolvedQueueFamilies {
        self.queue_families
    }

    /// Returns the graphics and presentation queues. They are the same
    /// queue if both roles share a family.
    #[inline]
    pub fn queues(&self, device: &Device) -> Queues {
        assert_eq!(device.handle(), self.device_handle);
        self.queue_families
            .fetch_queues(|family, index| unsafe { device.get_device_queue(family, index) })
    }

    /// The queue setups which are in use.
    #[inline]
    pub fn queue_setups(&self) -> &[QueueSetup] {
        &self.queue_setups
    }

    /// List of all enabled extensions in the device.
    #[inline]
    pub fn enabled_extensions(&self) -> &[CString] {
        &self.enabled_extensions
    }

    /// Returns true if `extension` is enabled.
    #[inline]
    pub unsafe fn is_extension_enabled(&self, extension: *const c_char) -> bool {
        let qry = CStr::from_ptr(extension);
        self.enabled_extensions.iter().any(|i| i.as_c_str() == qry)
    }
}

/// Selects a physical device for a surface and creates an [`ash::Device`]
/// with its queues.
pub struct DeviceBuilder {
    surface: Option<vk::SurfaceKHR>,
    requirements: DeviceRequirements,
    allocator: Option<vk::AllocationCallbacks>,
}

impl DeviceBuilder {
    /// Create a new device builder requiring `VK_KHR_swapchain` and geometry
    /// shaders.
    #[inline]
    pub fn new() -> Self {
        DeviceBuilder::with_requirements(DeviceRequirements::default())
    }

    /// Create a new device builder with custom requirements.
    #[inline]
    pub fn with_requirements(requirements: DeviceRequirements) -> Self {
        DeviceBuilder {
            surface: None,
            requirements,
            allocator: None,
        }
    }

    /// Surface to check presentation and swapchain support against.
    #[inline]
    pub fn for_surface(mut self, surface: vk::SurfaceKHR) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Require a device which supports `extension`.
    /// The extension will be enabled.
    #[inline]
    pub fn require_extension(mut self, extension: &CStr) -> Self {
        if !self
            .requirements
            .extensions
            .iter()
            .any(|enabled| enabled.as_c_str() == extension)
        {
            self.requirements.extensions.push(extension.to_owned());
        }

        self
    }

    /// Require these features to be present for the device.
    /// The features will be enabled.
    #[inline]
    pub fn require_features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.requirements.features = features;
        self
    }

    /// Allocation callback to use for internal Vulkan calls in the builder.
    #[inline]
    pub fn allocation_callbacks(mut self, allocator: vk::AllocationCallbacks) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// The requirements a device has to meet.
    #[inline]
    pub fn requirements(&self) -> &DeviceRequirements {
        &self.requirements
    }

    /// Enumerates the physical devices of `instance` and selects the best
    /// one for the surface.
    ///
    /// # Panics
    ///
    /// Panics if no surface was set with [`for_surface`](Self::for_surface).
    pub unsafe fn select(
        &self,
        instance: &Instance,
        surface_loader: &Surface,
    ) -> Result<SelectedDevice, DeviceCreationError> {
        let surface = self
            .surface
            .expect("DeviceBuilder::for_surface must be called before selection");
        let physical_devices = instance.enumerate_physical_devices()?;
        let query = SurfaceQuery::new(instance, surface_loader, surface);
        select_physical_device(&query, &physical_devices, &self.requirements)
    }

    /// Creates the logical device for `selected`, enabling the required
    /// extensions and features, with one queue per distinct queue family.
    pub unsafe fn create(
        &self,
        instance: &Instance,
        instance_metadata: &InstanceMetadata,
        selected: SelectedDevice,
    ) -> Result<(Device, DeviceMetadata), DeviceCreationError> {
        assert_eq!(instance.handle(), instance_metadata.instance_handle());

        let queue_setups = selected.queue_families.queue_setups();
        let queue_create_infos: BootstrapSmallVec<_> = queue_setups
            .iter()
            .map(QueueSetup::as_vulkan)
            .map(|x| x.build())
            .collect();

        let extension_names: BootstrapSmallVec<_> = self
            .requirements
            .extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        // Device layers are deprecated, but older implementations still
        // expect them to match the instance layers.
        let layer_names: BootstrapSmallVec<_> = instance_metadata
            .enabled_layers()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .enabled_features(&self.requirements.features);

        let device = instance.create_device(
            selected.physical_device(),
            &device_info,
            self.allocator.as_ref(),
        )?;

        drop(queue_create_infos);
        let device_metadata = DeviceMetadata {
            device_handle: device.handle(),
            physical_device: selected.physical_device(),
            properties: selected.probe.properties,
            enabled_features: self.requirements.features,
            score: selected.score,
            queue_families: selected.queue_families,
            queue_setups,
            surface: self.surface.unwrap_or_default(),
            enabled_extensions: self.requirements.extensions.clone(),
        };

        Ok((device, device_metadata))
    }

    /// Returns the [`ash::Device`] and [`DeviceMetadata`], containing
    /// the handle of the used physical device handle and its properties, as
    /// wells as the enabled device extensions and used queue setups.
    pub unsafe fn build(
        &self,
        instance: &Instance,
        surface_loader: &Surface,
        instance_metadata: &InstanceMetadata,
    ) -> Result<(Device, DeviceMetadata), DeviceCreationError> {
        let selected = self.select(instance, surface_loader)?;
        self.create(instance, instance_metadata, selected)
    }
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::{FakeDevice, FakeQuery};

    fn select(devices: Vec<FakeDevice>) -> Result<SelectedDevice, DeviceCreationError> {
        let query = FakeQuery::new(devices);
        select_physical_device(
            &query,
            &query.physical_devices(),
            &DeviceRequirements::default(),
        )
    }

    #[test]
    fn discrete_gpu_is_preferred() {
        let selected = select(vec![FakeDevice::integrated(), FakeDevice::discrete()]).unwrap();

        assert_eq!(
            selected.probe.properties.device_type,
            vk::PhysicalDeviceType::DISCRETE_GPU
        );
        assert!(selected.score >= DeviceScore(1010));
        assert_eq!(selected.score, DeviceScore(1000 + 10 + 16384));
    }

    #[test]
    fn integrated_gpu_with_huge_limits_still_loses() {
        let integrated = FakeDevice {
            max_image_dimension_2d: 900,
            ..FakeDevice::integrated()
        };
        let discrete = FakeDevice {
            max_image_dimension_2d: 1,
            ..FakeDevice::discrete()
        };
        let selected = select(vec![integrated, discrete]).unwrap();
        assert_eq!(
            selected.probe.properties.device_type,
            vk::PhysicalDeviceType::DISCRETE_GPU
        );
    }

    #[test]
    fn max_image_dimension_breaks_ties_within_class() {
        let small = FakeDevice {
            max_image_dimension_2d: 4096,
            ..FakeDevice::discrete()
        };
        let large = FakeDevice {
            max_image_dimension_2d: 32768,
            ..FakeDevice::discrete()
        };
        let selected = select(vec![large, small]).unwrap();
        assert_eq!(selected.score, DeviceScore(1010 + 32768));
    }

    #[test]
    fn missing_geometry_shader_is_unsuitable() {
        let devices = vec![
            FakeDevice {
                geometry_shader: false,
                ..FakeDevice::discrete()
            },
            FakeDevice {
                geometry_shader: false,
                ..FakeDevice::integrated()
            },
        ];

        assert!(matches!(
            select(devices),
            Err(DeviceCreationError::RequirementsNotMet)
        ));
    }

    #[test]
    fn unsuitable_discrete_gpu_falls_back_to_integrated() {
        let discrete = FakeDevice {
            extensions: Vec::new(),
            ..FakeDevice::discrete()
        };
        let selected = select(vec![discrete, FakeDevice::integrated()]).unwrap();
        assert_eq!(
            selected.probe.properties.device_type,
            vk::PhysicalDeviceType::INTEGRATED_GPU
        );
        assert_eq!(selected.score, DeviceScore(10 + 8192));
    }

    #[test]
    fn inadequate_swapchain_support_is_unsuitable() {
        let no_formats = FakeDevice {
            formats: Vec::new(),
            ..FakeDevice::discrete()
        };
        let no_present_modes = FakeDevice {
            present_modes: Vec::new(),
            ..FakeDevice::discrete()
        };

        assert!(matches!(
            select(vec![no_formats, no_present_modes]),
            Err(DeviceCreationError::RequirementsNotMet)
        ));
    }

    #[test]
    fn incomplete_queue_families_are_unsuitable() {
        let no_present = FakeDevice {
            queue_families: vec![(vk::QueueFlags::GRAPHICS, false)],
            ..FakeDevice::discrete()
        };

        assert!(matches!(
            select(vec![no_present]),
            Err(DeviceCreationError::RequirementsNotMet)
        ));
    }

    #[test]
    fn empty_device_list_is_reported() {
        assert!(matches!(
            select(Vec::new()),
            Err(DeviceCreationError::NoPhysicalDevices)
        ));
    }

    #[test]
    fn selection_resolves_split_queue_families() {
        let split = FakeDevice {
            queue_families: vec![
                (vk::QueueFlags::GRAPHICS, false),
                (vk::QueueFlags::COMPUTE, true),
            ],
            ..FakeDevice::discrete()
        };
        let selected = select(vec![split]).unwrap();
        assert_eq!(
            selected.queue_families,
            ResolvedQueueFamilies {
                graphics: 0,
                present: 1,
            }
        );
    }

    #[test]
    fn pick_best_prefers_last_of_equal_scores() {
        let picked = pick_best([
            ("a", DeviceScore(5)),
            ("b", DeviceScore(7)),
            ("c", DeviceScore(7)),
            ("d", DeviceScore(3)),
        ]);
        assert_eq!(picked, Some(("c", DeviceScore(7))));
        assert_eq!(pick_best(Vec::<((), DeviceScore)>::new()), None);
    }

    #[test]
    fn feature_check_only_considers_required_features() {
        let required = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        let supported = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };

        assert!(supports_features(&supported, &required));
        assert!(!supports_features(&required, &supported));
        assert!(supports_features(
            &vk::PhysicalDeviceFeatures::default(),
            &vk::PhysicalDeviceFeatures::default()
        ));
    }

    #[test]
    fn require_extension_deduplicates() {
        let builder = DeviceBuilder::new()
            .require_extension(khr::Swapchain::name())
            .require_extension(cstr::cstr!("VK_KHR_maintenance1"));
        assert_eq!(builder.requirements().extensions.len(), 2);
    }
}
