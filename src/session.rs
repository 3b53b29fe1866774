//! Bootstrap orchestration: brings up every Vulkan object in order and
//! tears them down in reverse.
use crate::{
    install_debug_messenger, query_swapchain_support, BootstrapConfig, BootstrapSmallVec,
    DeviceBuilder, DeviceCreationError, DeviceMetadata, InstanceBuilder, InstanceCreationError,
    InstanceMetadata, Queues, SurfaceQuery, Swapchain, SwapchainCreationError,
};
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::{prelude::VkResult, vk, Device, Entry, Instance};
#[cfg(feature = "surface")]
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::{ffi::CString, fmt, os::raw::c_char};
use thiserror::Error;

/// Errors that can occur while bootstrapping a [`Session`].
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The Vulkan library could not be loaded.
    #[error("failed to load the vulkan library")]
    Loading(#[from] ash::LoadingError),
    /// Validation layers are required but not installed.
    #[error("validation layers requested, but not available: {0:?}")]
    ValidationLayerUnavailable(BootstrapSmallVec<CString>),
    /// Instance creation failed.
    #[error("failed to create instance")]
    InstanceCreationFailed(#[source] InstanceCreationError),
    /// The debug messenger could not be installed.
    #[error("failed to set up debug messenger")]
    DebugHookInstallFailed(#[source] vk::Result),
    /// The window surface could not be created.
    #[error("failed to create window surface")]
    SurfaceCreationFailed(#[source] vk::Result),
    /// The instance reports no physical devices.
    #[error("failed to find GPUs with Vulkan support")]
    NoVulkanCapableDeviceFound,
    /// No physical device met the requirements.
    #[error("failed to find a suitable GPU")]
    NoSuitableDevice,
    /// Logical device creation failed.
    #[error("failed to create logical device")]
    DeviceCreationFailed(#[source] DeviceCreationError),
    /// Swapchain creation failed.
    #[error("failed to create swap chain")]
    SwapchainCreationFailed(#[from] SwapchainCreationError),
}

impl From<InstanceCreationError> for BootstrapError {
    fn from(err: InstanceCreationError) -> Self {
        match err {
            InstanceCreationError::LayersNotPresent(layers) => {
                BootstrapError::ValidationLayerUnavailable(layers)
            }
            err => BootstrapError::InstanceCreationFailed(err),
        }
    }
}

impl From<DeviceCreationError> for BootstrapError {
    fn from(err: DeviceCreationError) -> Self {
        match err {
            DeviceCreationError::NoPhysicalDevices => BootstrapError::NoVulkanCapableDeviceFound,
            DeviceCreationError::RequirementsNotMet => BootstrapError::NoSuitableDevice,
            err => BootstrapError::DeviceCreationFailed(err),
        }
    }
}

/// Lifecycle of a [`Session`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing has been created yet.
    Uninitialized,
    /// The instance exists.
    InstanceCreated,
    /// The debug messenger is installed. Skipped when it is disabled or
    /// unavailable.
    DebugHookInstalled,
    /// The window surface exists.
    SurfaceBound,
    /// A physical device was chosen.
    DeviceSelected,
    /// The logical device and its queues exist.
    LogicalDeviceReady,
    /// The swapchain and its images exist.
    SwapchainReady,
    /// Everything is up.
    Running,
    /// Everything was released.
    TornDown,
}

impl SessionState {
    /// Returns true if `next` directly follows `self`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, InstanceCreated)
                | (InstanceCreated, DebugHookInstalled)
                | (InstanceCreated | DebugHookInstalled, SurfaceBound)
                | (SurfaceBound, DeviceSelected)
                | (DeviceSelected, LogicalDeviceReady)
                | (LogicalDeviceReady, SwapchainReady)
                | (SwapchainReady, Running)
                | (Running, TornDown)
        )
    }

    fn advance(&mut self, next: SessionState) {
        assert!(
            self.can_advance_to(next),
            "illegal session transition {:?} -> {:?}",
            self,
            next
        );
        tracing::info!(from = ?*self, to = ?next, "session state changed");
        *self = next;
    }
}

/// Release actions for acquired resources, run in reverse order of
/// acquisition. Runs on drop if not released earlier.
#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<(&'static str, Box<dyn FnOnce()>)>,
}

impl TeardownStack {
    /// Create an empty stack.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers how to release the resource called `name`.
    #[inline]
    pub fn push(&mut self, name: &'static str, release: impl FnOnce() + 'static) {
        self.entries.push((name, Box::new(release)));
    }

    /// Number of resources not yet released.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is left to release.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the held resources, in acquisition order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|&(name, _)| name)
    }

    /// Releases every resource, last acquired first.
    pub fn release_all(&mut self) {
        while let Some((name, release)) = self.entries.pop() {
            tracing::debug!(resource = name, "releasing");
            release();
        }
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for TeardownStack {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_list().entries(self.names()).finish()
    }
}

/// A window bound to a logical device with a ready swapchain.
///
/// All objects are owned by the session and released in reverse order of
/// creation by [`destroy`](Self::destroy) or on drop.
pub struct Session {
    entry: Entry,
    instance: Instance,
    instance_metadata: InstanceMetadata,
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    device: Device,
    device_metadata: DeviceMetadata,
    queues: Queues,
    swapchain: Swapchain,
    config: BootstrapConfig,
    state: SessionState,
    teardown: TeardownStack,
}

impl Session {
    /// Loads the Vulkan library and bootstraps a session for `window`.
    #[cfg(feature = "surface")]
    pub unsafe fn load(
        config: BootstrapConfig,
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
    ) -> Result<Self, BootstrapError> {
        let entry = Entry::load()?;
        Self::new(entry, config, window)
    }

    /// Bootstraps a session for `window`. The window must outlive the
    /// session.
    #[cfg(feature = "surface")]
    pub unsafe fn new(
        entry: Entry,
        config: BootstrapConfig,
        window: &(impl HasRawDisplayHandle + HasRawWindowHandle),
    ) -> Result<Self, BootstrapError> {
        let surface_extensions =
            ash_window::enumerate_required_extensions(window.raw_display_handle())
                .map_err(BootstrapError::SurfaceCreationFailed)?;

        Self::with_surface(entry, config, surface_extensions, |entry, instance| unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        })
    }

    /// Bootstraps a session, creating the surface through
    /// `create_surface`. `surface_extensions` are the instance extensions
    /// the surface needs.
    ///
    /// On failure every object created so far is released, last created
    /// first, before the error is returned.
    ///
    /// # Safety
    ///
    /// Every pointer in `surface_extensions` must point to a valid,
    /// nul-terminated string. `create_surface` must return a surface of
    /// the given instance.
    pub unsafe fn with_surface(
        entry: Entry,
        config: BootstrapConfig,
        surface_extensions: &[*const c_char],
        create_surface: impl FnOnce(&Entry, &Instance) -> VkResult<vk::SurfaceKHR>,
    ) -> Result<Self, BootstrapError> {
        let mut state = SessionState::Uninitialized;
        let mut teardown = TeardownStack::new();

        let (instance, instance_metadata) = InstanceBuilder::new()
            .app_name(&config.app_name)
            .and_then(|builder| builder.engine_name(&config.engine_name))
            .map_err(InstanceCreationError::from)?
            .app_version(1, 0)
            .engine_version(1, 0)
            .validation_layers(config.validation_layers)
            .request_debug_messenger(config.debug_messenger)
            .debug_message_severity(config.debug_message_severity)
            .require_extension_ptrs(surface_extensions)
            .build(&entry)?;
        {
            let instance = instance.clone();
            teardown.push("instance", move || unsafe {
                instance.destroy_instance(None)
            });
        }
        state.advance(SessionState::InstanceCreated);

        let debug_messenger = install_debug_messenger(&entry, &instance, &instance_metadata)
            .map_err(BootstrapError::DebugHookInstallFailed)?;
        if let Some((debug_utils, messenger)) = &debug_messenger {
            let (debug_utils, messenger) = (debug_utils.clone(), *messenger);
            teardown.push("debug messenger", move || unsafe {
                debug_utils.destroy_debug_utils_messenger(messenger, None)
            });
            state.advance(SessionState::DebugHookInstalled);
        } else if config.debug_enabled() {
            tracing::warn!("debug messenger requested, but VK_EXT_debug_utils is not available");
        }

        let surface_loader = Surface::new(&entry, &instance);
        let surface =
            create_surface(&entry, &instance).map_err(BootstrapError::SurfaceCreationFailed)?;
        {
            let surface_loader = surface_loader.clone();
            teardown.push("surface", move || unsafe {
                surface_loader.destroy_surface(surface, None)
            });
        }
        state.advance(SessionState::SurfaceBound);

        let device_builder =
            DeviceBuilder::with_requirements(config.device_requirements.clone()).for_surface(surface);
        let selected = device_builder.select(&instance, &surface_loader)?;
        tracing::info!(
            device = %selected.probe.device_name(),
            score = %selected.score,
            graphics_family = selected.queue_families.graphics,
            present_family = selected.queue_families.present,
            "selected physical device"
        );
        state.advance(SessionState::DeviceSelected);

        let (device, device_metadata) = device_builder
            .create(&instance, &instance_metadata, selected)
            .map_err(BootstrapError::DeviceCreationFailed)?;
        {
            let device = device.clone();
            teardown.push("logical device", move || unsafe { device.destroy_device(None) });
        }
        let queues = device_metadata.queues(&device);
        state.advance(SessionState::LogicalDeviceReady);

        // Surface properties may have changed since selection.
        let query = SurfaceQuery::new(&instance, &surface_loader, surface);
        let support = query_swapchain_support(&query, device_metadata.physical_device())
            .map_err(SwapchainCreationError::from)?;
        let swapchain = Swapchain::new(
            &instance,
            &device,
            surface,
            device_metadata.queue_families(),
            &support,
            &config.swapchain,
            config.window_extent,
        )?;
        {
            let swapchain = swapchain.clone();
            teardown.push("swapchain", move || unsafe { swapchain.destroy() });
        }
        tracing::info!(
            format = ?swapchain.format().format,
            present_mode = ?swapchain.config().present_mode,
            extent = ?swapchain.extent(),
            images = swapchain.images().len(),
            "created swapchain"
        );
        state.advance(SessionState::SwapchainReady);

        state.advance(SessionState::Running);
        Ok(Session {
            entry,
            instance,
            instance_metadata,
            debug_messenger,
            surface_loader,
            surface,
            device,
            device_metadata,
            queues,
            swapchain,
            config,
            state,
            teardown,
        })
    }

    /// Waits for the device to go idle and releases everything.
    pub fn destroy(mut self) {
        self.shut_down();
    }

    fn shut_down(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }

        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            tracing::warn!(%err, "failed to wait for device idle before teardown");
        }

        self.teardown.release_all();
        self.state.advance(SessionState::TornDown);
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The configuration the session was created with.
    #[inline]
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// The loaded Vulkan entry points.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The instance.
    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// What is enabled on the instance.
    #[inline]
    pub fn instance_metadata(&self) -> &InstanceMetadata {
        &self.instance_metadata
    }

    /// The installed debug messenger, if any.
    #[inline]
    pub fn debug_messenger(&self) -> Option<vk::DebugUtilsMessengerEXT> {
        self.debug_messenger.as_ref().map(|&(_, messenger)| messenger)
    }

    /// The `VK_KHR_surface` function loader.
    #[inline]
    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    /// The window surface.
    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// The logical device.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// What is enabled on the device and which physical device it uses.
    #[inline]
    pub fn device_metadata(&self) -> &DeviceMetadata {
        &self.device_metadata
    }

    /// The graphics and presentation queues.
    #[inline]
    pub fn queues(&self) -> Queues {
        self.queues
    }

    /// The swapchain.
    #[inline]
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shut_down();
    }
}
