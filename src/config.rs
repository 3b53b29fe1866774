//! Bootstrap configuration.
use crate::{DebugMessenger, DeviceRequirements, SwapchainOptions, ValidationLayers};
use ash::vk;
use std::ffi::{CStr, CString};

/// Everything the [`Session`](crate::Session) needs to know up front.
///
/// The defaults enable validation and the debug messenger in debug builds
/// only, require `VK_KHR_swapchain` and geometry shaders, and target an
/// 800x600 window.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub(crate) app_name: String,
    pub(crate) engine_name: String,
    pub(crate) validation_layers: ValidationLayers,
    pub(crate) debug_messenger: DebugMessenger,
    pub(crate) debug_message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    pub(crate) device_requirements: DeviceRequirements,
    pub(crate) window_extent: vk::Extent2D,
    pub(crate) swapchain: SwapchainOptions,
}

impl BootstrapConfig {
    /// Create a configuration with the defaults for the current build
    /// profile.
    pub fn new() -> Self {
        Self::default()
    }

    /// Application name to advertise.
    #[inline]
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Engine name to advertise.
    #[inline]
    pub fn engine_name(mut self, engine_name: impl Into<String>) -> Self {
        self.engine_name = engine_name.into();
        self
    }

    /// Whether the Khronos validation layer is required, requested or off.
    #[inline]
    pub fn validation_layers(mut self, validation_layers: ValidationLayers) -> Self {
        self.validation_layers = validation_layers;
        self
    }

    /// Debug messenger to install after instance creation.
    #[inline]
    pub fn debug_messenger(mut self, debug_messenger: DebugMessenger) -> Self {
        self.debug_messenger = debug_messenger;
        self
    }

    /// Severities forwarded to the debug messenger.
    #[inline]
    pub fn debug_message_severity(
        mut self,
        severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ) -> Self {
        self.debug_message_severity = severity;
        self
    }

    /// Require an additional device extension.
    #[inline]
    pub fn require_device_extension(mut self, extension: &CStr) -> Self {
        if !self
            .device_requirements
            .extensions
            .iter()
            .any(|enabled| enabled.as_c_str() == extension)
        {
            self.device_requirements.extensions.push(extension.to_owned());
        }

        self
    }

    /// Replace the required device features.
    #[inline]
    pub fn device_features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.device_requirements.features = features;
        self
    }

    /// Window size in pixels, used when the surface lets the application
    /// pick the swapchain extent.
    #[inline]
    pub fn window_extent(mut self, width: u32, height: u32) -> Self {
        self.window_extent = vk::Extent2D { width, height };
        self
    }

    /// Swapchain preferences.
    #[inline]
    pub fn swapchain(mut self, options: SwapchainOptions) -> Self {
        self.swapchain = options;
        self
    }

    /// The configured window size.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.window_extent
    }

    /// Device extensions a physical device must support.
    #[inline]
    pub fn device_extensions(&self) -> &[CString] {
        &self.device_requirements.extensions
    }

    /// Everything a physical device must provide.
    #[inline]
    pub fn device_requirements(&self) -> &DeviceRequirements {
        &self.device_requirements
    }

    /// Returns true if the debug messenger is configured.
    #[inline]
    pub fn debug_enabled(&self) -> bool {
        !matches!(self.debug_messenger, DebugMessenger::Disable)
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        let debug = cfg!(debug_assertions);
        BootstrapConfig {
            app_name: "Hello Triangle".to_owned(),
            engine_name: "No Engine".to_owned(),
            validation_layers: if debug {
                ValidationLayers::Require
            } else {
                ValidationLayers::Disable
            },
            debug_messenger: if debug {
                DebugMessenger::Default
            } else {
                DebugMessenger::Disable
            },
            debug_message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            device_requirements: DeviceRequirements::default(),
            window_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            swapchain: SwapchainOptions::default(),
        }
    }
}
