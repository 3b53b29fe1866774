//! Swapchain negotiation and creation.
//!
//! The swapchain is created once and is not rebuilt when the window is
//! resized or the surface goes out of date.

use crate::{queue::ResolvedQueueFamilies, BootstrapSmallVec, SwapchainSupport};
use ash::extensions::khr;
use ash::{vk, Device, Instance};
use thiserror::Error;

/// Errors that can occur during swapchain creation.
#[derive(Debug, Error)]
pub enum SwapchainCreationError {
    /// Vulkan Error.
    #[error("vulkan error")]
    VulkanError(#[from] vk::Result),
    /// The surface reports no formats or no present modes.
    #[error("inadequate swapchain support (formats: {formats}, present modes: {present_modes})")]
    InadequateSupport {
        /// Number of reported surface formats.
        formats: usize,
        /// Number of reported present modes.
        present_modes: usize,
    },
}

/// [`Swapchain`] configuration
#[derive(Debug, Clone)]
pub struct SwapchainOptions {
    format_preference: Vec<vk::SurfaceFormatKHR>,
    present_mode_preference: Vec<vk::PresentModeKHR>,
    usage: vk::ImageUsageFlags,
    composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainOptions {
    /// Uses the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preference-ordered list of image formats and color spaces. Defaults to
    /// 8-bit BGRA sRGB. The first supported format is used if none match.
    pub fn format_preference(&mut self, formats: &[vk::SurfaceFormatKHR]) -> &mut Self {
        self.format_preference = formats.into();
        self
    }

    /// Preference-ordered list of presentation modes. Defaults to
    /// [`vk::PresentModeKHR::MAILBOX`]. [`vk::PresentModeKHR::FIFO`] is used
    /// if none match.
    pub fn present_mode_preference(&mut self, modes: &[vk::PresentModeKHR]) -> &mut Self {
        self.present_mode_preference = modes.into();
        self
    }

    /// Required swapchain image usage flags. Defaults to [`vk::ImageUsageFlags::COLOR_ATTACHMENT`].
    pub fn usage(&mut self, usage: vk::ImageUsageFlags) -> &mut Self {
        self.usage = usage;
        self
    }

    /// Requires swapchain image composite alpha. Defaults to [`vk::CompositeAlphaFlagsKHR::OPAQUE`].
    pub fn composite_alpha(&mut self, value: vk::CompositeAlphaFlagsKHR) -> &mut Self {
        self.composite_alpha = value;
        self
    }
}

impl Default for SwapchainOptions {
    fn default() -> Self {
        Self {
            format_preference: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_mode_preference: vec![vk::PresentModeKHR::MAILBOX],
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        }
    }
}

/// Picks the most preferred supported format, falling back to the first
/// supported one. Returns `None` if `formats` is empty.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preference: &[vk::SurfaceFormatKHR],
) -> Option<vk::SurfaceFormatKHR> {
    preference
        .iter()
        .find(|&preferred| formats.contains(preferred))
        .or_else(|| formats.first())
        .copied()
}

/// Picks the most preferred supported present mode, falling back to FIFO,
/// which every implementation must support.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preference: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    preference
        .iter()
        .copied()
        .find(|preferred| present_modes.contains(preferred))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Uses the surface's current extent, or `window` clamped into the
/// supported bounds if the surface leaves the choice to the application.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window: vk::Extent2D,
) -> vk::Extent2D {
    match capabilities.current_extent.width {
        u32::MAX => vk::Extent2D {
            width: window.width.clamp(
                capabilities.min_image_extent.width,
                capabilities
                    .max_image_extent
                    .width
                    .max(capabilities.min_image_extent.width),
            ),
            height: window.height.clamp(
                capabilities.min_image_extent.height,
                capabilities
                    .max_image_extent
                    .height
                    .max(capabilities.min_image_extent.height),
            ),
        },
        _ => capabilities.current_extent,
    }
}

/// One image more than the minimum, capped at the maximum. A maximum of 0
/// means there is no limit.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired_image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        capabilities.max_image_count.min(desired_image_count)
    } else {
        desired_image_count
    }
}

/// The negotiated swapchain parameters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainConfig {
    /// Image format and color space.
    pub format: vk::SurfaceFormatKHR,
    /// Presentation mode.
    pub present_mode: vk::PresentModeKHR,
    /// Image dimensions.
    pub extent: vk::Extent2D,
    /// Minimum number of images requested from the driver.
    pub image_count: u32,
    /// Transform applied before presentation.
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainSupport {
    /// Negotiates swapchain parameters for a window of size `window`.
    pub fn negotiate(
        &self,
        options: &SwapchainOptions,
        window: vk::Extent2D,
    ) -> Result<SwapchainConfig, SwapchainCreationError> {
        let inadequate = || SwapchainCreationError::InadequateSupport {
            formats: self.formats.len(),
            present_modes: self.present_modes.len(),
        };

        if !self.is_adequate() {
            return Err(inadequate());
        }

        let format =
            choose_surface_format(&self.formats, &options.format_preference).ok_or_else(inadequate)?;

        Ok(SwapchainConfig {
            format,
            present_mode: choose_present_mode(&self.present_modes, &options.present_mode_preference),
            extent: choose_extent(&self.capabilities, window),
            image_count: choose_image_count(&self.capabilities),
            pre_transform: self.capabilities.current_transform,
        })
    }
}

/// A created swapchain and its images.
#[derive(Clone)]
pub struct Swapchain {
    loader: khr::Swapchain,
    handle: vk::SwapchainKHR,
    images: BootstrapSmallVec<vk::Image>,
    config: SwapchainConfig,
}

impl Swapchain {
    /// Negotiates parameters from `support` and creates the swapchain for
    /// `surface`.
    ///
    /// # Safety
    ///
    /// `device` must have been created from `instance` with the
    /// `VK_KHR_swapchain` extension enabled, and `surface` must be a live
    /// surface of `instance` that `queue_families` can present to.
    pub unsafe fn new(
        instance: &Instance,
        device: &Device,
        surface: vk::SurfaceKHR,
        queue_families: ResolvedQueueFamilies,
        support: &SwapchainSupport,
        options: &SwapchainOptions,
        window: vk::Extent2D,
    ) -> Result<Self, SwapchainCreationError> {
        let config = support.negotiate(options, window)?;
        let (sharing_mode, queue_family_indices) = queue_families.sharing();

        let loader = khr::Swapchain::new(instance, device);
        let handle = loader.create_swapchain(
            &vk::SwapchainCreateInfoKHR::builder()
                .surface(surface)
                .min_image_count(config.image_count)
                .image_format(config.format.format)
                .image_color_space(config.format.color_space)
                .image_extent(config.extent)
                .image_array_layers(1)
                .image_usage(options.usage)
                .image_sharing_mode(sharing_mode)
                .queue_family_indices(&queue_family_indices)
                .pre_transform(config.pre_transform)
                .composite_alpha(options.composite_alpha)
                .present_mode(config.present_mode)
                .clipped(true)
                .old_swapchain(vk::SwapchainKHR::null()),
            None,
        )?;

        let images = match loader.get_swapchain_images(handle) {
            Ok(images) => images.into_iter().collect(),
            Err(err) => {
                loader.destroy_swapchain(handle, None);
                return Err(err.into());
            }
        };

        Ok(Swapchain {
            loader,
            handle,
            images,
            config,
        })
    }

    /// Destroy the swapchain. Its images are released with it.
    ///
    /// # Safety
    ///
    /// The swapchain and its images must not be in use.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_swapchain(self.handle, None);
    }

    /// The swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// The `VK_KHR_swapchain` function loader.
    #[inline]
    pub fn loader(&self) -> &khr::Swapchain {
        &self.loader
    }

    /// Images owned by the swapchain. The driver may create more than
    /// [`SwapchainConfig::image_count`].
    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Format of images in [`images`](Self::images), and the color space that will be used to
    /// present them
    #[inline]
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.config.format
    }

    /// Dimensions of images in [`images`](Self::images)
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    /// All negotiated parameters.
    #[inline]
    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }
}
