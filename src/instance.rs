//! Instance creation utils.
use crate::BootstrapSmallVec;
use ash::extensions::ext::DebugUtils;
use ash::{vk, Entry, Instance};
#[cfg(feature = "surface")]
use raw_window_handle::HasRawDisplayHandle;
use std::{
    ffi::{c_void, CStr, CString, NulError},
    fmt,
    os::raw::c_char,
    ptr,
};
use thiserror::Error;

/// Name of the Khronos validation layer.
pub const KHRONOS_VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Require, request or disable validation layers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValidationLayers {
    /// Instance creation will fail if there are no validation layers installed.
    Require,
    /// If there are validation layers installed, enable them.
    Request,
    /// Don't enable validation layers.
    Disable,
}

/// Signature of a debug messenger callback.
pub type DebugCallback = unsafe extern "system" fn(
    vk::DebugUtilsMessageSeverityFlagsEXT,
    vk::DebugUtilsMessageTypeFlagsEXT,
    *const vk::DebugUtilsMessengerCallbackDataEXT,
    *mut c_void,
) -> vk::Bool32;

/// Enable or disable the debug messenger, optionally providing a custom callback.
#[derive(Copy, Clone)]
pub enum DebugMessenger {
    /// Enables the debug messenger with the [`default_debug_callback`]
    /// callback.
    Default,
    /// Enables the debug messenger with a custom, user-provided callback.
    Custom {
        /// The user provided callback function. Feel free to take a look at the
        /// [`default_debug_callback`] when implementing your own.
        callback: DebugCallback,
        /// A user data pointer passed to the debug callback.
        user_data_pointer: *mut c_void,
    },
    /// Disables the debug messenger.
    Disable,
}

impl fmt::Debug for DebugMessenger {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DebugMessenger::Default => fmt.write_str("Default"),
            DebugMessenger::Custom {
                user_data_pointer, ..
            } => fmt
                .debug_struct("Custom")
                .field("user_data_pointer", user_data_pointer)
                .finish_non_exhaustive(),
            DebugMessenger::Disable => fmt.write_str("Disable"),
        }
    }
}

/// The default debug callback used in [`DebugMessenger::Default`].
///
/// Forwards the message to [`tracing`] at a level matching its severity.
/// Never asks for the triggering call to be aborted.
pub unsafe extern "system" fn default_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = match p_callback_data.as_ref() {
        Some(data) if !data.p_message.is_null() => CStr::from_ptr(data.p_message).to_string_lossy(),
        _ => return vk::FALSE,
    };

    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vk_boot::validation", ?message_type, "{message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vk_boot::validation", ?message_type, "{message}");
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::info!(target: "vk_boot::validation", ?message_type, "{message}");
    } else {
        tracing::trace!(target: "vk_boot::validation", ?message_type, "{message}");
    }

    vk::FALSE
}

#[derive(Copy, Clone)]
struct DebugMessengerSetup {
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    callback: DebugCallback,
    user_data: *mut c_void,
}

impl DebugMessengerSetup {
    fn create_info(&self) -> vk::DebugUtilsMessengerCreateInfoEXT {
        vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(self.severity)
            .message_type(self.ty)
            .pfn_user_callback(Some(self.callback))
            .user_data(self.user_data)
            .build()
    }
}

/// Metadata for after instance creation.
#[derive(Clone)]
pub struct InstanceMetadata {
    instance_handle: vk::Instance,
    api_version: u32,
    enabled_layers: BootstrapSmallVec<CString>,
    enabled_extensions: BootstrapSmallVec<CString>,
    debug_messenger: Option<DebugMessengerSetup>,
}

impl InstanceMetadata {
    /// The instance this metadata belongs to.
    #[inline]
    pub fn instance_handle(&self) -> vk::Instance {
        self.instance_handle
    }

    /// Retrieve the used instance API version.
    #[inline]
    pub fn api_version_raw(&self) -> u32 {
        self.api_version
    }

    /// Retrieve the used instance API major version.
    #[inline]
    pub fn api_version_major(&self) -> u32 {
        vk::api_version_major(self.api_version)
    }

    /// Retrieve the used instance API minor version.
    #[inline]
    pub fn api_version_minor(&self) -> u32 {
        vk::api_version_minor(self.api_version)
    }

    /// List of all enabled layers in the instance.
    #[inline]
    pub fn enabled_layers(&self) -> &[CString] {
        &self.enabled_layers
    }

    /// Returns true if `layer` is enabled.
    #[inline]
    pub fn is_layer_enabled(&self, layer: &CStr) -> bool {
        self.enabled_layers.iter().any(|e| e.as_c_str() == layer)
    }

    /// List of all enabled extensions in the instance.
    #[inline]
    pub fn enabled_extensions(&self) -> &[CString] {
        &self.enabled_extensions
    }

    /// Returns true if `extension` is enabled.
    #[inline]
    pub fn is_extension_enabled(&self, extension: &CStr) -> bool {
        self.enabled_extensions.iter().any(|i| i.as_c_str() == extension)
    }

    /// Returns true if a debug messenger will be installed by
    /// [`install_debug_messenger`].
    #[inline]
    pub fn wants_debug_messenger(&self) -> bool {
        self.debug_messenger.is_some()
    }
}

impl fmt::Debug for InstanceMetadata {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("InstanceMetadata")
            .field(
                "api_version",
                &format_args!("{}.{}", self.api_version_major(), self.api_version_minor()),
            )
            .field("enabled_layers", &self.enabled_layers)
            .field("enabled_extensions", &self.enabled_extensions)
            .field("debug_messenger", &self.debug_messenger.is_some())
            .finish()
    }
}

/// Errors that can occur during instance creation.
#[derive(Debug, Error)]
pub enum InstanceCreationError {
    /// Vulkan Error.
    #[error("vulkan error")]
    VulkanError(#[from] vk::Result),
    /// One or more layers are not present.
    #[error("layers ({0:?}) not present")]
    LayersNotPresent(BootstrapSmallVec<CString>),
    /// One or more extensions are not present.
    #[error("extensions ({0:?}) not present")]
    ExtensionsNotPresent(BootstrapSmallVec<CString>),
    /// The instance supports a lower API version than required.
    #[error("instance api version {supported:#x} is lower than the required {required:#x}")]
    UnsupportedApiVersion {
        /// Version reported by the loader.
        supported: u32,
        /// Version required by the builder.
        required: u32,
    },
    /// An application or engine name contains a nul byte.
    #[error("invalid name")]
    InvalidName(#[from] NulError),
}

/// Splits `wanted` names into the ones present in `available` and the
/// missing required ones. Missing optional names are dropped.
fn negotiate_names<'a>(
    wanted: &'a [(CString, bool)],
    available: &[&CStr],
) -> (BootstrapSmallVec<&'a CStr>, BootstrapSmallVec<CString>) {
    let mut enabled = BootstrapSmallVec::new();
    let mut not_present = BootstrapSmallVec::new();
    for (name, required) in wanted {
        let present = available.iter().any(|&supported| supported == name.as_c_str());
        if enabled.contains(&name.as_c_str()) {
            continue;
        }

        match (required, present) {
            (_, true) => enabled.push(name.as_c_str()),
            (true, false) => not_present.push(name.clone()),
            (false, false) => (),
        }
    }

    (enabled, not_present)
}

/// Allows to easily create an [`ash::Instance`] and friends.
pub struct InstanceBuilder {
    app_name: Option<CString>,
    app_version: Option<u32>,
    engine_name: Option<CString>,
    engine_version: Option<u32>,
    required_api_version: u32,
    requested_api_version: Option<u32>,
    layers: BootstrapSmallVec<(CString, bool)>,
    extensions: BootstrapSmallVec<(CString, bool)>,
    debug_messenger: DebugMessenger,
    debug_message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    debug_message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    allocator: Option<vk::AllocationCallbacks>,
}

impl InstanceBuilder {
    /// Create a new instance builder with opinionated defaults.
    #[inline]
    pub fn new() -> Self {
        InstanceBuilder {
            app_name: None,
            app_version: None,
            engine_name: None,
            engine_version: None,
            required_api_version: vk::API_VERSION_1_0,
            requested_api_version: None,
            layers: BootstrapSmallVec::new(),
            extensions: BootstrapSmallVec::new(),
            debug_messenger: DebugMessenger::Disable,
            debug_message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            debug_message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            allocator: None,
        }
    }

    /// Application name to advertise.
    #[inline]
    pub fn app_name(mut self, app_name: &str) -> Result<Self, NulError> {
        self.app_name = Some(CString::new(app_name)?);
        Ok(self)
    }

    /// Application version to advertise.
    #[inline]
    pub fn app_version(mut self, major: u32, minor: u32) -> Self {
        self.app_version = Some(vk::make_api_version(0, major, minor, 0));
        self
    }

    /// Engine name to advertise.
    #[inline]
    pub fn engine_name(mut self, engine_name: &str) -> Result<Self, NulError> {
        self.engine_name = Some(CString::new(engine_name)?);
        Ok(self)
    }

    /// Engine version to advertise.
    #[inline]
    pub fn engine_version(mut self, major: u32, minor: u32) -> Self {
        self.engine_version = Some(vk::make_api_version(0, major, minor, 0));
        self
    }

    /// Instance API version to be used as minimum requirement.
    #[inline]
    pub fn require_api_version(mut self, major: u32, minor: u32) -> Self {
        self.required_api_version = vk::make_api_version(0, major, minor, 0);
        self
    }

    /// Instance API version to request. If it is not supported, fall back to
    /// the highest supported version.
    #[inline]
    pub fn request_api_version(mut self, major: u32, minor: u32) -> Self {
        self.requested_api_version = Some(vk::make_api_version(0, major, minor, 0));
        self
    }

    /// Try to enable this layer, ignore if it's not supported
    #[inline]
    pub fn request_layer(mut self, layer: &CStr) -> Self {
        self.layers.push((layer.to_owned(), false));
        self
    }

    /// Enable this layer, fail if it's not supported.
    #[inline]
    pub fn require_layer(mut self, layer: &CStr) -> Self {
        self.layers.push((layer.to_owned(), true));
        self
    }

    /// Try to enable this extension, ignore if it is not supported.
    #[inline]
    pub fn request_extension(mut self, extension: &CStr) -> Self {
        self.extensions.push((extension.to_owned(), false));
        self
    }

    /// Enable this extension, fail if it's not supported.
    #[inline]
    pub fn require_extension(mut self, extension: &CStr) -> Self {
        self.extensions.push((extension.to_owned(), true));
        self
    }

    /// Adds a requirement on every extension in `extensions`, as returned by
    /// e.g. [`ash_window::enumerate_required_extensions`].
    ///
    /// # Safety
    ///
    /// Every pointer must point to a valid, nul-terminated string.
    #[inline]
    pub unsafe fn require_extension_ptrs(mut self, extensions: &[*const c_char]) -> Self {
        self.extensions.extend(
            extensions
                .iter()
                .map(|&name| (CStr::from_ptr(name).to_owned(), true)),
        );
        self
    }

    #[cfg(feature = "surface")]
    /// Adds an requirement on all Vulkan extensions necessary to create a
    /// surface on `display_handle`. You can also manually add these extensions.
    /// Returns `None` if the corresponding Vulkan surface extensions couldn't
    /// be found. This is only supported on feature `surface`.
    #[inline]
    pub fn require_surface_extensions(
        self,
        display_handle: &impl HasRawDisplayHandle,
    ) -> Option<Self> {
        let required_extensions =
            ash_window::enumerate_required_extensions(display_handle.raw_display_handle()).ok()?;
        // SAFETY: ash-window hands out static extension name constants.
        Some(unsafe { self.require_extension_ptrs(required_extensions) })
    }

    /// Add Khronos validation layers.
    #[inline]
    pub fn validation_layers(mut self, validation_layers: ValidationLayers) -> Self {
        match validation_layers {
            ValidationLayers::Require | ValidationLayers::Request => {
                self.layers.push((
                    KHRONOS_VALIDATION_LAYER.to_owned(),
                    matches!(validation_layers, ValidationLayers::Require),
                ));
            }
            ValidationLayers::Disable => (),
        }

        self
    }

    /// Try to create a debug messenger with the config provided by
    /// `debug_messenger`.
    #[inline]
    pub fn request_debug_messenger(mut self, debug_messenger: DebugMessenger) -> Self {
        if !matches!(debug_messenger, DebugMessenger::Disable) {
            self.extensions.push((DebugUtils::name().to_owned(), false));
        }

        self.debug_messenger = debug_messenger;
        self
    }

    /// Filter for the severity of debug messages.
    #[inline]
    pub fn debug_message_severity(
        mut self,
        severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ) -> Self {
        self.debug_message_severity = severity;
        self
    }

    /// Filter for the type of debug messages.
    #[inline]
    pub fn debug_message_type(mut self, ty: vk::DebugUtilsMessageTypeFlagsEXT) -> Self {
        self.debug_message_type = ty;
        self
    }

    /// Allocation callback to use for internal Vulkan calls in the builder.
    #[inline]
    pub fn allocation_callbacks(mut self, allocator: vk::AllocationCallbacks) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Returns the [`ash::Instance`] and [`InstanceMetadata`] about what is
    /// actually enabled in the instance. If a debug messenger was requested
    /// and `VK_EXT_debug_utils` is available, it also covers instance
    /// creation; install the persistent one with [`install_debug_messenger`].
    pub unsafe fn build(
        self,
        entry: &Entry,
    ) -> Result<(Instance, InstanceMetadata), InstanceCreationError> {
        let instance_version = entry
            .try_enumerate_instance_version()?
            .unwrap_or(vk::API_VERSION_1_0);
        let mut api_version = self.required_api_version;
        if instance_version < api_version {
            return Err(InstanceCreationError::UnsupportedApiVersion {
                supported: instance_version,
                required: api_version,
            });
        }

        if let Some(requested_api_version) = self.requested_api_version {
            api_version = api_version.max(requested_api_version.min(vk::make_api_version(
                0,
                vk::api_version_major(instance_version),
                vk::api_version_minor(instance_version),
                0,
            )));
        }

        let mut app_info = vk::ApplicationInfo::builder().api_version(api_version);
        if let Some(app_name) = &self.app_name {
            app_info = app_info.application_name(app_name);
        }

        if let Some(app_version) = self.app_version {
            app_info = app_info.application_version(app_version);
        }

        if let Some(engine_name) = &self.engine_name {
            app_info = app_info.engine_name(engine_name);
        }

        if let Some(engine_version) = self.engine_version {
            app_info = app_info.engine_version(engine_version);
        }

        let layer_properties = entry.enumerate_instance_layer_properties()?;
        let supported_layers: Vec<_> = layer_properties
            .iter()
            .map(|layer| CStr::from_ptr(layer.layer_name.as_ptr()))
            .collect();
        let (enabled_layers, layers_not_present) = negotiate_names(&self.layers, &supported_layers);
        if !layers_not_present.is_empty() {
            return Err(InstanceCreationError::LayersNotPresent(layers_not_present));
        }

        let mut extension_properties = entry.enumerate_instance_extension_properties(None)?;
        for &layer_name in &enabled_layers {
            extension_properties.extend(entry.enumerate_instance_extension_properties(Some(layer_name))?);
        }

        let supported_extensions: Vec<_> = extension_properties
            .iter()
            .map(|extension| CStr::from_ptr(extension.extension_name.as_ptr()))
            .collect();
        let (enabled_extensions, extensions_not_present) =
            negotiate_names(&self.extensions, &supported_extensions);
        if !extensions_not_present.is_empty() {
            return Err(InstanceCreationError::ExtensionsNotPresent(
                extensions_not_present,
            ));
        }

        let is_debug_utils_enabled = enabled_extensions.contains(&DebugUtils::name());
        let debug_messenger = match (self.debug_messenger, is_debug_utils_enabled) {
            (DebugMessenger::Disable, _) | (_, false) => None,
            (DebugMessenger::Default, true) => Some((default_debug_callback as DebugCallback, ptr::null_mut())),
            (
                DebugMessenger::Custom {
                    callback,
                    user_data_pointer,
                },
                true,
            ) => Some((callback, user_data_pointer)),
        }
        .map(|(callback, user_data)| DebugMessengerSetup {
            severity: self.debug_message_severity,
            ty: self.debug_message_type,
            callback,
            user_data,
        });

        let layer_names: BootstrapSmallVec<_> =
            enabled_layers.iter().map(|name| name.as_ptr()).collect();
        let extension_names: BootstrapSmallVec<_> =
            enabled_extensions.iter().map(|name| name.as_ptr()).collect();
        let mut instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);

        let mut instance_messenger_info;
        if let Some(setup) = &debug_messenger {
            instance_messenger_info = setup.create_info();
            instance_info = instance_info.push_next(&mut instance_messenger_info);
        }

        let instance = entry.create_instance(&instance_info, self.allocator.as_ref())?;
        let instance_metadata = InstanceMetadata {
            instance_handle: instance.handle(),
            api_version,
            enabled_layers: enabled_layers.iter().map(|&name| name.to_owned()).collect(),
            enabled_extensions: enabled_extensions
                .iter()
                .map(|&name| name.to_owned())
                .collect(),
            debug_messenger,
        };

        tracing::debug!(metadata = ?instance_metadata, "created instance");
        Ok((instance, instance_metadata))
    }
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the debug messenger configured on the [`InstanceBuilder`].
/// Returns `Ok(None)` if none was requested or `VK_EXT_debug_utils` is not
/// enabled.
pub unsafe fn install_debug_messenger(
    entry: &Entry,
    instance: &Instance,
    instance_metadata: &InstanceMetadata,
) -> Result<Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>, vk::Result> {
    assert_eq!(instance.handle(), instance_metadata.instance_handle());

    let Some(setup) = instance_metadata.debug_messenger else {
        return Ok(None);
    };

    let debug_utils = DebugUtils::new(entry, instance);
    let messenger = debug_utils.create_debug_utils_messenger(&setup.create_info(), None)?;
    Ok(Some((debug_utils, messenger)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cstr::cstr;

    fn names(names: &[&'static CStr]) -> Vec<&'static CStr> {
        names.to_vec()
    }

    #[test]
    fn required_missing_names_are_reported() {
        let wanted = [
            (KHRONOS_VALIDATION_LAYER.to_owned(), true),
            (cstr!("VK_LAYER_LUNARG_api_dump").to_owned(), false),
        ];
        let (enabled, missing) = negotiate_names(&wanted, &names(&[cstr!("VK_LAYER_MESA_overlay")]));

        assert!(enabled.is_empty());
        assert_eq!(missing.as_slice(), &[KHRONOS_VALIDATION_LAYER.to_owned()]);
    }

    #[test]
    fn present_names_are_enabled_once() {
        let wanted = [
            (DebugUtils::name().to_owned(), false),
            (cstr!("VK_KHR_surface").to_owned(), true),
            (DebugUtils::name().to_owned(), true),
        ];
        let available = names(&[cstr!("VK_KHR_surface"), DebugUtils::name()]);
        let (enabled, missing) = negotiate_names(&wanted, &available);

        assert_eq!(
            enabled.as_slice(),
            &[DebugUtils::name(), cstr!("VK_KHR_surface")]
        );
        assert!(missing.is_empty());
    }

    #[test]
    fn debug_callback_never_aborts() {
        let message = cstr!("vkCreateDevice: invalid queue family index");
        let data = vk::DebugUtilsMessengerCallbackDataEXT::builder()
            .message(message)
            .build();

        for severity in [
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        ] {
            let result = unsafe {
                default_debug_callback(
                    severity,
                    vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                    &data,
                    ptr::null_mut(),
                )
            };
            assert_eq!(result, vk::FALSE);
        }

        let result = unsafe {
            default_debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        assert_eq!(result, vk::FALSE);
    }

    #[test]
    fn debug_messenger_adds_debug_utils_request() {
        let builder = InstanceBuilder::new().request_debug_messenger(DebugMessenger::Default);
        assert!(builder
            .extensions
            .iter()
            .any(|(name, required)| name.as_c_str() == DebugUtils::name() && !required));

        let builder = InstanceBuilder::new().request_debug_messenger(DebugMessenger::Disable);
        assert!(builder.extensions.is_empty());
    }

    #[test]
    fn validation_layer_requirement_follows_mode() {
        let builder = InstanceBuilder::new().validation_layers(ValidationLayers::Require);
        assert_eq!(
            builder.layers.as_slice(),
            &[(KHRONOS_VALIDATION_LAYER.to_owned(), true)]
        );

        let builder = InstanceBuilder::new().validation_layers(ValidationLayers::Disable);
        assert!(builder.layers.is_empty());
    }

    #[test]
    #[ignore = "requires a Vulkan loader"]
    fn basic() {
        let entry = unsafe { Entry::load() }.unwrap();
        let (instance, metadata) = unsafe { InstanceBuilder::new().build(&entry).unwrap() };
        assert!(!metadata.wants_debug_messenger());

        unsafe {
            instance.destroy_instance(None);
        }
    }

    #[test]
    #[ignore = "requires a Vulkan loader"]
    fn validation_and_messenger() {
        let entry = unsafe { Entry::load() }.unwrap();
        let (instance, metadata) = unsafe {
            InstanceBuilder::new()
                .validation_layers(ValidationLayers::Request)
                .request_debug_messenger(DebugMessenger::Default)
                .build(&entry)
                .unwrap()
        };

        unsafe {
            if let Some((debug_utils, messenger)) =
                install_debug_messenger(&entry, &instance, &metadata).unwrap()
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            instance.destroy_instance(None);
        }
    }
}
