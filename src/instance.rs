// Vulkan rendering instance
//
// This holds the common instance-level setup: entry point loading,
// validation layers, and the debug messenger.

use ash::extensions::ext;
use ash::{vk, Entry};
use log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use crate::CreateInfo;

// straight out of the ash examples: prints whatever the validation
// layers hand us.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK][{:?}] {:?}", message_types, message);
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK][{:?}] {:?}", message_types, message);
    } else {
        log::debug!("[VK][{:?}] {:?}", message_types, message);
    }
    vk::FALSE
}

/// The Vulkan instance and its debug messenger.
///
/// Every other component receives a reference to this instead of
/// reaching for a global; there is exactly one per running graph.
pub struct Instance {
    debug_loader: ext::DebugUtils,
    debug_callback: vk::DebugUtilsMessengerEXT,

    pub(crate) loader: Entry,
    pub(crate) inst: ash::Instance,
}

impl Instance {
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .expect("failed to install debug messenger")
        };
        (dr_loader, callback)
    }

    /// Creates a new Vulkan instance, enabling validation layers when
    /// `info.enable_validation` is set (defaults to on for debug builds).
    pub fn new(info: &CreateInfo) -> Self {
        let entry = Entry::linked();
        let app_name = CString::new("rendergraph").unwrap();

        let mut layer_names = Vec::new();
        if info.enable_validation {
            layer_names.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        }
        let layer_names_raw: Vec<*const i8> =
            layer_names.iter().map(|n: &CString| n.as_ptr()).collect();

        let mut extension_names_raw = info.surface_extensions.clone();
        extension_names_raw.push(ext::DebugUtils::name().as_ptr());

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .expect("instance creation error")
        };

        let (dr_loader, d_callback) = Self::setup_debug(&entry, &instance);

        Self {
            loader: entry,
            inst: instance,
            debug_loader: dr_loader,
            debug_callback: d_callback,
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.debug_loader
                .destroy_debug_utils_messenger(self.debug_callback, None);
            self.inst.destroy_instance(None);
        }
    }
}
