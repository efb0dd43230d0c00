// Flags the Vulkan capabilities this graph depends on: descriptor
// indexing (for bindless shader/pipeline cache bindings) and timeline
// semaphores (frame pacing). Everything else is assumed present on
// any device recent enough to run a render graph at all.
//
// Grounded on thundr's platform.rs capability-flagging pattern, trimmed
// to the extensions this crate actually uses.

use ash::extensions::khr;
use ash::vk;
use log;

use std::ffi::CStr;

pub struct DeviceFeatures {
    /// Descriptor indexing / update-after-bind, required for the
    /// bindless descriptor slots the shader cache creates.
    pub supports_descriptor_indexing: bool,
    desc_indexing_exts: [*const i8; 2],
}

fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[*const i8]) -> bool {
    req.iter().all(|r| {
        let rstr = unsafe { CStr::from_ptr(*r) };
        exts.iter().any(|e| {
            let estr = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
            rstr == estr
        })
    })
}

impl DeviceFeatures {
    pub fn new(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Self {
        let mut ret = Self {
            supports_descriptor_indexing: false,
            desc_indexing_exts: [
                vk::KhrMaintenance3Fn::name().as_ptr(),
                vk::ExtDescriptorIndexingFn::name().as_ptr(),
            ],
        };

        let exts = unsafe {
            inst.enumerate_device_extension_properties(pdev)
                .expect("failed to enumerate device extensions")
        };

        ret.supports_descriptor_indexing = contains_extensions(&exts, &ret.desc_indexing_exts);
        if !ret.supports_descriptor_indexing {
            log::warn!("device does not support descriptor indexing; bindless slots will fail to build");
        }

        ret
    }

    pub fn required_device_extensions(&self) -> Vec<*const i8> {
        let mut ret = vec![khr::Swapchain::name().as_ptr(), khr::TimelineSemaphore::name().as_ptr()];
        if self.supports_descriptor_indexing {
            ret.extend_from_slice(&self.desc_indexing_exts);
        }
        ret
    }
}
