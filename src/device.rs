// Vulkan device representation
//
// Holds the per-GPU state: the logical device, the queue used for
// graphics/compute/transfer work, and the small set of allocation
// helpers every other component builds on. Grounded on thundr's
// device.rs, trimmed of the Wayland/dmabuf-specific import paths that
// are out of scope here.

use ash::vk;
use log;

use crate::error::{GraphError, Result};
use crate::instance::Instance;
use crate::platform::DeviceFeatures;

use std::sync::Arc;

/// Per-GPU device state shared by every component that needs to issue
/// Vulkan calls. There is one `Device` per running graph.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the logical device
    pub(crate) dev: ash::Device,
    pub(crate) features: DeviceFeatures,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// family used for both graphics and presentation; render graphs
    /// in this style don't bother splitting these across queues
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
}

impl Device {
    pub(crate) fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> u32 {
        let props = unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        for (i, family) in props.iter().enumerate() {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(pdev, i as u32, surface)
                    .unwrap_or(false)
            };

            if supports_graphics && supports_present {
                return i as u32;
            }
        }

        panic!("no queue family supports both graphics and presentation");
    }

    pub(crate) fn select_pdev(inst: &ash::Instance) -> vk::PhysicalDevice {
        let pdevs = unsafe {
            inst.enumerate_physical_devices()
                .expect("physical device enumeration failed")
        };

        // prefer a discrete GPU, fall back to whatever was reported first
        pdevs
            .iter()
            .find(|&&pdev| {
                let props = unsafe { inst.get_physical_device_properties(pdev) };
                props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
            })
            .copied()
            .unwrap_or(pdevs[0])
    }

    pub fn new(
        inst: Arc<Instance>,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let pdev = Self::select_pdev(&inst.inst);
        let queue_family = Self::select_queue_family(&inst.inst, pdev, surface_loader, surface);
        let features = DeviceFeatures::new(&inst.inst, pdev);

        let priorities = [1.0_f32];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build();

        let mut timeline_features =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::builder().timeline_semaphore(true);

        let device_exts = features.required_device_extensions();
        let queue_infos = [queue_info];
        let mut dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_exts)
            .push_next(&mut timeline_features)
            .build();
        dev_create_info.p_next = &timeline_features as *const _ as *const std::ffi::c_void;

        let dev = unsafe {
            inst.inst
                .create_device(pdev, &dev_create_info, None)
                .map_err(GraphError::from)?
        };

        let queue = unsafe { dev.get_device_queue(queue_family, 0) };
        let mem_props = unsafe { inst.inst.get_physical_device_memory_properties(pdev) };

        log::debug!("selected queue family {} for graphics+present", queue_family);

        Ok(Self {
            inst,
            dev,
            features,
            pdev,
            mem_props,
            queue_family,
            queue,
        })
    }

    /// Finds the index of a memory type compatible with `req` and
    /// carrying all the bits in `flags`.
    pub(crate) fn find_memory_type_index(
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        req: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for i in 0..mem_props.memory_type_count {
            if req.memory_type_bits & (1 << i) != 0
                && mem_props.memory_types[i as usize].property_flags.contains(flags)
            {
                return Some(i);
            }
        }
        None
    }

    /// Allocates a buffer/memory pair of `size` bytes, does not bind
    /// or populate it.
    pub(crate) fn create_buffer_with_size(
        &self,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let buffer = unsafe { self.dev.create_buffer(&create_info, None)? };
        let req = unsafe { self.dev.get_buffer_memory_requirements(buffer) };
        let index = Self::find_memory_type_index(&self.mem_props, &req, flags)
            .ok_or(GraphError::DeviceFailure(vk::Result::ERROR_FEATURE_NOT_PRESENT))?;

        let alloc_info = vk::MemoryAllocateInfo {
            allocation_size: req.size,
            memory_type_index: index,
            ..Default::default()
        };
        let memory = unsafe { self.dev.allocate_memory(&alloc_info, None)? };
        unsafe { self.dev.bind_buffer_memory(buffer, memory, 0)? };

        Ok((buffer, memory))
    }

    /// Maps `memory` and copies `data` into it at `offset`. Does not
    /// flush; callers targeting non-coherent memory must flush
    /// explicitly before any device read.
    pub(crate) fn update_memory<T: Copy>(&self, memory: vk::DeviceMemory, offset: u64, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = std::mem::size_of_val(data) as u64;
        unsafe {
            let ptr = self
                .dev
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())?;
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);
            self.dev.unmap_memory(memory);
        }
        Ok(())
    }

    /// Builds and submits a single `vk::ImageMemoryBarrier`, used by
    /// the tracking table when a layout transition must be emitted
    /// outside of a batched pipeline-barrier call (e.g. image import).
    pub(crate) fn transition_image_layout(
        &self,
        cbuf: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .image(image)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS)
                    .build(),
            )
            .build();

        unsafe {
            self.dev.cmd_pipeline_barrier(
                cbuf,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    pub(crate) fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .build();
        Ok(unsafe { self.dev.create_sampler(&info, None)? })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.dev.device_wait_idle().ok();
            self.dev.destroy_device(None);
        }
    }
}
