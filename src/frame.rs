// Frame pacer: owns the swapchain, the N frames-in-flight worth of
// command buffers/fences/semaphores, and the acquire/submit/present
// cycle.
//
// Grounded on thundr's `Display` (display/mod.rs) for the
// acquire-next-image retry loop and the OUT_OF_DATE/SUBOPTIMAL handling
// in both acquire and present, trimmed down from its
// backend-abstraction (`Backend` trait, headless/sdl2/drm variants) to
// a single real-surface path.

use ash::extensions::khr;
use ash::vk;
use log;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{GraphError, Result};

struct FrameSlot {
    cbuf: vk::CommandBuffer,
    fence: vk::Fence,
    /// signalled when the swapchain image is ready to be written
    image_available: vk::Semaphore,
    /// signalled when rendering into the frame's command buffer is done
    render_finished: vk::Semaphore,
}

/// Drives the acquire/record/submit/present loop and hands callers the
/// frame-in-flight index the rest of the graph (pool, binder) should
/// key their per-frame state on.
pub struct FramePacer {
    device: Arc<Device>,
    swapchain_loader: khr::Swapchain,
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    cmd_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    /// the embedding application's reported window size, used when the
    /// surface itself reports `current_extent.width == u32::MAX`
    /// ("app must choose"); mirrors thundr's saved `d_resolution`
    window_extent: vk::Extent2D,
    frames_count: usize,
    /// increments every `submit`; `frame_index() % frames_count` picks
    /// the slot, the raw value is what the resource pool tags kills with
    frame_counter: u64,
    current_image_index: u32,
}

impl FramePacer {
    pub fn new(
        device: Arc<Device>,
        surface_loader: khr::Surface,
        surface: vk::SurfaceKHR,
        frames_count: usize,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let swapchain_loader = khr::Swapchain::new(&device.inst.inst, &device.dev);

        let (format, extent, images, swapchain) = Self::create_swapchain(
            &device,
            &surface_loader,
            surface,
            &swapchain_loader,
            window_extent,
            None,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .build();
        let cmd_pool = unsafe { device.dev.create_command_pool(&pool_info, None)? };

        let cbuf_alloc = vk::CommandBufferAllocateInfo::builder()
            .command_pool(cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_count as u32)
            .build();
        let cbufs = unsafe { device.dev.allocate_command_buffers(&cbuf_alloc)? };

        let mut slots = Vec::with_capacity(frames_count);
        for cbuf in cbufs {
            let fence_info = vk::FenceCreateInfo::builder()
                .flags(vk::FenceCreateFlags::SIGNALED)
                .build();
            let sem_info = vk::SemaphoreCreateInfo::default();
            slots.push(FrameSlot {
                cbuf,
                fence: unsafe { device.dev.create_fence(&fence_info, None)? },
                image_available: unsafe { device.dev.create_semaphore(&sem_info, None)? },
                render_finished: unsafe { device.dev.create_semaphore(&sem_info, None)? },
            });
        }

        Ok(Self {
            device,
            swapchain_loader,
            surface_loader,
            surface,
            swapchain,
            images,
            format,
            extent,
            cmd_pool,
            slots,
            window_extent,
            frames_count,
            frame_counter: 0,
            current_image_index: 0,
        })
    }

    fn create_swapchain(
        device: &Device,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        swapchain_loader: &khr::Swapchain,
        window_extent: vk::Extent2D,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<(vk::Format, vk::Extent2D, Vec<vk::Image>, vk::SwapchainKHR)> {
        let caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(device.pdev, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.pdev, surface)?
        };
        let surface_format = formats
            .iter()
            .find(|f| f.format == vk::Format::B8G8R8A8_SRGB)
            .copied()
            .unwrap_or(formats[0]);

        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: window_extent
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: window_extent
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let image_count = (caps.min_image_count + 1).min(if caps.max_image_count == 0 {
            caps.min_image_count + 1
        } else {
            caps.max_image_count
        });

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device.pdev, surface)?
        };
        let present_mode = present_modes
            .iter()
            .copied()
            .find(|&m| m == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .build();
        if let Some(old) = old {
            info.old_swapchain = old;
        }

        let swapchain = unsafe { swapchain_loader.create_swapchain(&info, None)? };
        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain)? };

        Ok((surface_format.format, extent, images, swapchain))
    }

    /// Tears down and recreates the swapchain against the surface's
    /// current capabilities. Called after `begin`/`submit` report
    /// `SurfaceStale`.
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        unsafe { self.device.dev.device_wait_idle()? };
        let old = self.swapchain;
        let (format, extent, images, swapchain) = Self::create_swapchain(
            &self.device,
            &self.surface_loader,
            self.surface,
            &self.swapchain_loader,
            self.window_extent,
            Some(old),
        )?;
        unsafe { self.swapchain_loader.destroy_swapchain(old, None) };
        self.format = format;
        self.extent = extent;
        self.images = images;
        self.swapchain = swapchain;
        log::info!("swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(())
    }

    pub fn frames_count(&self) -> usize {
        self.frames_count
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// The single CPU blocking point per frame: waits on
    /// this slot's fence, then resets it and its command buffer. The
    /// swapchain image is then acquired; `SurfaceStale` means the
    /// caller should `recreate_swapchain` and try again next frame.
    pub fn begin(&mut self) -> Result<(usize, vk::CommandBuffer)> {
        let slot_index = (self.frame_counter % self.frames_count as u64) as usize;
        let slot = &self.slots[slot_index];

        unsafe {
            self.device.dev.wait_for_fences(&[slot.fence], true, u64::MAX)?;
        }

        let acquired = loop {
            let result = unsafe {
                self.swapchain_loader.acquire_next_image(
                    self.swapchain,
                    u64::MAX,
                    slot.image_available,
                    vk::Fence::null(),
                )
            };
            match result {
                Ok((index, suboptimal)) => {
                    if suboptimal {
                        log::warn!("swapchain suboptimal at acquire, frame {}", self.frame_counter);
                    }
                    break index;
                }
                Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => continue,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(GraphError::SurfaceStale),
                Err(e) => return Err(GraphError::from(e)),
            }
        };
        self.current_image_index = acquired;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .build();
        unsafe {
            self.device.dev.reset_fences(&[slot.fence])?;
            self.device
                .dev
                .reset_command_buffer(slot.cbuf, vk::CommandBufferResetFlags::empty())?;
            self.device.dev.begin_command_buffer(slot.cbuf, &begin_info)?;
        }

        Ok((slot_index, slot.cbuf))
    }

    pub fn current_backbuffer_image(&self) -> vk::Image {
        self.images[self.current_image_index as usize]
    }

    /// The swapchain images backing every slot, in index order. The
    /// orchestrator registers one pooled `Image` per entry so it can
    /// alias the stable `get_backbuffer()` id onto whichever index gets
    /// acquired each frame.
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn current_backbuffer_index(&self) -> usize {
        self.current_image_index as usize
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_counter
    }

    /// Submits the recorded command buffer, presenting only if `present`
    /// is set: a frame where no task
    /// called `prepare_backbuffer` has nothing ready to hand to the
    /// presentation engine. Returns the frame index just retired so the
    /// caller can feed `ResourcePool::collect` and
    /// `ResourcePool::set_frame_index`.
    pub fn submit(&mut self, cbuf: vk::CommandBuffer, present: bool) -> Result<u64> {
        let slot_index = (self.frame_counter % self.frames_count as u64) as usize;
        let slot = &self.slots[slot_index];
        debug_assert_eq!(slot.cbuf, cbuf);

        unsafe { self.device.dev.end_command_buffer(cbuf)? };

        let wait_semaphores = [slot.image_available];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let signal_semaphores = [slot.render_finished];
        let cbufs = [cbuf];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device
                .dev
                .queue_submit(self.device.queue, &[submit_info], slot.fence)?;
        }

        let retired = self.frame_counter;
        self.frame_counter += 1;

        if !present {
            return Ok(retired);
        }

        let swapchains = [self.swapchain];
        let image_indices = [self.current_image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices)
            .build();

        let present_result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.queue, &present_info)
        };

        match present_result {
            Ok(suboptimal) => {
                if suboptimal {
                    log::warn!("swapchain suboptimal at present, frame {}", retired);
                }
                Ok(retired)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GraphError::SurfaceStale),
            Err(e) => Err(GraphError::from(e)),
        }
    }
}

impl Drop for FramePacer {
    fn drop(&mut self) {
        unsafe {
            self.device.dev.device_wait_idle().ok();
            for slot in &self.slots {
                self.device.dev.destroy_fence(slot.fence, None);
                self.device.dev.destroy_semaphore(slot.image_available, None);
                self.device.dev.destroy_semaphore(slot.render_finished, None);
            }
            self.device.dev.destroy_command_pool(self.cmd_pool, None);
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
