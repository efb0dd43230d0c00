// The graph orchestrator: the public façade tying every other
// component together. Owns the resource pools, shader/pipeline
// caches, descriptor binder, ubo ring, frame pacer, and tracking table;
// drives the per-frame flush -> begin -> barrier/record -> submit
// cycle.
//
// Grounded on thundr's `Renderer` (renderer.rs) for the "one big struct
// owning every subsystem, `submit` walks a draw list" shape, generalized
// from a fixed draw-list to the declared task sequence the two-phase
// setup/record contract produces.

use ash::extensions::khr;
use ash::vk;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::binder::DescriptorBinder;
use crate::builder::{ImageInfo, TaskBuilder};
use crate::cmd::{CommandContext, RenderResources};
use crate::device::Device;
use crate::error::Result;
use crate::frame::FramePacer;
use crate::instance::Instance;
use crate::pipeline::PipelineCache;
use crate::pool::{BufferId, ImageId, ResourcePool, ResourcePtr};
use crate::resources::{Buffer, BufferDesc, Image, ImageCreateOptions, ImageDesc};
use crate::shader::ShaderRegistry;
use crate::tracking::{self, TrackingTable};
use crate::ubo::UboRingAllocator;
use crate::CreateInfo;

const UBO_RING_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
const UBO_RING_MIN_ALIGNMENT: u64 = 256;

type RecordFn = Box<dyn FnOnce(&RenderResources, &mut CommandContext) -> Result<()>>;

struct Task {
    #[allow(dead_code)]
    name: String,
    record_fn: RecordFn,
    prepare_backbuffer: bool,
}

/// Ties together every subsystem and exposes the single
/// declaration+submission surface an embedding application drives.
pub struct Graph {
    device: Arc<Device>,
    images: Arc<ResourcePool<ImageId, Image>>,
    buffers: Arc<ResourcePool<BufferId, Buffer>>,
    shaders: ShaderRegistry,
    pipelines: RefCell<PipelineCache>,
    binder: RefCell<DescriptorBinder>,
    ubo: RefCell<UboRingAllocator>,
    pacer: FramePacer,
    tracking: TrackingTable,

    owned_images: HashMap<ImageId, ResourcePtr<ImageId, Image>>,
    owned_buffers: HashMap<BufferId, ResourcePtr<BufferId, Buffer>>,

    /// The stable id tasks declare against via `get_backbuffer()`; it
    /// is literally swapchain slot 0's id, remapped to whichever slot
    /// is acquired for frames that land on a different index.
    backbuffer_id: ImageId,
    backbuffer_slots: Vec<ImageId>,

    tasks: Vec<Task>,
}

impl Graph {
    pub fn new(
        info: &CreateInfo,
        surface_loader: khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let instance = Arc::new(Instance::new(info));
        let device = Arc::new(Device::new(instance, &surface_loader, surface)?);

        let images = ResourcePool::new();
        let buffers = ResourcePool::new();
        let shaders = ShaderRegistry::new(device.clone());
        let pipelines = RefCell::new(PipelineCache::new(device.clone()));
        let binder = RefCell::new(DescriptorBinder::new(device.dev.clone(), info.frames_count));
        let ubo = RefCell::new(UboRingAllocator::new(
            device.clone(),
            info.frames_count,
            UBO_RING_BLOCK_SIZE,
            UBO_RING_MIN_ALIGNMENT,
        )?);
        let pacer = FramePacer::new(
            device.clone(),
            surface_loader,
            surface,
            info.frames_count,
            info.window_extent,
        )?;

        let mut graph = Self {
            device,
            images,
            buffers,
            shaders,
            pipelines,
            binder,
            ubo,
            pacer,
            tracking: TrackingTable::new(),
            owned_images: HashMap::new(),
            owned_buffers: HashMap::new(),
            backbuffer_id: ImageId::default(),
            backbuffer_slots: Vec::new(),
            tasks: Vec::new(),
        };
        graph.register_backbuffers()?;
        graph.tracking.begin_frame(0);
        Ok(graph)
    }

    fn register_backbuffers(&mut self) -> Result<()> {
        let format = self.pacer.format();
        let extent = self.pacer.extent();
        let desc = ImageDesc {
            image_type: vk::ImageType::TYPE_2D,
            format,
            aspect: vk::ImageAspectFlags::COLOR,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            create_options: ImageCreateOptions::Plain,
        };

        self.backbuffer_slots.clear();
        for (i, &image) in self.pacer.images().to_vec().iter().enumerate() {
            let ptr = self
                .images
                .register(Image::from_external(self.device.clone(), image, desc));
            let id = ptr.id();
            if i == 0 {
                self.backbuffer_id = id;
            }
            self.backbuffer_slots.push(id);
            self.owned_images.insert(id, ptr);
        }
        Ok(())
    }

    /// Re-registers the swapchain backbuffer images after the host
    /// recreates the swapchain following `SurfaceStale`. The old
    /// backing images are dropped from `owned_images`, releasing them
    /// through the normal deferred-destruction path.
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        self.pacer.recreate_swapchain()?;
        for id in self.backbuffer_slots.drain(..) {
            self.images.unmap(id);
            self.owned_images.remove(&id);
        }
        self.register_backbuffers()
    }

    pub fn frames_count(&self) -> usize {
        self.pacer.frames_count()
    }

    /// Creates and registers an image, retaining ownership in
    /// `owned_images` until graph teardown.
    pub fn create_image(&mut self, desc: ImageDesc) -> Result<ImageId> {
        let ptr = self.images.register(Image::new(self.device.clone(), desc)?);
        let id = ptr.id();
        self.owned_images.insert(id, ptr);
        Ok(id)
    }

    pub fn create_buffer(&mut self, desc: BufferDesc) -> Result<BufferId> {
        let ptr = self.buffers.register(Buffer::new(self.device.clone(), desc)?);
        let id = ptr.id();
        self.owned_buffers.insert(id, ptr);
        Ok(id)
    }

    /// The stable id frame-to-frame recording code declares against for
    /// the swapchain image.
    pub fn get_backbuffer(&self) -> ImageId {
        self.backbuffer_id
    }

    pub fn get_descriptor(&self, image: ImageId) -> Result<ImageInfo> {
        let img = self.images.get(image)?;
        let desc = img.descriptor();
        Ok(ImageInfo {
            format: desc.format,
            aspect: desc.aspect,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
        })
    }

    pub fn remap_image(&self, src: ImageId, dst: ImageId) {
        self.images.remap(src, dst);
    }

    pub fn remap_buffer(&self, src: BufferId, dst: BufferId) {
        self.buffers.remap(src, dst);
    }

    pub fn shaders_mut(&mut self) -> &mut ShaderRegistry {
        &mut self.shaders
    }

    pub fn pipelines(&self) -> &RefCell<PipelineCache> {
        &self.pipelines
    }

    /// Declares a task's resource uses now (via `setup_fn` against a
    /// `TaskBuilder`) and stores its command-recording closure for
    /// `submit` to run later, in insertion order.
    pub fn add_task<D, S, R>(&mut self, name: &str, mut data: D, setup_fn: S, record_fn: R) -> Result<()>
    where
        D: 'static,
        S: FnOnce(&mut D, &mut TaskBuilder) -> Result<()>,
        R: FnOnce(&D, &RenderResources, &mut CommandContext) -> Result<()> + 'static,
    {
        let task_index = self.tasks.len();
        let mut builder = TaskBuilder::new(self.images.clone(), self.buffers.clone());
        setup_fn(&mut data, &mut builder)?;
        let decls = builder.finish();

        for (subresource, state) in decls.images {
            self.tracking.use_image(task_index, subresource, state);
        }
        for (buffer, state) in decls.buffers {
            self.tracking.use_buffer(task_index, buffer, state);
        }

        self.tasks.push(Task {
            name: name.to_string(),
            record_fn: Box::new(move |resources, cmd| record_fn(&data, resources, cmd)),
            prepare_backbuffer: decls.prepare_backbuffer,
        });
        Ok(())
    }

    fn resolve_image_for_barrier(&self, id: ImageId) -> (vk::Image, vk::ImageAspectFlags) {
        let img = self.images.get(id).expect("barrier built against a live image");
        (img.image, img.desc.aspect)
    }

    fn resolve_buffer_for_barrier(&self, id: BufferId) -> vk::Buffer {
        self.buffers.get(id).expect("barrier built against a live buffer").buffer
    }

    /// Flushes tracking, runs every declared task in order interleaved
    /// with its synthesized barrier, then submits and (if any task
    /// called `prepare_backbuffer`) presents.
    pub fn submit(&mut self) -> Result<()> {
        self.tracking.flush();

        let (_slot_index, cbuf) = self.pacer.begin()?;

        let frame_idx = self.pacer.frame_index();
        self.images.set_frame_index(frame_idx);
        self.buffers.set_frame_index(frame_idx);
        let reclaim_horizon = frame_idx.saturating_sub(self.pacer.frames_count() as u64);
        self.images.collect(reclaim_horizon);
        self.buffers.collect(reclaim_horizon);

        self.binder.borrow_mut().begin_frame(_slot_index)?;
        self.ubo.borrow_mut().begin_frame(_slot_index);

        let acquired = self.pacer.current_backbuffer_index();
        if acquired != 0 {
            self.images
                .remap(self.backbuffer_id, self.backbuffer_slots[acquired]);
        }

        let present = self.tasks.iter().any(|t| t.prepare_backbuffer);

        // Move the task list out of `self` entirely before the loop:
        // the loop body needs `&self` to resolve barrier resources, and
        // that would otherwise conflict with an in-progress `drain` of
        // `self.tasks`.
        let tasks = std::mem::take(&mut self.tasks);
        for (i, task) in tasks.into_iter().enumerate() {
            let barriers = self.tracking.barriers_at(i);
            let plan = tracking::build_pipeline_barrier(
                barriers,
                |img| self.resolve_image_for_barrier(img),
                |buf| self.resolve_buffer_for_barrier(buf),
            );

            let mut cmd = CommandContext::new(
                self.device.dev.clone(),
                cbuf,
                &self.pipelines,
                &self.shaders,
                &self.binder,
            );
            if let Some(plan) = plan {
                cmd.pipeline_barrier(&plan);
            }

            let resources = RenderResources::new(&self.images, &self.buffers, &self.binder, &self.ubo, frame_idx);
            (task.record_fn)(&resources, &mut cmd)?;
            cmd.end_renderpass();
        }

        self.tracking.begin_frame(0);

        // Unmap the temporary backbuffer alias unconditionally: a cheap
        // metadata-only pool operation, and it restores slot-0 identity
        // whether or not this frame acquired slot 0, so the next frame
        // always starts from a known state.
        self.images.unmap(self.backbuffer_id);

        let retired = self.pacer.submit(cbuf, present)?;
        let _ = retired;
        Ok(())
    }
}
