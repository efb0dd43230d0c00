// The record-time API: `RenderResources` (read-only resource lookups
// plus the descriptor/ubo allocators) and `CommandContext` (the single
// command buffer a task records into.
//
// `setup_fn` runs eagerly against a `TaskBuilder`; `record_fn` runs
// later, at submit, against these two types. Grounded on thundr's
// `Renderer::begin_recording_cbuf`/`draw_call_submit` (renderer.rs) for
// the shape of a single-command-buffer recording pass, generalized from
// one fixed draw loop to an arbitrary sequence of bind/draw/dispatch
// calls driven by task callbacks.

use ash::vk;
use std::cell::RefCell;
use std::sync::Arc;

use crate::binder::DescriptorBinder;
use crate::error::{GraphError, Result};
use crate::pipeline::PipelineCache;
use crate::pool::{BufferId, ImageId, ResourcePool};
use crate::resources::{Buffer, Image, ImageViewId};
use crate::shader::ShaderRegistry;
use crate::ubo::UboRingAllocator;

/// Tagged union over what a bound pipeline needs. Compute only needs a program name;
/// graphics additionally needs the interned vertex-input, subpass, and
/// fixed-function keys a prior `PipelineCache::intern_*` call produced.
#[derive(Debug, Clone, Copy)]
pub enum PipelineKind<'a> {
    Graphics {
        program: &'a str,
        vertex_input: usize,
        subpass: usize,
        fixed_state: usize,
    },
    Compute {
        program: &'a str,
    },
}

/// Read-only resource access plus the per-frame allocators, handed to
/// every `record_fn`. Lookups never touch the pool's refcount --
/// the graph already owns a `ResourcePtr` for everything reachable
/// from a declared use, so these calls are non-owning (`ResourcePool::get`).
pub struct RenderResources<'a> {
    images: &'a Arc<ResourcePool<ImageId, Image>>,
    buffers: &'a Arc<ResourcePool<BufferId, Buffer>>,
    binder: &'a RefCell<DescriptorBinder>,
    ubo: &'a RefCell<UboRingAllocator>,
    frame_index: u64,
}

impl<'a> RenderResources<'a> {
    pub(crate) fn new(
        images: &'a Arc<ResourcePool<ImageId, Image>>,
        buffers: &'a Arc<ResourcePool<BufferId, Buffer>>,
        binder: &'a RefCell<DescriptorBinder>,
        ubo: &'a RefCell<UboRingAllocator>,
        frame_index: u64,
    ) -> Self {
        Self {
            images,
            buffers,
            binder,
            ubo,
            frame_index,
        }
    }

    pub fn get_image(&self, id: ImageId) -> Result<Arc<Image>> {
        self.images.get(id)
    }

    pub fn get_buffer(&self, id: BufferId) -> Result<Arc<Buffer>> {
        self.buffers.get(id)
    }

    pub fn get_view(&self, view: ImageViewId) -> Result<vk::ImageView> {
        let image = self.images.get(view.image)?;
        image.view(view.range)
    }

    /// Allocates one descriptor set from this frame's pool. The caller writes its bindings
    /// directly; the binder's staged `set`/`flush` path is a separate,
    /// declarative alternative for sets a task rebuilds every frame.
    pub fn allocate_descriptor_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.binder.borrow_mut().allocate_descriptor_set(layout)
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Carves `size` bytes out of this frame's uniform ring, returning
    /// `(buffer, offset, host_ptr)`.
    pub fn ubo_alloc(&self, size: u64) -> Result<(vk::Buffer, u64, *mut u8)> {
        self.ubo.borrow_mut().alloc(size)
    }
}

/// The recording state for one task's command buffer: bind-point
/// tracking so `set_framebuffer` can open the render pass implied by
/// the currently-bound graphics pipeline, and so `bind_pipeline`
/// can validate completeness before the first draw/dispatch.
pub struct CommandContext<'a> {
    dev: ash::Device,
    cbuf: vk::CommandBuffer,
    pipelines: &'a RefCell<PipelineCache>,
    shaders: &'a ShaderRegistry,
    binder: &'a RefCell<DescriptorBinder>,
    bind_point: Option<vk::PipelineBindPoint>,
    layout: Option<vk::PipelineLayout>,
    subpass: Option<usize>,
    render_pass_open: bool,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(
        dev: ash::Device,
        cbuf: vk::CommandBuffer,
        pipelines: &'a RefCell<PipelineCache>,
        shaders: &'a ShaderRegistry,
        binder: &'a RefCell<DescriptorBinder>,
    ) -> Self {
        Self {
            dev,
            cbuf,
            pipelines,
            shaders,
            binder,
            bind_point: None,
            layout: None,
            subpass: None,
            render_pass_open: false,
        }
    }

    pub fn cbuf(&self) -> vk::CommandBuffer {
        self.cbuf
    }

    /// Emits a pipeline barrier built by the tracking table for one
    /// task edge. Called by the orchestrator between tasks, never
    /// directly by task `record_fn`s.
    pub(crate) fn pipeline_barrier(&self, plan: &crate::tracking::PipelineBarrierPlan) {
        unsafe {
            self.dev.cmd_pipeline_barrier(
                self.cbuf,
                plan.src_stage,
                plan.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &plan.buffer_barriers,
                &plan.image_barriers,
            );
        }
    }

    /// Builds/fetches the pipeline for `kind` and binds it.
    pub fn bind_pipeline(&mut self, kind: PipelineKind) -> Result<()> {
        match kind {
            PipelineKind::Compute { program } => {
                let program = self
                    .shaders
                    .get(program)
                    .ok_or(GraphError::IncompletePipeline("unknown compute program"))?;
                let mut cache = self.pipelines.borrow_mut();
                let pipeline = cache.get_compute(program)?;
                let layout = cache.pipeline_layout_for(program)?;
                drop(cache);

                unsafe {
                    self.dev
                        .cmd_bind_pipeline(self.cbuf, vk::PipelineBindPoint::COMPUTE, pipeline);
                }
                self.bind_point = Some(vk::PipelineBindPoint::COMPUTE);
                self.layout = Some(layout);
                self.subpass = None;
            }
            PipelineKind::Graphics {
                program,
                vertex_input,
                subpass,
                fixed_state,
            } => {
                let program = self
                    .shaders
                    .get(program)
                    .ok_or(GraphError::IncompletePipeline("unknown graphics program"))?;
                let mut cache = self.pipelines.borrow_mut();
                let render_pass = cache.get_render_pass(subpass)?;
                let pipeline = cache.get_graphics(program, vertex_input, subpass, fixed_state, render_pass)?;
                let layout = cache.pipeline_layout_for(program)?;
                drop(cache);

                unsafe {
                    self.dev
                        .cmd_bind_pipeline(self.cbuf, vk::PipelineBindPoint::GRAPHICS, pipeline);
                }
                self.bind_point = Some(vk::PipelineBindPoint::GRAPHICS);
                self.layout = Some(layout);
                self.subpass = Some(subpass);
            }
        }
        Ok(())
    }

    /// Creates/fetches the framebuffer for `views` at `(w, h)` and
    /// opens the render pass implied by the currently-bound graphics
    /// pipeline's subpass. Closes a previously
    /// open render pass first, if any.
    pub fn set_framebuffer(&mut self, w: u32, h: u32, views: &[vk::ImageView]) -> Result<()> {
        if self.render_pass_open {
            self.end_renderpass();
        }
        let subpass = self
            .subpass
            .ok_or(GraphError::IncompletePipeline("set_framebuffer needs a bound graphics pipeline"))?;

        let mut cache = self.pipelines.borrow_mut();
        let render_pass = cache.get_render_pass(subpass)?;
        let framebuffer = cache.get_framebuffer(render_pass, w, h, views)?;
        drop(cache);

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width: w, height: h },
            })
            .build();
        unsafe {
            self.dev
                .cmd_begin_render_pass(self.cbuf, &begin_info, vk::SubpassContents::INLINE);
        }
        self.render_pass_open = true;
        Ok(())
    }

    pub fn bind_descriptors_graphics(&self, first_set: u32, sets: &[vk::DescriptorSet], dynamic_offsets: &[u32]) -> Result<()> {
        let layout = self
            .layout
            .ok_or(GraphError::IncompletePipeline("no pipeline bound"))?;
        unsafe {
            self.dev.cmd_bind_descriptor_sets(
                self.cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
        Ok(())
    }

    pub fn bind_descriptors_compute(&self, first_set: u32, sets: &[vk::DescriptorSet], dynamic_offsets: &[u32]) -> Result<()> {
        let layout = self
            .layout
            .ok_or(GraphError::IncompletePipeline("no pipeline bound"))?;
        unsafe {
            self.dev.cmd_bind_descriptor_sets(
                self.cbuf,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
        Ok(())
    }

    /// Looks up the binder's staged set for `set_id` and binds it at
    /// `first_set`, using whatever dynamic offsets were staged
    /// alongside it. A thin convenience over
    /// `bind_descriptors_{graphics,compute}` for tasks that went
    /// through `DescriptorBinder::set` instead of
    /// `RenderResources::allocate_descriptor_set`.
    pub fn bind_staged_set_graphics(&self, first_set: u32, set_id: u64) -> Result<()> {
        let binder = self.binder.borrow();
        let set = binder.set_handle(set_id).ok_or(GraphError::UnknownBinding {
            set: set_id as u32,
            binding: 0,
        })?;
        let offsets = binder.dynamic_offsets(set_id).to_vec();
        drop(binder);
        self.bind_descriptors_graphics(first_set, &[set], &offsets)
    }

    pub fn bind_staged_set_compute(&self, first_set: u32, set_id: u64) -> Result<()> {
        let binder = self.binder.borrow();
        let set = binder.set_handle(set_id).ok_or(GraphError::UnknownBinding {
            set: set_id as u32,
            binding: 0,
        })?;
        let offsets = binder.dynamic_offsets(set_id).to_vec();
        drop(binder);
        self.bind_descriptors_compute(first_set, &[set], &offsets)
    }

    pub fn bind_viewport(&self, viewport: vk::Viewport) {
        unsafe { self.dev.cmd_set_viewport(self.cbuf, 0, &[viewport]) };
    }

    pub fn bind_scissors(&self, scissor: vk::Rect2D) {
        unsafe { self.dev.cmd_set_scissor(self.cbuf, 0, &[scissor]) };
    }

    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[u64]) {
        unsafe {
            self.dev
                .cmd_bind_vertex_buffers(self.cbuf, first_binding, buffers, offsets);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.dev.cmd_bind_index_buffer(self.cbuf, buffer, offset, index_type);
        }
    }

    /// Clears attachments via `vkCmdClearAttachments` rather than a
    /// render-pass clear op: the attachment is already in the layout the
    /// tracking table transitioned it to, so there is no load-time
    /// clear for the pass itself to perform.
    pub fn clear_color_attachments(&self, attachments: &[(u32, vk::ClearColorValue)], extent: vk::Extent2D) {
        let clears: Vec<vk::ClearAttachment> = attachments
            .iter()
            .map(|&(index, color)| vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: index,
                clear_value: vk::ClearValue { color },
            })
            .collect();
        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe { self.dev.cmd_clear_attachments(self.cbuf, &clears, &[rect]) };
    }

    pub fn clear_depth_attachment(&self, depth: f32, stencil: u32, extent: vk::Extent2D) {
        let clear = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        };
        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe { self.dev.cmd_clear_attachments(self.cbuf, &[clear], &[rect]) };
    }

    pub fn push_constants_graphics(&self, stage_flags: vk::ShaderStageFlags, offset: u32, data: &[u8]) -> Result<()> {
        let layout = self
            .layout
            .ok_or(GraphError::IncompletePipeline("no pipeline bound"))?;
        unsafe {
            self.dev.cmd_push_constants(self.cbuf, layout, stage_flags, offset, data);
        }
        Ok(())
    }

    pub fn push_constants_compute(&self, offset: u32, data: &[u8]) -> Result<()> {
        let layout = self
            .layout
            .ok_or(GraphError::IncompletePipeline("no pipeline bound"))?;
        unsafe {
            self.dev
                .cmd_push_constants(self.cbuf, layout, vk::ShaderStageFlags::COMPUTE, offset, data);
        }
        Ok(())
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.dev
                .cmd_draw(self.cbuf, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.dev.cmd_draw_indexed(
                self.cbuf,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { self.dev.cmd_dispatch(self.cbuf, x, y, z) };
    }

    pub fn dispatch_indirect(&self, buffer: vk::Buffer, offset: u64) {
        unsafe { self.dev.cmd_dispatch_indirect(self.cbuf, buffer, offset) };
    }

    pub fn end_renderpass(&mut self) {
        if self.render_pass_open {
            unsafe { self.dev.cmd_end_render_pass(self.cbuf) };
            self.render_pass_open = false;
        }
    }
}
