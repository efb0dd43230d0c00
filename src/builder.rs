// The setup-phase builder: the declaration API a task's `setup_fn`
// calls to describe its resource uses. Every method here runs immediately, before a single
// Vulkan command is recorded; it only ever touches the tracking table
// and the resource pools' read-only descriptors.
//
// Grounded directly on the declaration-kind table no example repo in
// the pack exposes an exact declarative-use API for; the mip/layer-range
// validation against `ImageDesc::in_range` follows the `OutOfRange`
// boundary behavior.

use ash::vk;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::pool::{BufferId, ImageId, ResourcePool};
use crate::resources::{Buffer, Image, ImageDesc, ImageSubresourceId, ImageViewId, ViewRange};
use crate::tracking::{BufferState, ImageSubresourceState};

/// Converts a set of shader stages into the pipeline stages that read
/// or write through them, by direct correspondence.
pub fn shader_stages_to_pipeline_stages(stages: vk::ShaderStageFlags) -> vk::PipelineStageFlags {
    let mut out = vk::PipelineStageFlags::empty();
    if stages.contains(vk::ShaderStageFlags::VERTEX) {
        out |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::TESSELLATION_CONTROL) {
        out |= vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::TESSELLATION_EVALUATION) {
        out |= vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::GEOMETRY) {
        out |= vk::PipelineStageFlags::GEOMETRY_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::FRAGMENT) {
        out |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(vk::ShaderStageFlags::COMPUTE) {
        out |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    out
}

/// Resolution/format information about the image backing an
/// `ImageViewId`, returned by `get_image_info`.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
}

/// One task's accumulated declarations, handed back to the graph
/// orchestrator once `setup_fn` returns so it can forward them to the
/// tracking table.
#[derive(Default)]
pub(crate) struct TaskDeclarations {
    pub images: Vec<(ImageSubresourceId, ImageSubresourceState)>,
    pub buffers: Vec<(BufferId, BufferState)>,
    pub prepare_backbuffer: bool,
}

/// The per-task setup builder. `setup_fn(data, builder)` declares every
/// resource use a task will make; the graph orchestrator runs
/// `setup_fn` synchronously inside `add_task` and consumes the
/// resulting declarations immediately.
pub struct TaskBuilder {
    images: Arc<ResourcePool<ImageId, Image>>,
    buffers: Arc<ResourcePool<BufferId, Buffer>>,
    decls: TaskDeclarations,
}

fn full_range(desc: &ImageDesc, view_type: vk::ImageViewType) -> ViewRange {
    ViewRange {
        view_type,
        aspect: desc.aspect,
        base_mip: 0,
        mip_count: desc.mip_levels,
        base_layer: 0,
        layer_count: desc.array_layers,
    }
}

impl TaskBuilder {
    pub(crate) fn new(images: Arc<ResourcePool<ImageId, Image>>, buffers: Arc<ResourcePool<BufferId, Buffer>>) -> Self {
        Self {
            images,
            buffers,
            decls: TaskDeclarations::default(),
        }
    }

    pub(crate) fn finish(self) -> TaskDeclarations {
        self.decls
    }

    fn image_desc(&self, image: ImageId) -> Result<ImageDesc> {
        Ok(self.images.get(image)?.descriptor())
    }

    /// Returns the format/aspect/mip/layer descriptor of the image
    /// backing `view`.
    pub fn get_image_info(&self, view: ImageViewId) -> Result<ImageInfo> {
        let desc = self.image_desc(view.image)?;
        Ok(ImageInfo {
            format: desc.format,
            aspect: desc.aspect,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
        })
    }

    fn declare_view(&mut self, view: ImageViewId, state: ImageSubresourceState) -> Result<()> {
        let desc = self.image_desc(view.image)?;
        let range = view.range;
        let last_mip = range.base_mip + range.mip_count;
        let last_layer = range.base_layer + range.layer_count;
        if last_mip > desc.mip_levels || last_layer > desc.array_layers {
            return Err(GraphError::OutOfRange);
        }

        for mip in range.base_mip..last_mip {
            for layer in range.base_layer..last_layer {
                let subresource = ImageSubresourceId {
                    image: view.image,
                    mip,
                    layer,
                };
                self.decls.images.push((subresource, state));
            }
        }
        Ok(())
    }

    fn declare_whole_image(
        &mut self,
        image: ImageId,
        view_type: vk::ImageViewType,
        state: ImageSubresourceState,
    ) -> Result<ImageViewId> {
        let desc = self.image_desc(image)?;
        let range = full_range(&desc, view_type);
        let view = ImageViewId { image, range };
        self.declare_view(view, state)?;
        Ok(view)
    }

    /// `use_color_attachment(view)`.
    pub fn use_color_attachment(&mut self, view: ImageViewId) -> Result<()> {
        self.declare_view(
            view,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
        )
    }

    /// `use_depth_attachment(view)`.
    pub fn use_depth_attachment(&mut self, view: ImageViewId) -> Result<()> {
        self.declare_view(
            view,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            },
        )
    }

    /// `use_storage_image(view, shader_stages)`.
    pub fn use_storage_image(&mut self, view: ImageViewId, shader_stages: vk::ShaderStageFlags) -> Result<()> {
        self.declare_view(
            view,
            ImageSubresourceState {
                stages: shader_stages_to_pipeline_stages(shader_stages),
                access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
        )
    }

    /// `sample_image(view, shader_stages)`.
    pub fn sample_image(&mut self, view: ImageViewId, shader_stages: vk::ShaderStageFlags) -> Result<()> {
        self.declare_view(
            view,
            ImageSubresourceState {
                stages: shader_stages_to_pipeline_stages(shader_stages),
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        )
    }

    /// `sample_cubemap(image, shader_stages)`: all 6 layers, all mips
    ///.
    pub fn sample_cubemap(&mut self, image: ImageId, shader_stages: vk::ShaderStageFlags) -> Result<ImageViewId> {
        self.declare_whole_image(
            image,
            vk::ImageViewType::CUBE,
            ImageSubresourceState {
                stages: shader_stages_to_pipeline_stages(shader_stages),
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        )
    }

    /// `use_uniform_buffer(buffer, shader_stages)`.
    pub fn use_uniform_buffer(&mut self, buffer: BufferId, shader_stages: vk::ShaderStageFlags) {
        self.decls.buffers.push((
            buffer,
            BufferState {
                stages: shader_stages_to_pipeline_stages(shader_stages),
                access: vk::AccessFlags::UNIFORM_READ,
            },
        ));
    }

    /// `use_storage_buffer(buffer, shader_stages, readonly)`.
    pub fn use_storage_buffer(&mut self, buffer: BufferId, shader_stages: vk::ShaderStageFlags, readonly: bool) {
        let mut access = vk::AccessFlags::SHADER_READ;
        if !readonly {
            access |= vk::AccessFlags::SHADER_WRITE;
        }
        self.decls.buffers.push((
            buffer,
            BufferState {
                stages: shader_stages_to_pipeline_stages(shader_stages),
                access,
            },
        ));
    }

    /// `use_indirect_buffer(buffer)`.
    pub fn use_indirect_buffer(&mut self, buffer: BufferId) {
        self.decls.buffers.push((
            buffer,
            BufferState {
                stages: vk::PipelineStageFlags::DRAW_INDIRECT,
                access: vk::AccessFlags::INDIRECT_COMMAND_READ,
            },
        ));
    }

    /// `transfer_read(view)`.
    pub fn transfer_read(&mut self, view: ImageViewId) -> Result<()> {
        self.declare_view(
            view,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_READ,
                layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            },
        )
    }

    /// `transfer_write(image, view)`.
    pub fn transfer_write_image(&mut self, view: ImageViewId) -> Result<()> {
        self.declare_view(
            view,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_WRITE,
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
        )
    }

    /// `transfer_read(buffer)` -- the buffer-side counterpart of
    /// `transfer_read` (transfer declarations apply to "image_or_buffer").
    pub fn transfer_read_buffer(&mut self, buffer: BufferId) {
        self.decls.buffers.push((
            buffer,
            BufferState {
                stages: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_READ,
            },
        ));
    }

    /// `transfer_write(buffer)`.
    pub fn transfer_write_buffer(&mut self, buffer: BufferId) {
        self.decls.buffers.push((
            buffer,
            BufferState {
                stages: vk::PipelineStageFlags::TRANSFER,
                access: vk::AccessFlags::TRANSFER_WRITE,
            },
        ));
    }

    /// `prepare_backbuffer()`: the last declaration a frame
    /// makes against the backbuffer before presenting. Flags this frame
    /// as present-worthy for the orchestrator's `submit()`.
    pub fn prepare_backbuffer(&mut self, backbuffer: ImageId) -> Result<()> {
        self.decls.prepare_backbuffer = true;
        self.declare_whole_image(
            backbuffer,
            vk::ImageViewType::TYPE_2D,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                access: vk::AccessFlags::empty(),
                layout: vk::ImageLayout::PRESENT_SRC_KHR,
            },
        )?;
        Ok(())
    }

    /// `use_backbuffer_attachment()`: convenience wrapper
    /// over `use_color_attachment` for the stable backbuffer id.
    pub fn use_backbuffer_attachment(&mut self, backbuffer: ImageId) -> Result<ImageViewId> {
        self.declare_whole_image(
            backbuffer,
            vk::ImageViewType::TYPE_2D,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
        )
    }
}

