// Pipeline cache: interns compute and graphics pipelines keyed on the
// program plus (for graphics) vertex-input, subpass, and fixed-state
// descriptors, building each lazily on first use.
//
// Grounded on thundr's `Pipeline`/`PipelineType` shape (pipelines/mod.rs)
// for the "build once, cache by key, rebuild on demand" pattern.

use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;
use crate::shader::Program;

/// A vertex-input binding/attribute description, interned by value.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexInputInfo {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// The ordered attachment formats (plus depth) a graphics pipeline is
/// compiled against.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSubpassInfo {
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

/// Input-assembly, rasterization, and depth-stencil fixed-function state.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedStateInfo {
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GraphicsKey {
    program: String,
    vertex_input: usize,
    subpass: usize,
    fixed_state: usize,
}

fn intern<T: PartialEq + Clone>(table: &mut Vec<T>, value: &T) -> usize {
    if let Some(i) = table.iter().position(|v| v == value) {
        return i;
    }
    table.push(value.clone());
    table.len() - 1
}

/// Lazily builds and caches pipeline handles. Compute pipelines are
/// keyed by program name alone; graphics pipelines by the full
/// `(program, vertex-input, subpass, fixed-state)` tuple.
pub struct PipelineCache {
    device: Arc<Device>,
    vertex_inputs: Vec<VertexInputInfo>,
    subpasses: Vec<RenderSubpassInfo>,
    fixed_states: Vec<FixedStateInfo>,
    compute: HashMap<String, vk::Pipeline>,
    graphics: HashMap<GraphicsKey, vk::Pipeline>,
    pipeline_layouts: HashMap<String, vk::PipelineLayout>,
    /// Render passes, interned by subpass id -- compatible with every
    /// graphics pipeline built against that subpass. Uses LOAD_OP_LOAD/
    /// STORE_OP_STORE throughout: attachments enter the pass already in
    /// the layout the tracking table transitioned them to, and explicit
    /// clears go through `clear_color_attachments`/`clear_depth_attachment`
    /// rather than a render-pass clear op, so there is nothing for the
    /// pass itself to transition.
    render_passes: HashMap<usize, vk::RenderPass>,
    framebuffers: HashMap<(vk::RenderPass, u32, u32, Vec<vk::ImageView>), vk::Framebuffer>,
}

impl PipelineCache {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            vertex_inputs: Vec::new(),
            subpasses: Vec::new(),
            fixed_states: Vec::new(),
            compute: HashMap::new(),
            graphics: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    pub fn intern_vertex_input(&mut self, info: VertexInputInfo) -> usize {
        intern(&mut self.vertex_inputs, &info)
    }

    pub fn intern_subpass(&mut self, info: RenderSubpassInfo) -> usize {
        intern(&mut self.subpasses, &info)
    }

    pub fn intern_fixed_state(&mut self, info: FixedStateInfo) -> usize {
        intern(&mut self.fixed_states, &info)
    }

    /// Public wrapper over the lazily-built pipeline layout for
    /// `program`, so `cmd.rs` can bind descriptor sets / push constants
    /// against it without rebuilding the pipeline itself.
    pub fn pipeline_layout_for(&mut self, program: &Program) -> Result<vk::PipelineLayout> {
        self.pipeline_layout(program)
    }

    fn pipeline_layout(&mut self, program: &Program) -> Result<vk::PipelineLayout> {
        if let Some(&layout) = self.pipeline_layouts.get(&program.name) {
            return Ok(layout);
        }
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&program.layout_handles)
            .build();
        let layout = unsafe { self.device.dev.create_pipeline_layout(&info, None)? };
        self.pipeline_layouts.insert(program.name.clone(), layout);
        Ok(layout)
    }

    pub fn get_compute(&mut self, program: &Program) -> Result<vk::Pipeline> {
        if let Some(&p) = self.compute.get(&program.name) {
            return Ok(p);
        }

        let layout = self.pipeline_layout(program)?;
        let (_, module) = &program.stages[0];
        let entry = std::ffi::CString::new("main").unwrap();
        // compiling a shader module from the raw words reflection kept
        let shader_info = vk::ShaderModuleCreateInfo::builder()
            .code(&module.words)
            .build();
        let shader_module = unsafe { self.device.dev.create_shader_module(&shader_info, None)? };

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(&entry)
            .build();

        let info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let pipeline = unsafe {
            self.device
                .dev
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)?[0]
        };
        unsafe { self.device.dev.destroy_shader_module(shader_module, None) };

        self.compute.insert(program.name.clone(), pipeline);
        Ok(pipeline)
    }

    pub fn get_graphics(
        &mut self,
        program: &Program,
        vertex_input: usize,
        subpass: usize,
        fixed_state: usize,
        render_pass: vk::RenderPass,
    ) -> Result<vk::Pipeline> {
        let key = GraphicsKey {
            program: program.name.clone(),
            vertex_input,
            subpass,
            fixed_state,
        };
        if let Some(&p) = self.graphics.get(&key) {
            return Ok(p);
        }

        let layout = self.pipeline_layout(program)?;
        let vi = self.vertex_inputs[vertex_input].clone();
        let fs = self.fixed_states[fixed_state].clone();

        let entry = std::ffi::CString::new("main").unwrap();
        let mut shader_modules = Vec::with_capacity(program.stages.len());
        let mut stages = Vec::with_capacity(program.stages.len());
        for (stage_flag, module) in &program.stages {
            let shader_info = vk::ShaderModuleCreateInfo::builder().code(&module.words).build();
            let shader_module = unsafe { self.device.dev.create_shader_module(&shader_info, None)? };
            shader_modules.push(shader_module);
            stages.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(*stage_flag)
                    .module(shader_module)
                    .name(&entry)
                    .build(),
            );
        }

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vi.bindings)
            .vertex_attribute_descriptions(&vi.attributes)
            .build();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(fs.topology)
            .build();
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1)
            .build();
        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(fs.cull_mode)
            .front_face(fs.front_face)
            .line_width(1.0)
            .build();
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .build();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(fs.depth_test)
            .depth_write_enable(fs.depth_write)
            .depth_compare_op(fs.depth_compare)
            .build();

        let color_attachment_count = self.subpasses[subpass].color_formats.len();
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..color_attachment_count)
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .build()
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .build();

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipeline = unsafe {
            self.device
                .dev
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| e)?[0]
        };
        for m in shader_modules {
            unsafe { self.device.dev.destroy_shader_module(m, None) };
        }

        self.graphics.insert(key, pipeline);
        Ok(pipeline)
    }

    /// Fetches or builds the render pass compatible with `subpass`'s
    /// interned attachment-format list.
    pub fn get_render_pass(&mut self, subpass: usize) -> Result<vk::RenderPass> {
        if let Some(&rp) = self.render_passes.get(&subpass) {
            return Ok(rp);
        }

        let info = &self.subpasses[subpass];
        let mut attachments = Vec::with_capacity(info.color_formats.len() + 1);
        let mut color_refs = Vec::with_capacity(info.color_formats.len());

        for &format in &info.color_formats {
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let depth_ref = info.depth_format.map(|format| {
            let r = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            };
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            r
        });

        let mut subpass_desc = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass_desc = subpass_desc.depth_stencil_attachment(depth_ref);
        }
        let subpass_desc = subpass_desc.build();
        let subpasses = [subpass_desc];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .build();

        let rp = unsafe { self.device.dev.create_render_pass(&create_info, None)? };
        self.render_passes.insert(subpass, rp);
        Ok(rp)
    }

    /// Fetches or builds the framebuffer for `render_pass` at `(w, h)`
    /// over `views`, interned per the render-target lifecycle (created
    /// on first use, torn down with the cache).
    pub fn get_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        w: u32,
        h: u32,
        views: &[vk::ImageView],
    ) -> Result<vk::Framebuffer> {
        let key = (render_pass, w, h, views.to_vec());
        if let Some(&fb) = self.framebuffers.get(&key) {
            return Ok(fb);
        }

        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(views)
            .width(w)
            .height(h)
            .layers(1)
            .build();
        let fb = unsafe { self.device.dev.create_framebuffer(&info, None)? };
        self.framebuffers.insert(key, fb);
        Ok(fb)
    }

    /// Destroys every cached pipeline and layout; callers' next `get_*`
    /// rebuilds from the (already-reloaded) program.
    pub fn invalidate(&mut self) -> Result<()> {
        unsafe { self.device.dev.device_wait_idle()? };
        for (_, p) in self.compute.drain() {
            unsafe { self.device.dev.destroy_pipeline(p, None) };
        }
        for (_, p) in self.graphics.drain() {
            unsafe { self.device.dev.destroy_pipeline(p, None) };
        }
        for (_, l) in self.pipeline_layouts.drain() {
            unsafe { self.device.dev.destroy_pipeline_layout(l, None) };
        }
        for (_, fb) in self.framebuffers.drain() {
            unsafe { self.device.dev.destroy_framebuffer(fb, None) };
        }
        for (_, rp) in self.render_passes.drain() {
            unsafe { self.device.dev.destroy_render_pass(rp, None) };
        }
        Ok(())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.device.dev.device_wait_idle().ok();
            for (_, p) in self.compute.drain() {
                self.device.dev.destroy_pipeline(p, None);
            }
            for (_, p) in self.graphics.drain() {
                self.device.dev.destroy_pipeline(p, None);
            }
            for (_, l) in self.pipeline_layouts.drain() {
                self.device.dev.destroy_pipeline_layout(l, None);
            }
            for (_, fb) in self.framebuffers.drain() {
                self.device.dev.destroy_framebuffer(fb, None);
            }
            for (_, rp) in self.render_passes.drain() {
                self.device.dev.destroy_render_pass(rp, None);
            }
        }
    }
}
