// Shader-program registry: loads reflected modules into named
// programs, interns descriptor-set layouts across stages, and
// validates the stage combination.
//
// Grounded on thundr's `Pipeline` stage-flag bookkeeping style
// (pipelines/mod.rs) for naming, generalized from "one fixed pipeline"
// to an arbitrary interned set of programs built from reflected SPIR-V.

use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{GraphError, Result};
use crate::reflect::{self, BindingInfo, ShaderModule};

const BINDLESS_CAP: u32 = 1024;

/// A bucket of bindings for one descriptor-set number, collapsed
/// across every stage of a program.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayoutInfo {
    pub set: u32,
    pub bindings: Vec<(BindingInfo, vk::ShaderStageFlags)>,
}

pub struct Program {
    pub name: String,
    pub stages: Vec<(vk::ShaderStageFlags, ShaderModule)>,
    pub set_layouts: Vec<DescriptorSetLayoutInfo>,
    pub(crate) layout_handles: Vec<vk::DescriptorSetLayout>,
}

fn validate_stage_set(stages: &[vk::ShaderStageFlags]) -> Result<()> {
    let mut seen = vk::ShaderStageFlags::empty();
    for &s in stages {
        if seen.contains(s) {
            return Err(GraphError::StageReuse(s));
        }
        seen |= s;
    }

    let is_compute_only = seen == vk::ShaderStageFlags::COMPUTE;
    let graphics_mask = vk::ShaderStageFlags::VERTEX
        | vk::ShaderStageFlags::TESSELLATION_CONTROL
        | vk::ShaderStageFlags::TESSELLATION_EVALUATION
        | vk::ShaderStageFlags::GEOMETRY
        | vk::ShaderStageFlags::FRAGMENT;
    let is_graphics_subset = !seen.is_empty() && graphics_mask.contains(seen);

    if is_compute_only || is_graphics_subset {
        Ok(())
    } else {
        Err(GraphError::IncompletePipeline(
            "program stages must be {compute} alone or a subset of the graphics stages",
        ))
    }
}

fn merge_bindings(
    stages: &[(vk::ShaderStageFlags, ShaderModule)],
) -> Result<Vec<DescriptorSetLayoutInfo>> {
    let mut by_set: HashMap<u32, Vec<(BindingInfo, vk::ShaderStageFlags)>> = HashMap::new();

    for (stage_flag, module) in stages {
        for binding in &module.bindings {
            let set_bucket = by_set.entry(binding.set).or_default();
            if let Some((existing, flags)) = set_bucket
                .iter_mut()
                .find(|(b, _)| b.binding == binding.binding)
            {
                if existing.descriptor_type != binding.descriptor_type || existing.count != binding.count {
                    return Err(GraphError::LayoutMismatch {
                        set: binding.set,
                        binding: binding.binding,
                    });
                }
                *flags |= *stage_flag;
            } else {
                set_bucket.push((*binding, *stage_flag));
            }
        }
    }

    let mut sets: Vec<DescriptorSetLayoutInfo> = by_set
        .into_iter()
        .map(|(set, bindings)| DescriptorSetLayoutInfo { set, bindings })
        .collect();
    sets.sort_by_key(|s| s.set);
    Ok(sets)
}

/// Owns every interned program and descriptor-set layout, plus the raw
/// module bytes needed to rebuild them on `reload()`.
pub struct ShaderRegistry {
    device: Arc<Device>,
    programs: HashMap<String, Program>,
    module_sources: HashMap<String, Vec<(vk::ShaderStageFlags, String, Vec<u8>)>>,
}

impl ShaderRegistry {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            programs: HashMap::new(),
            module_sources: HashMap::new(),
        }
    }

    /// Reflects and interns a named program from `(stage, entry, code)`
    /// tuples. Re-registering an existing name replaces it.
    pub fn register_program(
        &mut self,
        name: &str,
        modules: &[(vk::ShaderStageFlags, &str, &[u8])],
    ) -> Result<()> {
        let mut stages = Vec::new();
        let mut stage_flags = Vec::new();
        for &(stage, _entry, code) in modules {
            let reflected = reflect::reflect(code)?;
            stage_flags.push(stage);
            stages.push((stage, reflected));
        }
        validate_stage_set(&stage_flags)?;
        let set_layouts = merge_bindings(&stages)?;

        let mut layout_handles = Vec::with_capacity(set_layouts.len());
        for layout_info in &set_layouts {
            layout_handles.push(self.create_descriptor_set_layout(layout_info)?);
        }

        self.module_sources.insert(
            name.to_string(),
            modules
                .iter()
                .map(|&(stage, entry, code)| (stage, entry.to_string(), code.to_vec()))
                .collect(),
        );

        if let Some(old) = self.programs.insert(
            name.to_string(),
            Program {
                name: name.to_string(),
                stages,
                set_layouts,
                layout_handles,
            },
        ) {
            self.destroy_program(old);
        }

        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        info: &DescriptorSetLayoutInfo,
    ) -> Result<vk::DescriptorSetLayout> {
        let mut bindings = Vec::with_capacity(info.bindings.len());
        let mut binding_flags = Vec::with_capacity(info.bindings.len());

        for (binding, stage_flags) in &info.bindings {
            let is_bindless = binding.count == 0;
            let count = if is_bindless { BINDLESS_CAP } else { binding.count };

            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(count)
                    .stage_flags(*stage_flags)
                    .build(),
            );

            binding_flags.push(if is_bindless {
                vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                    | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            } else {
                vk::DescriptorBindingFlags::empty()
            });
        }

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let mut create_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .push_next(&mut flags_info)
            .build();
        create_info.p_next = &flags_info as *const _ as *const std::ffi::c_void;

        Ok(unsafe {
            self.device
                .dev
                .create_descriptor_set_layout(&create_info, None)?
        })
    }

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.get(name)
    }

    fn destroy_program(&self, program: Program) {
        unsafe {
            for layout in program.layout_handles {
                self.device.dev.destroy_descriptor_set_layout(layout, None);
            }
        }
    }

    /// Waits for device idle, destroys every interned layout, and
    /// re-reflects every registered program from its stored source
    /// bytes.
    pub fn reload(&mut self) -> Result<()> {
        unsafe { self.device.dev.device_wait_idle()? };

        let names: Vec<String> = self.module_sources.keys().cloned().collect();
        for name in names {
            let modules = self.module_sources[&name].clone();
            let refs: Vec<(vk::ShaderStageFlags, &str, &[u8])> = modules
                .iter()
                .map(|(stage, entry, code)| (*stage, entry.as_str(), code.as_slice()))
                .collect();
            self.register_program(&name, &refs)?;
        }
        Ok(())
    }
}

impl Drop for ShaderRegistry {
    fn drop(&mut self) {
        for (_, program) in self.programs.drain() {
            self.destroy_program(program);
        }
    }
}
