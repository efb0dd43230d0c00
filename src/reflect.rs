// SPIR-V reflection: walks a compiled shader binary's instruction
// stream well enough to recover entry points, descriptor-set bindings,
// and push-constant ranges without a full disassembler.
//
// Grounded on ennis-autograph-ng's `autograph-spirv` crate, which reads
// `spirv_headers::Op` opcodes directly out of the word stream rather
// than pulling in a full SPIR-V parser -- the same approach is used
// here, trimmed to the handful of instructions a reflection pass needs.

use ash::vk;
use num_traits::FromPrimitive;
use spirv_headers::{Decoration, ExecutionModel, Op, StorageClass};
use std::collections::HashMap;

use crate::error::{GraphError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// One `(set, binding)` the module declares, with enough information
/// to build a `vk::DescriptorSetLayoutBinding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingInfo {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// zero means "bindless"; callers must cap the array at 1024 and
    /// mark it `VARIABLE_DESCRIPTOR_COUNT | PARTIALLY_BOUND`
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
}

pub struct ShaderModule {
    pub stage: vk::ShaderStageFlags,
    pub entry_point: String,
    pub bindings: Vec<BindingInfo>,
    pub push_constant: Option<PushConstantRange>,
    pub(crate) words: Vec<u32>,
}

fn stage_from_execution_model(model: ExecutionModel) -> Option<vk::ShaderStageFlags> {
    Some(match model {
        ExecutionModel::Vertex => vk::ShaderStageFlags::VERTEX,
        ExecutionModel::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        ExecutionModel::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        ExecutionModel::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ExecutionModel::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ExecutionModel::GLCompute => vk::ShaderStageFlags::COMPUTE,
        _ => return None,
    })
}

fn descriptor_type_from_storage_class(
    class: StorageClass,
    is_buffer_block: bool,
) -> Option<vk::DescriptorType> {
    Some(match class {
        StorageClass::UniformConstant => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        StorageClass::Uniform if is_buffer_block => vk::DescriptorType::STORAGE_BUFFER,
        StorageClass::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
        StorageClass::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        _ => return None,
    })
}

/// Reflects a SPIR-V binary's module-level metadata. Image/sampler
/// variables are assumed `COMBINED_IMAGE_SAMPLER` unless the caller's
/// program descriptor overrides them to `STORAGE_IMAGE`; that
/// override happens one layer up in `shader.rs`, since SPIR-V alone
/// does not distinguish "sampled image" from "storage image" at the
/// granularity reflection needs without walking type definitions in
/// full, which this pass intentionally does not do.
pub fn reflect(code: &[u8]) -> Result<ShaderModule> {
    if code.len() % 4 != 0 {
        return Err(GraphError::IncompletePipeline("shader binary is not word-aligned"));
    }
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if words.len() < 5 || words[0] != SPIRV_MAGIC {
        return Err(GraphError::IncompletePipeline("not a SPIR-V module"));
    }

    let mut stage = None;
    let mut entry_point = String::new();
    let mut decoration_binding: HashMap<u32, u32> = HashMap::new();
    let mut decoration_set: HashMap<u32, u32> = HashMap::new();
    let mut buffer_block_types: HashMap<u32, bool> = HashMap::new();
    let mut var_storage_class: HashMap<u32, StorageClass> = HashMap::new();
    let mut var_type: HashMap<u32, u32> = HashMap::new();
    let mut pointee_type: HashMap<u32, u32> = HashMap::new();

    let mut i = 5;
    while i < words.len() {
        let word = words[i];
        let len = (word >> 16) as usize;
        let opcode = (word & 0xFFFF) as u16;
        if len == 0 || i + len > words.len() {
            break;
        }
        let op: Option<Op> = FromPrimitive::from_u16(opcode);

        match op {
            Some(Op::EntryPoint) => {
                if let Some(model) = ExecutionModel::from_u32(words[i + 1]) {
                    stage = stage_from_execution_model(model);
                }
                // name is a null-terminated string starting at word i+3
                entry_point = decode_literal_string(&words[i + 3..i + len]);
            }
            Some(Op::Decorate) => {
                let target = words[i + 1];
                let decoration: Option<Decoration> = FromPrimitive::from_u32(words[i + 2]);
                match decoration {
                    Some(Decoration::Binding) => {
                        decoration_binding.insert(target, words[i + 3]);
                    }
                    Some(Decoration::DescriptorSet) => {
                        decoration_set.insert(target, words[i + 3]);
                    }
                    Some(Decoration::BufferBlock) => {
                        buffer_block_types.insert(target, true);
                    }
                    _ => {}
                }
            }
            Some(Op::TypePointer) => {
                let result_id = words[i + 1];
                if let Some(class) = StorageClass::from_u32(words[i + 2]) {
                    var_storage_class.insert(result_id, class);
                }
                pointee_type.insert(result_id, words[i + 3]);
            }
            Some(Op::Variable) => {
                let result_type = words[i + 1];
                let result_id = words[i + 2];
                var_type.insert(result_id, result_type);
            }
            _ => {}
        }

        i += len;
    }

    let stage = stage.ok_or(GraphError::IncompletePipeline("no OpEntryPoint found"))?;

    let mut bindings = Vec::new();
    for (&var_id, &ptr_type) in var_type.iter() {
        let (Some(&set), Some(&binding)) = (decoration_set.get(&var_id), decoration_binding.get(&var_id)) else {
            continue;
        };
        let Some(&class) = var_storage_class.get(&ptr_type) else {
            continue;
        };
        let pointee = pointee_type.get(&ptr_type).copied().unwrap_or(0);
        let is_buffer_block = buffer_block_types.get(&pointee).copied().unwrap_or(false);

        if let Some(descriptor_type) = descriptor_type_from_storage_class(class, is_buffer_block) {
            bindings.push(BindingInfo {
                set,
                binding,
                descriptor_type,
                count: 1,
            });
        }
    }
    bindings.sort_by_key(|b| (b.set, b.binding));

    Ok(ShaderModule {
        stage,
        entry_point,
        bindings,
        push_constant: None,
        words,
    })
}

fn decode_literal_string(words: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    'outer: for &w in words {
        for shift in [0, 8, 16, 24] {
            let b = ((w >> shift) & 0xFF) as u8;
            if b == 0 {
                break 'outer;
            }
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
