// Descriptor binder: per-frame transient descriptor-set allocation
// and write-batching.
//
// Grounded on thundr's `DescPool` (descpool.rs) for the
// grow-a-new-pool-when-full pattern, generalized from "one fixed
// combined-image-sampler layout" to "any program-provided layout" and
// from one shared pool to one pool per frame-in-flight.

use ash::vk;
use std::collections::HashMap;

use crate::error::{GraphError, Result};

const POOL_MAX_SETS: u32 = 512;

/// One binding value staged for a descriptor set slot.
#[derive(Clone)]
pub enum BindingValue {
    Image(Vec<vk::DescriptorImageInfo>),
    Buffer(Vec<vk::DescriptorBufferInfo>),
}

struct StagedSet {
    layout: vk::DescriptorSetLayout,
    descriptor_type: HashMap<u32, vk::DescriptorType>,
    bindings: HashMap<u32, BindingValue>,
    dirty: bool,
    /// the set allocated for this slot last flush, reused via
    /// copy-through when nothing changed this frame
    last_set: Option<vk::DescriptorSet>,
    dynamic_offsets: Vec<u32>,
}

/// One frame-in-flight's worth of descriptor pools plus the staged
/// binding values waiting to be written at the next `flush`.
pub struct FrameDescriptorState {
    pools: Vec<vk::DescriptorPool>,
    allocated_in_current_pool: u32,
    sets: HashMap<u64, StagedSet>,
}

impl FrameDescriptorState {
    fn new() -> Self {
        Self {
            pools: Vec::new(),
            allocated_in_current_pool: 0,
            sets: HashMap::new(),
        }
    }
}

/// Owns `N` frame-local descriptor pools and the staging arrays for
/// whatever sets are currently bound. `set_id` is an opaque key the
/// caller assigns per logical descriptor-set slot in its record-time
/// code (usually `(program_id, set_index)` packed into a u64).
pub struct DescriptorBinder {
    dev: ash::Device,
    frames: Vec<FrameDescriptorState>,
    current_frame: usize,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorBinder {
    pub fn new(dev: ash::Device, frames_count: usize) -> Self {
        let pool_sizes = vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: POOL_MAX_SETS * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: POOL_MAX_SETS * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: POOL_MAX_SETS * 4,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: POOL_MAX_SETS * 4,
            },
        ];

        Self {
            dev,
            frames: (0..frames_count).map(|_| FrameDescriptorState::new()).collect(),
            current_frame: 0,
            pool_sizes,
        }
    }

    /// Free function, not a method: called while a `&mut
    /// FrameDescriptorState` borrowed out of `self.frames` is already
    /// live, so it takes exactly the disjoint fields it needs instead
    /// of re-borrowing all of `self`.
    fn add_pool(dev: &ash::Device, pool_sizes: &[vk::DescriptorPoolSize], frame: &mut FrameDescriptorState) -> Result<()> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(pool_sizes)
            .max_sets(POOL_MAX_SETS)
            .build();
        let pool = unsafe { dev.create_descriptor_pool(&info, None)? };
        frame.pools.push(pool);
        frame.allocated_in_current_pool = 0;
        Ok(())
    }

    /// Resets this frame's pools for reuse -- called by the frame
    /// pacer's `begin()` once the frame's fence has signalled, so any
    /// sets allocated from them last time are known to be unused by
    /// the device.
    pub fn begin_frame(&mut self, frame_index: usize) -> Result<()> {
        self.current_frame = frame_index;
        let frame = &mut self.frames[frame_index];
        for pool in &frame.pools {
            unsafe { self.dev.reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())? };
        }
        frame.allocated_in_current_pool = 0;
        for set in frame.sets.values_mut() {
            set.last_set = None;
            set.dirty = true;
        }
        Ok(())
    }

    fn declare_set(
        &mut self,
        set_id: u64,
        layout: vk::DescriptorSetLayout,
        descriptor_types: &[(u32, vk::DescriptorType)],
    ) {
        let frame = &mut self.frames[self.current_frame];
        frame.sets.entry(set_id).or_insert_with(|| StagedSet {
            layout,
            descriptor_type: descriptor_types.iter().copied().collect(),
            bindings: HashMap::new(),
            dirty: true,
            last_set: None,
            dynamic_offsets: Vec::new(),
        });
    }

    /// Writes `value` into the staging array for `(set_id, binding)`,
    /// marking the slot dirty. Fails with `UnknownBinding` if the set
    /// was never declared for this layout.
    pub fn set(&mut self, set_id: u64, binding: u32, value: BindingValue) -> Result<()> {
        let frame = &mut self.frames[self.current_frame];
        let staged = frame.sets.get_mut(&set_id).ok_or(GraphError::UnknownBinding {
            set: set_id as u32,
            binding,
        })?;
        if !staged.descriptor_type.contains_key(&binding) {
            return Err(GraphError::UnknownBinding {
                set: set_id as u32,
                binding,
            });
        }
        staged.bindings.insert(binding, value);
        staged.dirty = true;
        Ok(())
    }

    /// Sets the dynamic-offset side-array for a uniform/storage
    /// buffer binding that uses `VK_DESCRIPTOR_TYPE_*_DYNAMIC`. These
    /// are rebound on every flush without touching the set itself.
    pub fn set_dynamic_offsets(&mut self, set_id: u64, offsets: Vec<u32>) {
        if let Some(staged) = self.frames[self.current_frame].sets.get_mut(&set_id) {
            staged.dynamic_offsets = offsets;
        }
    }

    pub fn dynamic_offsets(&self, set_id: u64) -> &[u32] {
        self.frames[self.current_frame]
            .sets
            .get(&set_id)
            .map(|s| s.dynamic_offsets.as_slice())
            .unwrap_or(&[])
    }

    /// Allocates fresh sets for every dirty slot, writes their
    /// bindings, and leaves clean slots pointing at their previous
    /// frame's set.
    pub fn flush(&mut self) -> Result<()> {
        let frame = &mut self.frames[self.current_frame];

        // collect work first so we don't hold a live mutable borrow
        // of `frame.sets` while also mutating `frame.pools`
        let dirty_ids: Vec<u64> = frame
            .sets
            .iter()
            .filter(|(_, s)| s.dirty || s.last_set.is_none())
            .map(|(id, _)| *id)
            .collect();

        for id in dirty_ids {
            let layout = frame.sets[&id].layout;

            if frame.pools.is_empty() || frame.allocated_in_current_pool >= POOL_MAX_SETS {
                Self::add_pool(&self.dev, &self.pool_sizes, frame)?;
            }
            let pool = *frame.pools.last().unwrap();
            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts)
                .build();

            let set = match unsafe { self.dev.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => sets[0],
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                    Self::add_pool(&self.dev, &self.pool_sizes, frame)?;
                    let pool = *frame.pools.last().unwrap();
                    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                        .descriptor_pool(pool)
                        .set_layouts(&layouts)
                        .build();
                    unsafe { self.dev.allocate_descriptor_sets(&alloc_info)? }[0]
                }
                Err(e) => return Err(GraphError::from(e)),
            };
            frame.allocated_in_current_pool += 1;

            let staged = frame.sets.get_mut(&id).unwrap();
            self.write_set(set, staged);
            staged.last_set = Some(set);
            staged.dirty = false;
        }

        Ok(())
    }

    fn write_set(&self, set: vk::DescriptorSet, staged: &StagedSet) {
        let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::new();
        let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::new();
        let mut writes = Vec::new();

        for (&binding, value) in staged.bindings.iter() {
            let ty = *staged.descriptor_type.get(&binding).unwrap();
            match value {
                BindingValue::Image(infos) => {
                    image_infos.push(infos.clone());
                    let idx = image_infos.len() - 1;
                    writes.push((binding, ty, idx, true));
                }
                BindingValue::Buffer(infos) => {
                    buffer_infos.push(infos.clone());
                    let idx = buffer_infos.len() - 1;
                    writes.push((binding, ty, idx, false));
                }
            }
        }

        let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|&(binding, ty, idx, is_image)| {
                let mut builder = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .dst_array_element(0)
                    .descriptor_type(ty);
                builder = if is_image {
                    builder.image_info(&image_infos[idx])
                } else {
                    builder.buffer_info(&buffer_infos[idx])
                };
                builder.build()
            })
            .collect();

        if !descriptor_writes.is_empty() {
            unsafe { self.dev.update_descriptor_sets(&descriptor_writes, &[]) };
        }
    }

    pub fn set_handle(&self, set_id: u64) -> Option<vk::DescriptorSet> {
        self.frames[self.current_frame]
            .sets
            .get(&set_id)
            .and_then(|s| s.last_set)
    }

    pub fn declare_and_get(
        &mut self,
        set_id: u64,
        layout: vk::DescriptorSetLayout,
        descriptor_types: &[(u32, vk::DescriptorType)],
    ) {
        self.declare_set(set_id, layout, descriptor_types);
    }

    /// Allocates one descriptor set from this frame's pool directly,
    /// bypassing the staged-write bookkeeping `set`/`flush` use. This
    /// is the `allocate_descriptor_set(layout) -> set` primitive
    /// `RenderResources` exposes, for callers that fill the set's
    /// bindings themselves via `update_descriptor_sets` rather than
    /// going through the binder's per-`set_id` staging slots.
    pub fn allocate_descriptor_set(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let frame = &mut self.frames[self.current_frame];
        if frame.pools.is_empty() || frame.allocated_in_current_pool >= POOL_MAX_SETS {
            Self::add_pool(&self.dev, &self.pool_sizes, frame)?;
        }
        let layouts = [layout];
        let pool = *frame.pools.last().unwrap();
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .build();

        let set = match unsafe { self.dev.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                Self::add_pool(&self.dev, &self.pool_sizes, frame)?;
                let pool = *frame.pools.last().unwrap();
                let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts)
                    .build();
                unsafe { self.dev.allocate_descriptor_sets(&alloc_info)? }[0]
            }
            Err(e) => return Err(GraphError::from(e)),
        };
        frame.allocated_in_current_pool += 1;
        Ok(set)
    }
}

impl Drop for DescriptorBinder {
    fn drop(&mut self) {
        unsafe {
            for frame in &self.frames {
                for pool in &frame.pools {
                    self.dev.destroy_descriptor_pool(*pool, None);
                }
            }
        }
    }
}
