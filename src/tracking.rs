// Tracking & barrier synthesis -- the heart of the graph.
//
// This module is pure data transformation over stage/access/layout
// state; it never touches a Vulkan instance directly, which is what
// lets it be exercised by plain `#[test]` functions without a device.
// The actual `vk::ImageMemoryBarrier`/`vk::BufferMemoryBarrier`
// structs it builds are handed to the command-context (cmd.rs) to
// submit via `cmd_pipeline_barrier`.
//
// Grounded on the flat-barrier-list-by-task-index shape carried over
// from the original C++ rendergraph's `std::vector<Barrier>`, and on
// the single accumulated src_stages/dst_stages-per-edge combination
// thundr's `VkBarriers` (renderer.rs) groups acquire/release barriers
// into.

use ash::vk;
use std::collections::HashMap;

use crate::pool::{BufferId, ImageId};
use crate::resources::ImageSubresourceId;

/// Access bits that make a use a write for the purposes of the
/// read-merging rule.
fn write_bits() -> vk::AccessFlags {
    vk::AccessFlags::SHADER_WRITE
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        | vk::AccessFlags::TRANSFER_WRITE
        | vk::AccessFlags::MEMORY_WRITE
}

fn is_read_only(access: vk::AccessFlags) -> bool {
    (access & write_bits()).is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSubresourceState {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl ImageSubresourceState {
    fn undefined() -> Self {
        Self {
            stages: vk::PipelineStageFlags::TOP_OF_PIPE,
            access: vk::AccessFlags::empty(),
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl BufferState {
    fn undefined() -> Self {
        Self {
            stages: vk::PipelineStageFlags::TOP_OF_PIPE,
            access: vk::AccessFlags::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub subresource: ImageSubresourceId,
    pub src: ImageSubresourceState,
    pub dst: ImageSubresourceState,
    pub acquire: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferBarrier {
    pub buffer: BufferId,
    pub src: BufferState,
    pub dst: BufferState,
    pub acquire: bool,
}

/// All the barriers that must be emitted at one task edge, i.e.
/// before the task at that index runs.
#[derive(Debug, Clone, Default)]
pub struct TaskBarriers {
    pub images: Vec<ImageBarrier>,
    pub buffers: Vec<BufferBarrier>,
}

impl TaskBarriers {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }
}

struct ImageEntry {
    src: ImageSubresourceState,
    dst: Option<ImageSubresourceState>,
    barrier_id: usize,
    acquire_barrier: bool,
}

struct BufferEntry {
    src: BufferState,
    dst: Option<BufferState>,
    barrier_id: usize,
    acquire_barrier: bool,
}

/// Per-subresource / per-buffer tracking state, plus the flat,
/// ordered list of barrier records keyed by task-edge index.
///
/// Lives for the whole graph, not just one frame: each subresource's
/// `src_state` is retained across `submit()` so the first use of the
/// next frame produces a normal transition barrier rather than an
/// `UNDEFINED` discard.
pub struct TrackingTable {
    images: HashMap<ImageSubresourceId, ImageEntry>,
    buffers: HashMap<BufferId, BufferEntry>,
    barriers: Vec<TaskBarriers>,
}

impl TrackingTable {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            buffers: HashMap::new(),
            barriers: Vec::new(),
        }
    }

    /// Clears this frame's barrier list and makes room for
    /// `task_count` task edges. Subresource state is untouched.
    pub fn begin_frame(&mut self, task_count: usize) {
        self.barriers.clear();
        self.barriers.resize_with(task_count, TaskBarriers::default);
        // a use declared against a subresource that had no uses last
        // frame must start a fresh window this frame
        for entry in self.images.values_mut() {
            entry.dst = None;
        }
        for entry in self.buffers.values_mut() {
            entry.dst = None;
        }
    }

    fn ensure_len(&mut self, len: usize) {
        if self.barriers.len() < len {
            self.barriers.resize_with(len, TaskBarriers::default);
        }
    }

    /// Records a use of `subresource` by the task at `task_index`,
    /// applying the merge rule or flushing the pending
    /// window and opening a new one.
    pub fn use_image(
        &mut self,
        task_index: usize,
        subresource: ImageSubresourceId,
        new: ImageSubresourceState,
    ) {
        self.ensure_len(task_index + 1);

        let entry = self.images.entry(subresource).or_insert_with(|| ImageEntry {
            src: ImageSubresourceState::undefined(),
            dst: None,
            barrier_id: task_index,
            acquire_barrier: true,
        });

        match entry.dst {
            None => {
                entry.dst = Some(new);
                entry.barrier_id = task_index;
            }
            Some(existing) => {
                let mergeable =
                    existing.layout == new.layout && is_read_only(existing.access) && is_read_only(new.access);
                if mergeable {
                    entry.dst = Some(ImageSubresourceState {
                        stages: existing.stages | new.stages,
                        access: existing.access | new.access,
                        layout: existing.layout,
                    });
                } else {
                    self.barriers[entry.barrier_id].images.push(ImageBarrier {
                        subresource,
                        src: entry.src,
                        dst: existing,
                        acquire: entry.acquire_barrier,
                    });
                    entry.src = existing;
                    entry.dst = Some(new);
                    entry.barrier_id = task_index;
                    entry.acquire_barrier = false;
                }
            }
        }
    }

    /// Records a use of `buffer` by the task at `task_index`.
    pub fn use_buffer(&mut self, task_index: usize, buffer: BufferId, new: BufferState) {
        self.ensure_len(task_index + 1);

        let entry = self.buffers.entry(buffer).or_insert_with(|| BufferEntry {
            src: BufferState::undefined(),
            dst: None,
            barrier_id: task_index,
            acquire_barrier: true,
        });

        match entry.dst {
            None => {
                entry.dst = Some(new);
                entry.barrier_id = task_index;
            }
            Some(existing) => {
                let mergeable = is_read_only(existing.access) && is_read_only(new.access);
                if mergeable {
                    entry.dst = Some(BufferState {
                        stages: existing.stages | new.stages,
                        access: existing.access | new.access,
                    });
                } else {
                    self.barriers[entry.barrier_id].buffers.push(BufferBarrier {
                        buffer,
                        src: entry.src,
                        dst: existing,
                        acquire: entry.acquire_barrier,
                    });
                    entry.src = existing;
                    entry.dst = Some(new);
                    entry.barrier_id = task_index;
                    entry.acquire_barrier = false;
                }
            }
        }
    }

    /// At `submit`, flush every subresource/buffer with a pending
    /// window: emit its transition at its opening edge, then advance
    /// `src := dst`.
    pub fn flush(&mut self) {
        for (&subresource, entry) in self.images.iter_mut() {
            if let Some(dst) = entry.dst.take() {
                self.barriers[entry.barrier_id].images.push(ImageBarrier {
                    subresource,
                    src: entry.src,
                    dst,
                    acquire: entry.acquire_barrier,
                });
                entry.src = dst;
                entry.acquire_barrier = false;
            }
        }
        for (&buffer, entry) in self.buffers.iter_mut() {
            if let Some(dst) = entry.dst.take() {
                self.barriers[entry.barrier_id].buffers.push(BufferBarrier {
                    buffer,
                    src: entry.src,
                    dst,
                    acquire: entry.acquire_barrier,
                });
                entry.src = dst;
                entry.acquire_barrier = false;
            }
        }
    }

    /// Number of task edges currently tracked.
    pub fn barrier_count(&self) -> usize {
        self.barriers.len()
    }

    pub fn barriers_at(&self, task_index: usize) -> &TaskBarriers {
        &self.barriers[task_index]
    }

    /// Forgets a subresource entirely (used when its owning image is
    /// destroyed, so a reused slot starts from `UNDEFINED` again).
    pub fn forget_image(&mut self, image: ImageId) {
        self.images.retain(|k, _| k.image != image);
    }

    pub fn forget_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
    }
}

/// A fully-built pipeline-barrier command, ready to hand to
/// `cmd_pipeline_barrier`: every image/buffer barrier for one task
/// edge combined into a single call, with `src_stages`/`dst_stages`
/// accumulated across members.
pub struct PipelineBarrierPlan {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub image_barriers: Vec<vk::ImageMemoryBarrier>,
    pub buffer_barriers: Vec<vk::BufferMemoryBarrier>,
}

/// Builds the combined barrier plan for one task edge, or `None` if
/// there is nothing to synchronize there -- "a barrier with no
/// sub-barriers is elided".
pub fn build_pipeline_barrier(
    barriers: &TaskBarriers,
    resolve_image: impl Fn(ImageId) -> (vk::Image, vk::ImageAspectFlags),
    resolve_buffer: impl Fn(BufferId) -> vk::Buffer,
) -> Option<PipelineBarrierPlan> {
    if barriers.is_empty() {
        return None;
    }

    let mut src_stage = vk::PipelineStageFlags::empty();
    let mut dst_stage = vk::PipelineStageFlags::empty();
    let mut image_barriers = Vec::with_capacity(barriers.images.len());
    let mut buffer_barriers = Vec::with_capacity(barriers.buffers.len());

    for b in &barriers.images {
        src_stage |= b.src.stages;
        dst_stage |= b.dst.stages;
        let (image, aspect) = resolve_image(b.subresource.image);
        image_barriers.push(
            vk::ImageMemoryBarrier::builder()
                .image(image)
                .src_access_mask(b.src.access)
                .dst_access_mask(b.dst.access)
                .old_layout(b.src.layout)
                .new_layout(b.dst.layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(aspect)
                        .base_mip_level(b.subresource.mip)
                        .level_count(1)
                        .base_array_layer(b.subresource.layer)
                        .layer_count(1)
                        .build(),
                )
                .build(),
        );
    }

    for b in &barriers.buffers {
        src_stage |= b.src.stages;
        dst_stage |= b.dst.stages;
        buffer_barriers.push(
            vk::BufferMemoryBarrier::builder()
                .buffer(resolve_buffer(b.buffer))
                .src_access_mask(b.src.access)
                .dst_access_mask(b.dst.access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build(),
        );
    }

    // an acquire barrier (unknown source state) always waits from
    // the top of the pipe, never from an accumulated zero mask
    if src_stage.is_empty() {
        src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    Some(PipelineBarrierPlan {
        src_stage,
        dst_stage,
        image_barriers,
        buffer_barriers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img() -> ImageId {
        // only used to distinguish ids in these tests; the resource
        // pool is not involved, so we mint a slotmap key directly.
        let mut sm: slotmap::SlotMap<ImageId, ()> = slotmap::SlotMap::with_key();
        sm.insert(())
    }

    fn sub(image: ImageId, mip: u32, layer: u32) -> ImageSubresourceId {
        ImageSubresourceId { image, mip, layer }
    }

    // S1. Write-then-sample: exactly one barrier at the T0->T1 edge.
    #[test]
    fn write_then_sample_emits_one_barrier() {
        let mut table = TrackingTable::new();
        table.begin_frame(2);
        let image = img();
        let sr = sub(image, 0, 0);

        table.use_image(
            0,
            sr,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
        );
        table.use_image(
            1,
            sr,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        );
        table.flush();

        // the write->read transition must appear at edge 0 (T0's
        // window), not edge 1
        assert_eq!(table.barriers_at(1).images.len(), 1);
        let b = table.barriers_at(1).images[0];
        assert_eq!(b.src.stages, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(b.src.access, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(b.dst.stages, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(b.dst.access, vk::AccessFlags::SHADER_READ);
        assert_eq!(b.dst.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    // S2. Two reads in the same layout merge into one window; only
    // the following write causes a barrier, with OR'd src stages.
    #[test]
    fn two_reads_merge_into_one_window() {
        let mut table = TrackingTable::new();
        table.begin_frame(3);
        let image = img();
        let sr = sub(image, 0, 0);

        table.use_image(
            0,
            sr,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        );
        table.use_image(
            1,
            sr,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_READ,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        );
        // no barrier between T0 and T1
        assert!(table.barriers_at(1).is_empty());

        table.use_image(
            2,
            sr,
            ImageSubresourceState {
                stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_WRITE,
                layout: vk::ImageLayout::GENERAL,
            },
        );
        table.flush();

        assert_eq!(table.barriers_at(0).images.len(), 1);
        let b = table.barriers_at(0).images[0];
        assert_eq!(
            b.src.stages,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER
        );
        assert_eq!(b.src.access, vk::AccessFlags::SHADER_READ);
        assert_eq!(b.src.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    // S4. Indirect dispatch: a barrier appears on the written buffer,
    // none on a buffer that was only ever read this frame.
    #[test]
    fn indirect_dispatch_barriers_only_written_buffer() {
        let mut table = TrackingTable::new();
        table.begin_frame(2);
        let mut sm: slotmap::SlotMap<BufferId, ()> = slotmap::SlotMap::with_key();
        let counts_buf = sm.insert(());
        let tile_buf = sm.insert(());

        table.use_buffer(
            0,
            counts_buf,
            BufferState {
                stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_WRITE,
            },
        );
        table.use_buffer(
            1,
            counts_buf,
            BufferState {
                stages: vk::PipelineStageFlags::DRAW_INDIRECT,
                access: vk::AccessFlags::INDIRECT_COMMAND_READ,
            },
        );
        table.use_buffer(
            1,
            tile_buf,
            BufferState {
                stages: vk::PipelineStageFlags::COMPUTE_SHADER,
                access: vk::AccessFlags::SHADER_READ,
            },
        );
        table.flush();

        assert_eq!(table.barriers_at(0).buffers.len(), 1);
        assert_eq!(table.barriers_at(0).buffers[0].buffer, counts_buf);
        // tile_buf's first use this frame is an acquire, not a
        // mid-frame transition, and it never had a pending write to
        // flush against -- no barrier is emitted for it.
        for edge in 0..table.barrier_count() {
            assert!(table.barriers_at(edge).buffers.iter().all(|b| b.buffer != tile_buf));
        }
    }

    // A frame with zero tasks/declarations submits cleanly.
    #[test]
    fn empty_frame_has_no_barriers() {
        let mut table = TrackingTable::new();
        table.begin_frame(0);
        table.flush();
        assert_eq!(table.barrier_count(), 0);
    }
}
