// Per-frame uniform-buffer ring allocator: one mapped `Buffer` per
// frame-in-flight, carved into fixed-alignment blocks as tasks record
//.
//
// Grounded on thundr's per-frame uniform buffer in renderer.rs, which
// does the same "one big mapped buffer, bump-allocate this frame,
// reset next time we cycle back to this slot" trick for per-draw
// transform data.

use ash::vk;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{GraphError, Result};
use crate::resources::{Buffer, BufferDesc, MemoryClass};

fn align_up(offset: u64, align: u64) -> u64 {
    (offset + align - 1) & !(align - 1)
}

/// A bump allocator over one frame-in-flight's worth of mapped memory.
/// `alloc` never frees individually; the whole ring resets when the
/// orchestrator cycles back to this frame slot.
pub struct UboRingAllocator {
    buffers: Vec<Buffer>,
    cursor: Vec<u64>,
    min_alignment: u64,
    current_frame: usize,
}

impl UboRingAllocator {
    pub fn new(device: Arc<Device>, frames_count: usize, block_size: u64, min_alignment: u64) -> Result<Self> {
        let mut buffers = Vec::with_capacity(frames_count);
        for _ in 0..frames_count {
            buffers.push(Buffer::new(
                device.clone(),
                BufferDesc {
                    size_bytes: block_size,
                    usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    memory_class: MemoryClass::HostToDeviceMapped,
                },
            )?);
        }

        Ok(Self {
            buffers,
            cursor: vec![0; frames_count],
            min_alignment,
            current_frame: 0,
        })
    }

    /// Resets this frame slot's cursor to zero; called once per
    /// `begin()` alongside the descriptor binder's flip.
    pub fn begin_frame(&mut self, frame_index: usize) {
        self.current_frame = frame_index;
        self.cursor[frame_index] = 0;
    }

    /// Carves `size` bytes out of the current frame's ring, aligned to
    /// `min_alignment`. Fails with `TransferOverflow` if the block is
    /// exhausted.
    pub fn alloc(&mut self, size: u64) -> Result<(vk::Buffer, u64, *mut u8)> {
        let buf = &self.buffers[self.current_frame];
        let aligned = align_up(self.cursor[self.current_frame], self.min_alignment);
        if aligned + size > buf.desc.size_bytes {
            return Err(GraphError::TransferOverflow);
        }
        self.cursor[self.current_frame] = aligned + size;

        let ptr = buf
            .mapped_ptr()
            .expect("ubo ring buffers are always host-mapped")
            .wrapping_add(aligned as usize);
        Ok((buf.buffer, aligned, ptr))
    }
}
