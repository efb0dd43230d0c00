// Driver-level resource wrappers: the `Buffer` and `Image` types that
// live inside `ResourcePtr`s handed out by the resource pool, plus the
// view/subresource identity types built on top of an `ImageId`.
//
// Grounded on thundr's image.rs for the `i_`-prefixed field naming
// convention and the idea of an image owning an interned view cache,
// trimmed of the dmabuf/Wayland-specific import paths.

use ash::vk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::error::{GraphError, Result};
use crate::pool::ImageId;

/// How a buffer's memory is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    DeviceLocal,
    HostToDeviceMapped,
    DeviceToHostMapped,
}

/// Immutable description of a buffer, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size_bytes: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_class: MemoryClass,
}

/// A driver-level buffer: `{api_buffer, allocation, size, mapped_ptr?,
/// host_coherent}`.
pub struct Buffer {
    device: Arc<Device>,
    pub(crate) buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    pub desc: BufferDesc,
    mapped_ptr: Option<*mut u8>,
    host_coherent: bool,
}

// The raw pointer is only ever dereferenced by the owning thread
// while holding a `&Buffer`; Vulkan memory objects themselves are
// safe to share across threads.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(device: Arc<Device>, desc: BufferDesc) -> Result<Self> {
        let (flags, host_coherent) = match desc.memory_class {
            MemoryClass::DeviceLocal => (vk::MemoryPropertyFlags::DEVICE_LOCAL, false),
            MemoryClass::HostToDeviceMapped | MemoryClass::DeviceToHostMapped => (
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                true,
            ),
        };

        let (buffer, memory) =
            device.create_buffer_with_size(desc.usage, flags, desc.size_bytes)?;

        let mapped_ptr = if host_coherent {
            Some(unsafe {
                device
                    .dev
                    .map_memory(memory, 0, desc.size_bytes, vk::MemoryMapFlags::empty())?
                    as *mut u8
            })
        } else {
            None
        };

        Ok(Self {
            device,
            buffer,
            memory,
            desc,
            mapped_ptr,
            host_coherent,
        })
    }

    /// A stable host pointer for mapped memory classes; `None` for
    /// `DeviceLocal` buffers.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped_ptr
    }

    pub fn host_coherent(&self) -> bool {
        self.host_coherent
    }

    /// Flushes `[offset, offset+size)` for non-coherent allocations.
    /// The binder never does this implicitly; callers that write
    /// through `mapped_ptr` and then hand the buffer to the device
    /// must call this first.
    pub fn flush(&self, offset: u64, size: u64) -> Result<()> {
        if self.host_coherent {
            return Ok(());
        }
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(offset)
            .size(size)
            .build();
        unsafe { self.device.dev.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped_ptr.is_some() {
                self.device.dev.unmap_memory(self.memory);
            }
            self.device.dev.destroy_buffer(self.buffer, None);
            self.device.dev.free_memory(self.memory, None);
        }
    }
}

/// Extra creation behavior an image may need beyond a plain 2D/3D
/// texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCreateOptions {
    Plain,
    Array2DCompatible,
    CubemapCompatible,
}

/// Immutable description of an image, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub create_options: ImageCreateOptions,
}

impl ImageDesc {
    pub(crate) fn in_range(&self, mip: u32, layer: u32) -> bool {
        mip < self.mip_levels && layer < self.array_layers
    }
}

/// The view range an `ImageViewId` is keyed on: `{view_type, aspect,
/// base_mip, mip_count, base_layer, layer_count}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewRange {
    pub view_type: vk::ImageViewType,
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

/// An `ImageId` plus a view range. Views are interned per-image,
/// created lazily on first lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewId {
    pub image: ImageId,
    pub range: ViewRange,
}

/// `(ImageId, mip, layer)` -- the atomic unit of barrier tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSubresourceId {
    pub image: ImageId,
    pub mip: u32,
    pub layer: u32,
}

/// A driver-level image: `{api_image, allocation?, descriptor,
/// interned view map}`. `allocation` is `None` for externally
/// owned images such as swapchain backbuffers.
pub struct Image {
    device: Arc<Device>,
    pub(crate) image: vk::Image,
    allocation: Option<vk::DeviceMemory>,
    pub desc: ImageDesc,
    views: Mutex<HashMap<ViewRange, vk::ImageView>>,
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    pub(crate) fn new(device: Arc<Device>, desc: ImageDesc) -> Result<Self> {
        let mut flags = vk::ImageCreateFlags::empty();
        if desc.create_options == ImageCreateOptions::Array2DCompatible {
            flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
        }
        if desc.create_options == ImageCreateOptions::CubemapCompatible {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }

        let create_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .build();

        let image = unsafe { device.dev.create_image(&create_info, None)? };
        let req = unsafe { device.dev.get_image_memory_requirements(image) };
        let index =
            Device::find_memory_type_index(&device.mem_props, &req, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .ok_or(GraphError::DeviceFailure(vk::Result::ERROR_FEATURE_NOT_PRESENT))?;
        let alloc_info = vk::MemoryAllocateInfo {
            allocation_size: req.size,
            memory_type_index: index,
            ..Default::default()
        };
        let memory = unsafe { device.dev.allocate_memory(&alloc_info, None)? };
        unsafe { device.dev.bind_image_memory(image, memory, 0)? };

        Ok(Self {
            device,
            image,
            allocation: Some(memory),
            desc,
            views: Mutex::new(HashMap::new()),
        })
    }

    /// Wraps an externally-owned image (a swapchain backbuffer) with
    /// no backing allocation of its own.
    pub(crate) fn from_external(device: Arc<Device>, image: vk::Image, desc: ImageDesc) -> Self {
        Self {
            device,
            image,
            allocation: None,
            desc,
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the resolution/format descriptor for this image, the
    /// `ImageInfo` returned by the graph's `get_descriptor`.
    pub fn descriptor(&self) -> ImageDesc {
        self.desc
    }

    /// Fetches or lazily creates the `vk::ImageView` for `range`.
    pub(crate) fn view(&self, range: ViewRange) -> Result<vk::ImageView> {
        if range.base_mip + range.mip_count > self.desc.mip_levels
            || range.base_layer + range.layer_count > self.desc.array_layers
        {
            return Err(GraphError::OutOfRange);
        }

        let mut views = self.views.lock().unwrap();
        if let Some(v) = views.get(&range) {
            return Ok(*v);
        }

        let subresource_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(range.aspect)
            .base_mip_level(range.base_mip)
            .level_count(range.mip_count)
            .base_array_layer(range.base_layer)
            .layer_count(range.layer_count)
            .build();
        let info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(range.view_type)
            .format(self.desc.format)
            .subresource_range(subresource_range)
            .build();

        let view = unsafe { self.device.dev.create_image_view(&info, None)? };
        views.insert(range, view);
        Ok(view)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            for (_, view) in self.views.lock().unwrap().drain() {
                self.device.dev.destroy_image_view(view, None);
            }
            if let Some(memory) = self.allocation {
                self.device.dev.destroy_image(self.image, None);
                self.device.dev.free_memory(memory, None);
            }
        }
    }
}
