//! A frame-scoped Vulkan render graph.
//!
//! An embedding application declares a sequence of tasks against a
//! [`Graph`] each frame — each task states which images and buffers it
//! touches and how, via a [`builder::TaskBuilder`], then records the
//! commands that do the touching once the graph has worked out the
//! barriers. `Graph::submit` flushes the declarations, synthesizes the
//! pipeline barriers the declared accesses imply, runs every task's
//! recording closure in declaration order, and presents if any task
//! prepared the backbuffer for it.
//!
//! Grounded on thundr's top-level crate shape (`lib.rs` re-exporting a
//! `Renderer` and a `CreateInfo` builder), generalized from a fixed
//! compositor draw list to the declared per-frame task sequence this
//! crate's two-phase setup/record contract produces.

mod binder;
mod builder;
mod cmd;
mod device;
mod error;
mod frame;
mod graph;
mod instance;
mod pipeline;
mod platform;
mod pool;
mod reflect;
mod resources;
mod shader;
mod tracking;
mod ubo;

pub use crate::builder::{ImageInfo, TaskBuilder};
pub use crate::cmd::{CommandContext, PipelineKind, RenderResources};
pub use crate::error::{GraphError, Result};
pub use crate::graph::Graph;
pub use crate::pool::{BufferId, ImageId};
pub use crate::resources::{
    BufferDesc, ImageCreateOptions, ImageDesc, ImageSubresourceId, ImageViewId, MemoryClass, ViewRange,
};
pub use crate::shader::Program;
pub use crate::tracking::{BufferState, ImageSubresourceState};

/// Construction-time configuration for a [`Graph`].
///
/// There is no file-based configuration format — everything here is
/// decided once, at startup, by the embedding application.
pub struct CreateInfo {
    /// Instance extensions required to create a surface on the host
    /// platform (e.g. `VK_KHR_win32_surface`, `VK_KHR_xcb_surface`).
    /// The debug-utils extension is appended automatically.
    pub surface_extensions: Vec<*const std::os::raw::c_char>,

    /// Enables `VK_LAYER_KHRONOS_validation` and the debug messenger.
    /// Defaults to on for debug builds, off for release.
    pub enable_validation: bool,

    /// Number of frames the pacer keeps in flight (double buffering by
    /// default). Also sizes the descriptor binder's pool rotation and
    /// the uniform-buffer ring.
    pub frames_count: usize,

    /// The window's current pixel size, used to pick a swapchain extent
    /// when the surface itself reports `current_extent.width ==
    /// u32::MAX` ("the app must choose"). Ignored otherwise.
    pub window_extent: ash::vk::Extent2D,
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            surface_extensions: Vec::new(),
            enable_validation: cfg!(debug_assertions),
            frames_count: 2,
            window_extent: ash::vk::Extent2D {
                width: 1280,
                height: 720,
            },
        }
    }
}
