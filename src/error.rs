// Error taxonomy for the render graph
//
// Every fallible operation in this crate returns `Result<T, GraphError>`.
// Nothing is swallowed: a task's failure aborts the frame, and the kinds
// marked fatal below tear down the whole graph when they escape `submit`.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

#[derive(Error, Debug)]
pub enum GraphError {
    /// A Vulkan call returned a non-success code. Fatal; propagated up.
    #[error("device failure: {0:?}")]
    DeviceFailure(vk::Result),

    /// A `ResourceId` was dereferenced with a generation that does not
    /// match the slot's current generation.
    #[error("stale resource handle")]
    StaleHandle,

    /// A descriptor array-index, mip level, or array layer fell outside
    /// the range the resource was created with.
    #[error("index out of range")]
    OutOfRange,

    /// The same (set, binding) was declared with incompatible type/count
    /// across two stages of the same program.
    #[error("layout mismatch at set {set}, binding {binding}")]
    LayoutMismatch { set: u32, binding: u32 },

    /// A program declared the same shader stage twice.
    #[error("shader stage {0:?} used more than once in program")]
    StageReuse(vk::ShaderStageFlags),

    /// A bound graphics pipeline is missing one of program, vertex-input,
    /// subpass, or fixed-function state at bind time.
    #[error("incomplete pipeline state: {0}")]
    IncompletePipeline(&'static str),

    /// The descriptor binder was asked to write a binding the program's
    /// layout does not declare.
    #[error("unknown binding: set {set}, binding {binding}")]
    UnknownBinding { set: u32, binding: u32 },

    /// A descriptor pool could not satisfy an allocation.
    #[error("descriptor pool exhausted")]
    PoolExhaustion,

    /// An operation was attempted on the resource pool after `clear_all`.
    #[error("resource pool has been shut down")]
    PoolShutdown,

    /// The swapchain is out of date or suboptimal; the caller must
    /// recreate it and retry.
    #[error("surface is stale, recreate the swapchain")]
    SurfaceStale,

    /// The per-frame upload staging buffer would overflow its budget.
    #[error("transfer would overflow the frame's staging budget")]
    TransferOverflow,
}

impl From<vk::Result> for GraphError {
    fn from(r: vk::Result) -> Self {
        GraphError::DeviceFailure(r)
    }
}
