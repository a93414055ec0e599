//! GPU abstraction
//!
//! Every Vulkan call of the renderer core goes through [`GpuDevice`].
//!
//! ## Backends
//! - `dummy`: in-memory device for tests (always available)
//! - `vulkan`: via the `ash` crate (enable `gpu-vulkan` feature)

pub mod traits;
pub use traits::{GpuDevice, GpuError};

pub mod types;
pub use types::{
    BufferBarrier, DeviceIndex, DeviceMask, DisplaySurface, FrameIndex, GraphicsPipeline, ImageBarrier,
    ImageDesc, PresentTarget, QueueFamilies, RenderPassBegin, SemaphoreKind, SemaphoreSubmit, SubmitBatch,
    SwapchainDesc,
};

pub mod select;
pub use select::find_memory_type_index;

pub mod dummy;
pub use dummy::{DummyDevice, DummyDisplay, LiveObjects, RecordedCommand, SubmitRecord};

#[cfg(feature = "gpu-vulkan")]
pub mod vulkan;
