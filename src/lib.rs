//! # ddisplay
//!
//! Multi-GPU direct-display renderer core for Vulkan device groups.
//!
//! ## Features
//!
//! - Display-plane surfaces driven without a window system
//! - One render thread per (physical device, display) pair
//! - Frame ring of command execution units with batched submission
//! - Paged device memory pools with first-fit sub-allocation
//! - Frame-delayed destruction of buffers, images and memory
//! - Staged uploads with transfer to graphics ownership transfer
//! - Coded diagnostics routed through `log`, with a strict mode for CI
//! - In-memory dummy device for tests; ash backend behind `gpu-vulkan`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ash::vk;
//! use ash::vk::Handle;
//! use ddisplay::gpu::{DummyDevice, DummyDisplay};
//! use ddisplay::sync::RwLock;
//! use ddisplay::{CanvasRegion, LogicalDevice, RenderConfig, Scene};
//!
//! let gpu = Arc::new(DummyDevice::new(1).with_display(DummyDisplay::new(1, "main", 1920, 1080)));
//! let scene = Arc::new(RwLock::new(Scene::new()));
//!
//! let mut device = LogicalDevice::new(gpu, RenderConfig::default()).unwrap();
//! device
//!     .enable_display(vk::DisplayKHR::from_raw(1), CanvasRegion::default(), scene.clone())
//!     .unwrap();
//! device.start().unwrap();
//!
//! // Render loop
//! for _ in 0..3 {
//!     scene.write().update(16.0);
//!     device.render();
//! }
//! device.interrupt();
//! device.join();
//! ```

pub mod allocators;
pub mod api;
pub mod command;
pub mod diagnostics;
pub mod gpu;
pub mod render;
pub mod scene;
pub mod sync;

mod util;

// Re-export public API at crate root for convenience
pub use api::{CanvasRegion, DeviceContext, LogicalDevice, LogicalDisplay, RenderConfig, RenderStats};
pub use gpu::{DeviceIndex, DeviceMask, FrameIndex, GpuDevice, GpuError};
pub use scene::{Node, NodeType, PerspectiveCamera, Scene};

// Memory
pub use allocators::{
    Allocation, BufferAllocation, DeallocationQueue, DeviceMemory, ImageAllocation, IntervalAllocator, MemoryPool,
};

// Commands
pub use command::{CommandExecutionUnit, MemoryObjectUploader};

// Rendering
pub use render::{CanvasRegionRenderer, RecordCommands, RecordJob, RenderThread, RenderThreadStatus};

// Diagnostics - Core types and predefined codes
pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use diagnostics::{set_strict_mode, StrictMode, StrictModeGuard};
pub use diagnostics::{
    DD001, DD002, DD003, DD101, DD102, DD103, DD201, DD202, DD203, DD204, DD301, DD302, DD303, DD304, DD901,
};

pub use util::size::{format_bytes, gb, kb, mb};
