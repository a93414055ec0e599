//! Device memory allocation.
//!
//! - [`interval`]: first-fit free list over one page
//! - [`pool`]: page-based pools handing out [`Allocation`]s
//! - [`resource`]: buffers and images bound to pool memory
//! - [`device_memory`]: the staging, global and per-device pools of a device
//! - [`deferred`]: frame-delayed destruction of buffers, images and memory

pub mod deferred;
pub mod device_memory;
pub mod interval;
pub mod pool;
pub mod resource;

pub use deferred::{Deallocation, DeallocationQueue};
pub use device_memory::DeviceMemory;
pub use interval::{Interval, IntervalAllocator};
pub use pool::{Allocation, MemoryPool};
pub use resource::{BufferAllocation, ImageAllocation};
