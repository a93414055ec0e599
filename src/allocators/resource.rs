//! Buffers and images bound to pool memory.

use std::sync::Arc;

use ash::vk;

use super::pool::Allocation;
use crate::gpu::GpuDevice;

/// A buffer and the memory bound to it. Destroys the buffer on drop.
pub struct BufferAllocation {
    gpu: Arc<dyn GpuDevice>,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    allocation: Allocation,
}

impl BufferAllocation {
    pub(crate) fn new(
        gpu: Arc<dyn GpuDevice>,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        allocation: Allocation,
    ) -> Self {
        Self {
            gpu,
            buffer,
            size,
            allocation,
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size of the buffer, not of its allocation.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Copy `data` to the start of a host-mapped buffer.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), crate::gpu::GpuError> {
        self.allocation.write_bytes(data)
    }
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        self.gpu.destroy_buffer(self.buffer);
        // the allocation returns itself to its pool right after
    }
}

impl std::fmt::Debug for BufferAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocation")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("allocation", &self.allocation)
            .finish()
    }
}

/// An image and the memory bound to it. Destroys the image on drop.
pub struct ImageAllocation {
    gpu: Arc<dyn GpuDevice>,
    image: vk::Image,
    allocation: Allocation,
}

impl ImageAllocation {
    pub(crate) fn new(gpu: Arc<dyn GpuDevice>, image: vk::Image, allocation: Allocation) -> Self {
        Self { gpu, image, allocation }
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }
}

impl Drop for ImageAllocation {
    fn drop(&mut self) {
        self.gpu.destroy_image(self.image);
    }
}

impl std::fmt::Debug for ImageAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAllocation")
            .field("image", &self.image)
            .field("allocation", &self.allocation)
            .finish()
    }
}
