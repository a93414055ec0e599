//! Memory pools of one logical device.
//!
//! One host-visible staging pool, persistently mapped, plus lazily created
//! pools per `(memory type, device)` pair. Global pools use the empty device
//! mask and allocate on every device of the group; per-device pools use a
//! single-device mask.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use super::pool::MemoryPool;
use super::resource::{BufferAllocation, ImageAllocation};
use crate::gpu::{find_memory_type_index, DeviceIndex, DeviceMask, GpuDevice, GpuError, ImageDesc};
use crate::sync::Mutex;

/// Buffer and image allocation helpers over a set of [`MemoryPool`]s.
pub struct DeviceMemory {
    gpu: Arc<dyn GpuDevice>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    staging: Arc<MemoryPool>,
    pools: Mutex<HashMap<(u32, DeviceMask), Arc<MemoryPool>>>,
    min_page_size: vk::DeviceSize,
}

impl DeviceMemory {
    /// Fails with [`GpuError::NoMemoryType`] when the device has no
    /// host-visible, host-coherent memory.
    pub fn new(gpu: Arc<dyn GpuDevice>, min_page_size: vk::DeviceSize) -> Result<Self, GpuError> {
        let memory_properties = gpu.memory_properties();
        let staging_type = find_memory_type_index(
            &memory_properties,
            !0,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .ok_or(GpuError::NoMemoryType)?;
        let staging = MemoryPool::new(gpu.clone(), staging_type, DeviceMask::none(), true, min_page_size);

        Ok(Self {
            gpu,
            memory_properties,
            staging,
            pools: Mutex::new(HashMap::new()),
            min_page_size,
        })
    }

    /// The pool for `memory_type_index`, on one device or on all of them.
    pub fn pool(&self, device_index: Option<DeviceIndex>, memory_type_index: u32) -> Arc<MemoryPool> {
        let mask = device_index.map_or(DeviceMask::none(), DeviceMask::of_single_device);
        let mut pools = self.pools.lock();
        pools
            .entry((memory_type_index, mask))
            .or_insert_with(|| MemoryPool::new(self.gpu.clone(), memory_type_index, mask, false, self.min_page_size))
            .clone()
    }

    /// Number of non-staging pools created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn staging_pool(&self) -> &Arc<MemoryPool> {
        &self.staging
    }

    /// Create a buffer and bind it to memory with the given properties.
    ///
    /// `device_index` restricts the memory to one device of the group.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        device_index: Option<DeviceIndex>,
    ) -> Result<BufferAllocation, GpuError> {
        let buffer = self.gpu.create_buffer(size, usage)?;
        let requirements = self.gpu.buffer_memory_requirements(buffer);
        let pool = match find_memory_type_index(&self.memory_properties, requirements.memory_type_bits, flags) {
            Some(memory_type_index) => self.pool(device_index, memory_type_index),
            None => {
                self.gpu.destroy_buffer(buffer);
                return Err(GpuError::NoMemoryType);
            }
        };
        self.bind_buffer(buffer, size, requirements, &pool)
    }

    /// A host-visible transfer source of exactly `size` bytes, mapped.
    pub fn create_staging_buffer(&self, size: vk::DeviceSize) -> Result<BufferAllocation, GpuError> {
        let buffer = self.gpu.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let requirements = self.gpu.buffer_memory_requirements(buffer);
        if requirements.memory_type_bits & (1 << self.staging.memory_type_index()) == 0 {
            self.gpu.destroy_buffer(buffer);
            return Err(GpuError::NoMemoryType);
        }
        let staging = self.staging.clone();
        self.bind_buffer(buffer, size, requirements, &staging)
    }

    fn bind_buffer(
        &self,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
        requirements: vk::MemoryRequirements,
        pool: &Arc<MemoryPool>,
    ) -> Result<BufferAllocation, GpuError> {
        let allocation = match pool.alloc(requirements.size, requirements.alignment) {
            Ok(allocation) => allocation,
            Err(err) => {
                self.gpu.destroy_buffer(buffer);
                return Err(err);
            }
        };
        if let Err(err) = self
            .gpu
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        {
            self.gpu.destroy_buffer(buffer);
            return Err(err);
        }
        Ok(BufferAllocation::new(self.gpu.clone(), buffer, size, allocation))
    }

    /// Create a device-local image.
    pub fn create_image(&self, desc: &ImageDesc, device_index: Option<DeviceIndex>) -> Result<ImageAllocation, GpuError> {
        let image = self.gpu.create_image(desc)?;
        let requirements = self.gpu.image_memory_requirements(image);
        let Some(memory_type_index) = find_memory_type_index(
            &self.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            self.gpu.destroy_image(image);
            return Err(GpuError::NoMemoryType);
        };

        let allocation = match self
            .pool(device_index, memory_type_index)
            .alloc(requirements.size, requirements.alignment)
        {
            Ok(allocation) => allocation,
            Err(err) => {
                self.gpu.destroy_image(image);
                return Err(err);
            }
        };
        if let Err(err) = self
            .gpu
            .bind_image_memory(image, allocation.memory(), allocation.offset())
        {
            self.gpu.destroy_image(image);
            return Err(err);
        }
        Ok(ImageAllocation::new(self.gpu.clone(), image, allocation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;
    use crate::util::size::mb;

    fn memory(devices: u32) -> (Arc<DummyDevice>, DeviceMemory) {
        let gpu = Arc::new(DummyDevice::new(devices));
        let memory = DeviceMemory::new(gpu.clone(), mb(1)).unwrap();
        (gpu, memory)
    }

    #[test]
    fn test_staging_buffer_is_mapped_and_coherent() {
        let (gpu, memory) = memory(1);
        let mut staging = memory.create_staging_buffer(12).unwrap();
        staging.write_bytes(b"hello, world").unwrap();

        assert_eq!(staging.size(), 12);
        assert_eq!(gpu.read_buffer(staging.buffer(), 0, 12), Some(b"hello, world".to_vec()));
        assert_eq!(memory.staging_pool().memory_type_index(), 1);
        assert_eq!(memory.pool_count(), 0);
    }

    #[test]
    fn test_pools_keyed_by_type_and_device() {
        let (gpu, memory) = memory(2);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;

        let a = memory.create_buffer(64, usage, local, Some(1)).unwrap();
        let b = memory.create_buffer(64, usage, local, Some(1)).unwrap();
        let c = memory.create_buffer(64, usage, local, None).unwrap();
        assert_eq!(memory.pool_count(), 2);

        assert_eq!(a.allocation().memory(), b.allocation().memory());
        assert_eq!(
            gpu.memory_info(a.allocation().memory()),
            Some((0, DeviceMask::of_single_device(1)))
        );
        assert_eq!(gpu.memory_info(c.allocation().memory()), Some((0, DeviceMask::none())));
    }

    #[test]
    fn test_images_are_device_local() {
        let (gpu, memory) = memory(1);
        let desc = ImageDesc {
            format: vk::Format::D24_UNORM_S8_UINT,
            extent: vk::Extent2D { width: 64, height: 64 },
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        };
        let image = memory.create_image(&desc, None).unwrap();
        assert_eq!(gpu.memory_info(image.allocation().memory()).map(|(t, _)| t), Some(0));
        drop(image);
        assert_eq!(gpu.live_objects().images, 0);
    }

    #[test]
    fn test_missing_memory_type_destroys_buffer() {
        let (gpu, memory) = memory(1);
        let result = memory.create_buffer(
            64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::PROTECTED,
            None,
        );
        assert_eq!(result.err(), Some(GpuError::NoMemoryType));
        assert_eq!(gpu.live_objects().buffers, 0);
    }
}
