//! State shared by a logical device and its render threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocators::{Deallocation, DeallocationQueue, DeviceMemory};
use crate::api::RenderConfig;
use crate::command::MemoryObjectUploader;
use crate::gpu::{DeviceIndex, FrameIndex, GpuDevice, GpuError, QueueFamilies};
use crate::render::{MeshCache, TriangleMesh};

/// Non-owning view of a logical device handed to every render thread.
///
/// Each component locks itself; the context adds no lock of its own.
pub struct DeviceContext {
    gpu: Arc<dyn GpuDevice>,
    config: RenderConfig,
    queue_families: QueueFamilies,
    memory: DeviceMemory,
    deallocations: DeallocationQueue,
    uploader: MemoryObjectUploader,
    meshes: MeshCache,
    frame_index: AtomicU64,
}

impl DeviceContext {
    pub fn new(gpu: Arc<dyn GpuDevice>, config: RenderConfig) -> Result<Arc<Self>, GpuError> {
        let memory = DeviceMemory::new(Arc::clone(&gpu), config.min_page_size)?;
        let uploader = MemoryObjectUploader::new(Arc::clone(&gpu))?;
        Ok(Arc::new(Self {
            queue_families: gpu.queue_families(),
            gpu,
            config,
            memory,
            deallocations: DeallocationQueue::new(),
            uploader,
            meshes: MeshCache::new(),
            frame_index: AtomicU64::new(0),
        }))
    }

    pub fn gpu(&self) -> &Arc<dyn GpuDevice> {
        &self.gpu
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn deallocations(&self) -> &DeallocationQueue {
        &self.deallocations
    }

    pub fn uploader(&self) -> &MemoryObjectUploader {
        &self.uploader
    }

    pub fn meshes(&self) -> &MeshCache {
        &self.meshes
    }

    /// Index of the frame currently being built.
    pub fn frame_index(&self) -> FrameIndex {
        self.frame_index.load(Ordering::Acquire)
    }

    pub(crate) fn advance_frame(&self) -> FrameIndex {
        self.frame_index.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Destroy `resource` once the frames that may still use it are done.
    pub fn schedule_for_deallocation(&self, resource: impl Into<Deallocation>) {
        self.deallocations
            .schedule(resource, self.frame_index(), self.config.frames_to_keep);
    }

    /// The cached donut mesh of `device_index`.
    pub fn donut_mesh(&self, device_index: DeviceIndex, tessellation: u32) -> Result<Arc<TriangleMesh>, GpuError> {
        self.meshes.donut(self, device_index, tessellation)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("queue_families", &self.queue_families)
            .field("frame_index", &self.frame_index())
            .field("memory_pools", &self.memory.pool_count())
            .field("deallocations", &self.deallocations.len())
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.meshes.clear(self);
        self.deallocations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;

    #[test]
    fn test_schedule_uses_current_frame() {
        let gpu = Arc::new(DummyDevice::new(1));
        let ctx = DeviceContext::new(gpu.clone(), RenderConfig::default().with_frames_to_keep(2)).unwrap();
        let buffer = ctx.memory().create_staging_buffer(64).unwrap();

        ctx.advance_frame();
        ctx.schedule_for_deallocation(buffer);
        assert_eq!(ctx.deallocations().target_frames(), vec![3]);
    }

    #[test]
    fn test_drop_releases_everything() {
        let gpu = Arc::new(DummyDevice::new(2));
        {
            let ctx = DeviceContext::new(gpu.clone(), RenderConfig::minimal()).unwrap();
            ctx.donut_mesh(0, 4).unwrap();
            ctx.donut_mesh(1, 4).unwrap();
            assert_eq!(ctx.meshes().len(), 2);
        }
        let live = gpu.live_objects();
        assert_eq!(live.buffers, 0);
        assert_eq!(live.semaphores, 0);
        assert_eq!(live.memory, 0);
    }
}
