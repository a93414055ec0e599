//! Per-instance data of one render context.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::mesh::TriangleMesh;
use crate::allocators::BufferAllocation;
use crate::api::DeviceContext;
use crate::gpu::{BufferBarrier, DeviceIndex, GpuError};

/// Per-instance attributes of binding 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DefaultInstance {
    pub model: Mat4,
    pub inv_model: Mat4,
    pub unique_id: u32,
    pub shell_height: f32,
    pub extrusion: f32,
    pub _pad: u32,
}

impl DefaultInstance {
    pub fn new(unique_id: u32, model: Mat4, shell_height: f32, extrusion: f32) -> Self {
        Self {
            model,
            inv_model: model.inverse(),
            unique_id,
            shell_height,
            extrusion,
            _pad: 0,
        }
    }
}

const MIN_CAPACITY: u32 = 16;

/// Host-side instance list and the device-local buffer it is copied to.
///
/// The buffer only grows. A replaced buffer goes through the deallocation
/// queue since earlier frames may still read it.
#[derive(Debug)]
pub struct TriangleMeshInstanceSet {
    device_index: DeviceIndex,
    instances: Vec<DefaultInstance>,
    buffer: Option<BufferAllocation>,
    capacity: u32,
}

impl TriangleMeshInstanceSet {
    pub fn new(device_index: DeviceIndex) -> Self {
        Self {
            device_index,
            instances: Vec::new(),
            buffer: None,
            capacity: 0,
        }
    }

    pub fn begin_collection(&mut self) {
        self.instances.clear();
    }

    pub fn push_instance(&mut self, unique_id: u32, model: Mat4, shell_height: f32, extrusion: f32) {
        self.instances
            .push(DefaultInstance::new(unique_id, model, shell_height, extrusion));
    }

    /// Grow the device buffer if the collected instances do not fit.
    pub fn end_collection(&mut self, ctx: &DeviceContext) -> Result<(), GpuError> {
        let count = self.instances.len() as u32;
        if count <= self.capacity {
            return Ok(());
        }
        if let Some(old) = self.buffer.take() {
            ctx.schedule_for_deallocation(old);
        }
        let capacity = count.max(MIN_CAPACITY.max(2 * self.capacity));
        let buffer = ctx.memory().create_buffer(
            capacity as vk::DeviceSize * std::mem::size_of::<DefaultInstance>() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(self.device_index),
        )?;
        self.buffer = Some(buffer);
        self.capacity = capacity;
        Ok(())
    }

    pub fn instances(&self) -> &[DefaultInstance] {
        &self.instances
    }

    pub fn len(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn buffer(&self) -> Option<vk::Buffer> {
        self.buffer.as_ref().map(BufferAllocation::buffer)
    }

    /// Bytes of instance data currently collected.
    pub fn byte_size(&self) -> vk::DeviceSize {
        crate::util::layout::byte_len(&self.instances)
    }

    /// Record the copy of the instance list into the device buffer.
    ///
    /// The copy and the release half of the ownership transfer go into
    /// `transfer_cb`; the acquire half into `graphics_cb`. Both must be
    /// recording.
    pub fn update_device_memory(
        &self,
        ctx: &DeviceContext,
        transfer_cb: vk::CommandBuffer,
        graphics_cb: vk::CommandBuffer,
    ) -> Result<(), GpuError> {
        let Some(dst) = self.buffer() else {
            return Ok(());
        };
        if self.instances.is_empty() {
            return Ok(());
        }
        let size = self.byte_size();
        let mut staging = ctx.memory().create_staging_buffer(size)?;
        staging.write_bytes(bytemuck::cast_slice(&self.instances))?;

        let gpu = ctx.gpu();
        let families = ctx.queue_families();
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        gpu.cmd_copy_buffer(transfer_cb, staging.buffer(), dst, &[region]);

        let release = BufferBarrier {
            src_stage_mask: vk::PipelineStageFlags2::COPY,
            src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage_mask: vk::PipelineStageFlags2::COPY,
            dst_access_mask: vk::AccessFlags2::NONE,
            src_queue_family_index: families.transfer,
            dst_queue_family_index: families.graphics,
            buffer: dst,
            offset: 0,
            size,
        };
        gpu.cmd_pipeline_barrier(transfer_cb, &[release], &[]);

        let acquire = BufferBarrier {
            src_stage_mask: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            src_access_mask: vk::AccessFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            dst_access_mask: vk::AccessFlags2::MEMORY_READ,
            ..release
        };
        gpu.cmd_pipeline_barrier(graphics_cb, &[acquire], &[]);

        ctx.schedule_for_deallocation(staging);
        Ok(())
    }

    /// Draw `mesh` once per collected instance. Records nothing when empty.
    pub fn draw(&self, ctx: &DeviceContext, command_buffer: vk::CommandBuffer, mesh: &TriangleMesh) {
        let Some(buffer) = self.buffer() else {
            return;
        };
        if self.instances.is_empty() {
            return;
        }
        let gpu = ctx.gpu();
        gpu.cmd_bind_vertex_buffers(command_buffer, &[mesh.vertex_buffer(), buffer], &[0, 0]);
        gpu.cmd_bind_index_buffer(command_buffer, mesh.index_buffer(), 0);
        gpu.cmd_draw_indexed(command_buffer, mesh.index_count(), self.len());
    }

    /// Hand the device buffer to the deallocation queue.
    pub fn retire(&mut self, ctx: &DeviceContext) {
        if let Some(buffer) = self.buffer.take() {
            ctx.schedule_for_deallocation(buffer);
        }
        self.capacity = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::api::RenderConfig;
    use crate::gpu::{DeviceMask, DummyDevice, GpuDevice, RecordedCommand};

    fn context() -> (Arc<DummyDevice>, Arc<DeviceContext>) {
        let gpu = Arc::new(DummyDevice::new(1));
        let ctx = DeviceContext::new(gpu.clone(), RenderConfig::default()).unwrap();
        (gpu, ctx)
    }

    fn collect(set: &mut TriangleMeshInstanceSet, ctx: &DeviceContext, n: u32) {
        set.begin_collection();
        for i in 0..n {
            set.push_instance(i, Mat4::IDENTITY, 0.0, 0.0);
        }
        set.end_collection(ctx).unwrap();
    }

    #[test]
    fn test_instance_layout() {
        assert_eq!(std::mem::size_of::<DefaultInstance>(), 144);
        let instance = DefaultInstance::new(3, Mat4::from_scale(glam::Vec3::splat(2.0)), 0.5, 0.15);
        assert_eq!(instance.inv_model, Mat4::from_scale(glam::Vec3::splat(0.5)));
    }

    #[test]
    fn test_capacity_growth() {
        let (_gpu, ctx) = context();
        let mut set = TriangleMeshInstanceSet::new(0);

        collect(&mut set, &ctx, 3);
        assert_eq!(set.capacity(), 16);
        let first = set.buffer();

        collect(&mut set, &ctx, 16);
        assert_eq!(set.capacity(), 16);
        assert_eq!(set.buffer(), first);

        collect(&mut set, &ctx, 17);
        assert_eq!(set.capacity(), 32);
        assert_ne!(set.buffer(), first);
        // the replaced buffer waits in the deallocation queue
        assert_eq!(ctx.deallocations().len(), 1);

        collect(&mut set, &ctx, 100);
        assert_eq!(set.capacity(), 100);
    }

    #[test]
    fn test_update_and_draw_record_transfer_and_graphics() {
        let (gpu, ctx) = context();
        let mut set = TriangleMeshInstanceSet::new(0);
        collect(&mut set, &ctx, 4);
        let mesh = ctx.donut_mesh(0, 8).unwrap();

        let pool_t = gpu.create_command_pool(1).unwrap();
        let pool_g = gpu.create_command_pool(0).unwrap();
        let transfer = gpu.allocate_command_buffer(pool_t).unwrap();
        let graphics = gpu.allocate_command_buffer(pool_g).unwrap();
        gpu.begin_command_buffer(transfer, DeviceMask::none()).unwrap();
        gpu.begin_command_buffer(graphics, DeviceMask::none()).unwrap();

        set.update_device_memory(&ctx, transfer, graphics).unwrap();
        set.draw(&ctx, graphics, &mesh);

        let transfer_cmds = gpu.commands(transfer);
        assert!(matches!(&transfer_cmds[0], RecordedCommand::CopyBuffer { regions, .. } if regions[0].2 == 4 * 144));
        assert!(matches!(&transfer_cmds[1], RecordedCommand::PipelineBarrier { .. }));

        let graphics_cmds = gpu.commands(graphics);
        assert_eq!(
            graphics_cmds[1],
            RecordedCommand::BindVertexBuffers(vec![mesh.vertex_buffer(), set.buffer().unwrap()])
        );
        assert_eq!(
            graphics_cmds[3],
            RecordedCommand::DrawIndexed {
                index_count: mesh.index_count(),
                instance_count: 4
            }
        );
    }

    #[test]
    fn test_empty_set_draws_nothing() {
        let (gpu, ctx) = context();
        let set = TriangleMeshInstanceSet::new(0);
        let mesh = ctx.donut_mesh(0, 8).unwrap();
        let pool = gpu.create_command_pool(0).unwrap();
        let cb = gpu.allocate_command_buffer(pool).unwrap();
        gpu.begin_command_buffer(cb, DeviceMask::none()).unwrap();

        set.draw(&ctx, cb, &mesh);
        assert!(gpu.commands(cb).is_empty());
    }
}
