//! Host to device buffer uploads.
//!
//! Copies requested during a frame are staged immediately and recorded in
//! one batch at the end of the frame: the copies and release barriers go
//! into a transfer-queue command buffer, the matching acquire barriers into
//! a graphics-queue command buffer. A timeline semaphore signaled with
//! `frame + 1` orders the two.

use std::sync::Arc;

use ash::vk;
use crossbeam_queue::SegQueue;

use super::execution_unit::CommandExecutionUnit;
use crate::allocators::{BufferAllocation, DeallocationQueue, DeviceMemory};
use crate::gpu::{
    BufferBarrier, DeviceMask, FrameIndex, GpuDevice, GpuError, QueueFamilies, SemaphoreKind, SemaphoreSubmit,
};
use crate::sync::Mutex;

struct PendingCopy {
    staging: BufferAllocation,
    dst: vk::Buffer,
    region: vk::BufferCopy,
    dst_stage_mask: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy)]
struct FrameBuffers {
    transfer: vk::CommandBuffer,
    graphics: vk::CommandBuffer,
}

/// Batches host to device copies of one logical device.
pub struct MemoryObjectUploader {
    gpu: Arc<dyn GpuDevice>,
    queue_families: QueueFamilies,
    sync_semaphore: vk::Semaphore,
    pending: SegQueue<PendingCopy>,
    frame: Mutex<Option<FrameBuffers>>,
}

impl MemoryObjectUploader {
    pub fn new(gpu: Arc<dyn GpuDevice>) -> Result<Self, GpuError> {
        let sync_semaphore = gpu.create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })?;
        Ok(Self {
            queue_families: gpu.queue_families(),
            gpu,
            sync_semaphore,
            pending: SegQueue::new(),
            frame: Mutex::new(None),
        })
    }

    /// Timeline semaphore reaching `frame + 1` once the uploads of `frame`
    /// have been copied.
    pub fn sync_semaphore(&self) -> vk::Semaphore {
        self.sync_semaphore
    }

    /// Copies waiting for the next [`finish`](Self::finish).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stage `src` for a copy to `dst` at `dst_offset`.
    ///
    /// The data is copied into a fresh staging buffer right away, so `src`
    /// may be reused when this returns. `dst_stage_mask` is the first stage
    /// on the graphics queue that reads the destination.
    pub fn memcpy_host_to_buffer(
        &self,
        memory: &DeviceMemory,
        src: &[u8],
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        dst_stage_mask: vk::PipelineStageFlags2,
    ) -> Result<(), GpuError> {
        if src.is_empty() {
            return Ok(());
        }
        let size = src.len() as vk::DeviceSize;
        let mut staging = memory.create_staging_buffer(size)?;
        staging.write_bytes(src)?;

        self.pending.push(PendingCopy {
            staging,
            dst,
            region: vk::BufferCopy {
                src_offset: 0,
                dst_offset,
                size,
            },
            dst_stage_mask,
        });
        Ok(())
    }

    /// Reserve this frame's transfer and graphics command buffers.
    pub fn prepare(&self, unit: &CommandExecutionUnit, frame: FrameIndex) -> Result<(), GpuError> {
        let buffers = unit.request_command_buffers(
            &[self.queue_families.transfer, self.queue_families.graphics],
            DeviceMask::none(),
        )?;
        let (transfer, graphics) = (buffers[0], buffers[1]);

        unit.push_signal(
            transfer,
            SemaphoreSubmit::timeline(self.sync_semaphore, frame + 1, vk::PipelineStageFlags2::COPY),
        );
        unit.push_wait(
            graphics,
            SemaphoreSubmit::timeline(self.sync_semaphore, frame + 1, vk::PipelineStageFlags2::ALL_COMMANDS),
        );
        *self.frame.lock() = Some(FrameBuffers { transfer, graphics });
        Ok(())
    }

    /// Record every pending copy into the buffers reserved by [`prepare`](Self::prepare).
    ///
    /// Staging buffers are handed to `deallocations`. Does nothing when
    /// `prepare` was not called for this frame.
    pub fn finish(
        &self,
        deallocations: &DeallocationQueue,
        frame: FrameIndex,
        frames_to_keep: u64,
    ) -> Result<(), GpuError> {
        let Some(FrameBuffers { transfer, graphics }) = self.frame.lock().take() else {
            return Ok(());
        };
        self.gpu.begin_command_buffer(transfer, DeviceMask::none())?;
        self.gpu.begin_command_buffer(graphics, DeviceMask::none())?;

        let QueueFamilies {
            graphics: graphics_family,
            transfer: transfer_family,
            ..
        } = self.queue_families;
        let mut releases = Vec::new();
        let mut acquisitions = Vec::new();

        while let Some(copy) = self.pending.pop() {
            self.gpu
                .cmd_copy_buffer(transfer, copy.staging.buffer(), copy.dst, &[copy.region]);
            releases.push(BufferBarrier {
                src_stage_mask: vk::PipelineStageFlags2::COPY,
                src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
                dst_stage_mask: vk::PipelineStageFlags2::NONE,
                dst_access_mask: vk::AccessFlags2::NONE,
                src_queue_family_index: transfer_family,
                dst_queue_family_index: graphics_family,
                buffer: copy.dst,
                offset: copy.region.dst_offset,
                size: copy.region.size,
            });
            acquisitions.push(BufferBarrier {
                src_stage_mask: vk::PipelineStageFlags2::NONE,
                src_access_mask: vk::AccessFlags2::NONE,
                dst_stage_mask: copy.dst_stage_mask,
                dst_access_mask: vk::AccessFlags2::MEMORY_READ,
                src_queue_family_index: transfer_family,
                dst_queue_family_index: graphics_family,
                buffer: copy.dst,
                offset: copy.region.dst_offset,
                size: copy.region.size,
            });
            deallocations.schedule(copy.staging, frame, frames_to_keep);
        }

        if !releases.is_empty() {
            self.gpu.cmd_pipeline_barrier(transfer, &releases, &[]);
            self.gpu.cmd_pipeline_barrier(graphics, &acquisitions, &[]);
        }
        self.gpu.end_command_buffer(graphics)?;
        self.gpu.end_command_buffer(transfer)?;
        Ok(())
    }
}

impl Drop for MemoryObjectUploader {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::warn!("dropping uploader with {} pending copies", self.pending.len());
        }
        self.gpu.destroy_semaphore(self.sync_semaphore);
    }
}
