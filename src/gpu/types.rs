//! Plain data crossing the [`GpuDevice`](super::GpuDevice) seam.
//!
//! ash's create/submit structs carry raw `p_next` pointers and are therefore
//! neither `Send` nor storable across threads. Everything the core keeps
//! around between calls is expressed with these `Copy` types instead and
//! converted by the backend at the last moment.

use ash::vk;

/// Frame counter of one logical device.
pub type FrameIndex = u64;

/// Index of a physical device inside its device group.
pub type DeviceIndex = u32;

/// Bitset over the physical devices of a device group.
///
/// The empty mask means "no explicit mask": the API default applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceMask(u32);

impl DeviceMask {
    /// The default mask.
    pub const fn none() -> Self {
        Self(0)
    }

    /// Mask containing exactly one device.
    pub const fn of_single_device(index: DeviceIndex) -> Self {
        Self(1 << index)
    }

    /// Mask containing the first `count` devices.
    pub const fn all(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub fn add(&mut self, index: DeviceIndex) {
        self.0 |= 1 << index;
    }

    pub const fn contains(&self, index: DeviceIndex) -> bool {
        self.0 & (1 << index) != 0
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the device indices set in this mask.
    pub fn iter(&self) -> impl Iterator<Item = DeviceIndex> + '_ {
        (0..32).filter(move |i| self.contains(*i))
    }
}

/// The queue families used by a logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub transfer: u32,
    pub framebuffer_transfer: u32,
}

/// Semaphore flavour requested at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline { initial_value: u64 },
}

/// One semaphore wait or signal operation of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    /// Ignored for binary semaphores.
    pub value: u64,
    pub stage_mask: vk::PipelineStageFlags2,
    pub device_index: DeviceIndex,
}

impl SemaphoreSubmit {
    /// Binary semaphore operation on device 0.
    pub fn binary(semaphore: vk::Semaphore, stage_mask: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            value: 0,
            stage_mask,
            device_index: 0,
        }
    }

    /// Timeline semaphore operation on device 0.
    pub fn timeline(semaphore: vk::Semaphore, value: u64, stage_mask: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            value,
            stage_mask,
            device_index: 0,
        }
    }

    /// Execute the operation on the given device of the group.
    pub fn on_device(mut self, device_index: DeviceIndex) -> Self {
        self.device_index = device_index;
        self
    }
}

/// Everything needed to submit one command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitBatch {
    pub command_buffer: vk::CommandBuffer,
    pub device_mask: DeviceMask,
    pub waits: Vec<SemaphoreSubmit>,
    pub signals: Vec<SemaphoreSubmit>,
}

/// A synchronization2 buffer memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// A synchronization2 image memory barrier over mip 0 / layer 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub src_stage_mask: vk::PipelineStageFlags2,
    pub src_access_mask: vk::AccessFlags2,
    pub dst_stage_mask: vk::PipelineStageFlags2,
    pub dst_access_mask: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub image: vk::Image,
    pub aspect_mask: vk::ImageAspectFlags,
}

/// Render pass begin parameters for the single colour + depth/stencil pass.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

/// 2D optimal-tiling image description.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
}

/// A display-plane surface and its visible extent.
#[derive(Debug, Clone, Copy)]
pub struct DisplaySurface {
    pub surface: vk::SurfaceKHR,
    pub extent: vk::Extent2D,
}

/// Swapchain parameters chosen by the display.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// One swapchain image to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentTarget {
    pub wait_semaphore: vk::Semaphore,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

/// The donut render pass and pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphicsPipeline {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_mask() {
        let mut mask = DeviceMask::of_single_device(2);
        assert_eq!(mask.bits(), 0b100);
        mask.add(0);
        assert!(mask.contains(0));
        assert!(!mask.contains(1));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(DeviceMask::none().is_empty());
        assert_eq!(DeviceMask::all(3).bits(), 0b111);
        assert_eq!(DeviceMask::all(32).bits(), u32::MAX);
    }

    #[test]
    fn test_semaphore_submit_builders() {
        let sem = vk::Semaphore::null();
        let op = SemaphoreSubmit::timeline(sem, 7, vk::PipelineStageFlags2::COPY).on_device(1);
        assert_eq!(op.value, 7);
        assert_eq!(op.device_index, 1);
        assert_eq!(SemaphoreSubmit::binary(sem, vk::PipelineStageFlags2::NONE).value, 0);
    }
}
