//! GPU device trait and error type
//!
//! This module defines the device interface the renderer core is written
//! against. The core never calls ash directly; it goes through
//! [`GpuDevice`], which is implemented by the Vulkan backend and by the
//! in-memory [`DummyDevice`](super::DummyDevice) used in tests.

use std::fmt;
use std::ptr::NonNull;

use ash::vk;

use super::types::*;

/// Errors reported by a GPU backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Device or host memory exhausted
    OutOfMemory,
    /// No memory type satisfies the requested property flags
    NoMemoryType,
    /// No queue family with the requested capabilities on every device
    NoQueueFamily,
    /// The enabled displays share no surface format
    NoSurfaceFormat,
    /// A required capability is missing
    Unsupported(String),
    /// A Vulkan call failed
    Backend(vk::Result),
    /// Device setup or bookkeeping error
    Device(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::OutOfMemory => write!(f, "GPU out of memory"),
            GpuError::NoMemoryType => write!(f, "No memory type with the requested properties"),
            GpuError::NoQueueFamily => write!(f, "No common queue family index found"),
            GpuError::NoSurfaceFormat => write!(f, "No common surface format"),
            GpuError::Unsupported(what) => write!(f, "Unsupported: {}", what),
            GpuError::Backend(result) => write!(f, "Vulkan error: {}", result),
            GpuError::Device(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                GpuError::OutOfMemory
            }
            other => GpuError::Backend(other),
        }
    }
}

/// A logical device spanning one device group.
///
/// Handles are plain ash handles. Destroy functions accept handles created
/// by the same device only. Recording functions must be called between
/// `begin_command_buffer` and `end_command_buffer` of that buffer, from one
/// thread at a time per command pool.
pub trait GpuDevice: Send + Sync {
    // --- topology ---------------------------------------------------------

    /// Number of physical devices in the group.
    fn physical_device_count(&self) -> u32;

    /// Queue families picked at device creation.
    fn queue_families(&self) -> QueueFamilies;

    /// Memory types and heaps of the group.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    // --- memory -----------------------------------------------------------

    /// Allocate a block of device memory. An empty mask allocates on every device.
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_mask: DeviceMask,
    ) -> Result<vk::DeviceMemory, GpuError>;

    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Persistently map the first `size` bytes of a host-visible block.
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<NonNull<u8>, GpuError>;

    fn unmap_memory(&self, memory: vk::DeviceMemory);

    // --- buffers and images -----------------------------------------------

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer, GpuError>;

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), GpuError>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image, GpuError>;

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), GpuError>;

    fn destroy_image(&self, image: vk::Image);

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView, GpuError>;

    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer, GpuError>;

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // --- synchronization --------------------------------------------------

    /// Create an unsignaled fence.
    fn create_fence(&self) -> Result<vk::Fence, GpuError>;

    /// Block until every fence is signaled. No timeout.
    fn wait_for_fences(&self, fences: &[vk::Fence]) -> Result<(), GpuError>;

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), GpuError>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<vk::Semaphore, GpuError>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Block until the whole device is idle.
    fn wait_idle(&self) -> Result<(), GpuError>;

    // --- command pools and buffers ----------------------------------------

    fn create_command_pool(&self, queue_family_index: u32) -> Result<vk::CommandPool, GpuError>;

    /// Reset a pool, returning all of its buffers to the initial state.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GpuError>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Allocate one primary command buffer.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, GpuError>;

    /// Begin one-time-submit recording. An empty mask records for every device.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, device_mask: DeviceMask) -> Result<(), GpuError>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), GpuError>;

    // --- recording --------------------------------------------------------

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// One by-region pipeline barrier holding all given barriers.
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    );

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// Push vertex-stage constants at offset 0.
    fn cmd_push_constants(&self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]);

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport);

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );

    /// Bind a `u32` index buffer.
    fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize);

    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32);

    // --- queues -----------------------------------------------------------

    /// Submit all batches in order with one `vkQueueSubmit2`, signaling `fence`.
    fn queue_submit(&self, queue_family_index: u32, batches: &[SubmitBatch], fence: vk::Fence) -> Result<(), GpuError>;

    /// Present every target with one `vkQueuePresentKHR`.
    fn queue_present(&self, queue_family_index: u32, targets: &[PresentTarget]) -> Result<(), GpuError>;

    // --- displays and swapchains ------------------------------------------

    /// Indices of the physical devices that report `display`.
    fn display_device_indices(&self, display: vk::DisplayKHR) -> Vec<DeviceIndex>;

    /// Human-readable display name, for logging.
    fn display_name(&self, display: vk::DisplayKHR) -> String;

    /// Create a surface on the display's plane using its largest mode.
    ///
    /// Fails with [`GpuError::Unsupported`] if the plane lacks opaque alpha.
    fn create_display_surface(&self, display: vk::DisplayKHR, device_index: DeviceIndex) -> Result<DisplaySurface, GpuError>;

    fn destroy_surface(&self, surface: vk::SurfaceKHR);

    fn present_rectangles(&self, device_index: DeviceIndex, surface: vk::SurfaceKHR) -> Result<Vec<vk::Rect2D>, GpuError>;

    fn surface_support(&self, device_index: DeviceIndex, queue_family_index: u32, surface: vk::SurfaceKHR) -> bool;

    fn surface_capabilities(
        &self,
        device_index: DeviceIndex,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, GpuError>;

    fn surface_formats(&self, device_index: DeviceIndex, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>, GpuError>;

    fn surface_present_modes(
        &self,
        device_index: DeviceIndex,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, GpuError>;

    /// Create a LOCAL_MULTI_DEVICE swapchain.
    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR, GpuError>;

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>, GpuError>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Acquire the next image, signaling `semaphore`. Suboptimal counts as success.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        device_mask: DeviceMask,
    ) -> Result<u32, GpuError>;

    // --- pipeline ---------------------------------------------------------

    /// Colour + depth/stencil render pass with one subpass.
    fn create_render_pass(&self, color_format: vk::Format, depth_format: vk::Format) -> Result<vk::RenderPass, GpuError>;

    /// The donut pipeline (per-vertex and per-instance bindings, push constants).
    fn create_donut_pipeline(&self, render_pass: vk::RenderPass) -> Result<GraphicsPipeline, GpuError>;

    /// Destroy pipeline, layout and render pass.
    fn destroy_pipeline(&self, pipeline: &GraphicsPipeline);
}
