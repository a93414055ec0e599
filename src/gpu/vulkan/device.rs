//! Vulkan logical device over a physical device group

use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr::NonNull;

use ash::extensions::khr;
use ash::vk;

use super::pipeline;
use crate::dd_emit;
use crate::gpu::select::select_queue_families;
use crate::gpu::traits::{GpuDevice, GpuError};
use crate::gpu::types::*;
use crate::sync::Mutex;

/// SPIR-V of the donut vertex and fragment shaders.
#[derive(Debug, Clone, Default)]
pub struct ShaderCode {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

struct DisplayInfo {
    display: vk::DisplayKHR,
    name: String,
    devices: Vec<DeviceIndex>,
}

/// A logical device created over one physical device group.
pub struct VulkanDevice {
    physical_devices: Vec<vk::PhysicalDevice>,
    device: ash::Device,
    queue_families: QueueFamilies,
    queues: HashMap<u32, Mutex<vk::Queue>>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    surface_loader: khr::Surface,
    display_loader: khr::Display,
    swapchain_loader: khr::Swapchain,
    displays: Vec<DisplayInfo>,
    shaders: ShaderCode,
}

impl VulkanDevice {
    /// Create a device over the device group at `group_index`.
    ///
    /// The instance must have been created for Vulkan 1.3 with
    /// `VK_KHR_surface` and `VK_KHR_display` enabled, and must outlive the
    /// returned device.
    pub fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        group_index: usize,
        shaders: ShaderCode,
    ) -> Result<Self, GpuError> {
        let group_count = unsafe { instance.enumerate_physical_device_groups_len()? };
        let mut groups = vec![vk::PhysicalDeviceGroupProperties::default(); group_count];
        unsafe { instance.enumerate_physical_device_groups(&mut groups)? };

        let group = groups
            .get(group_index)
            .ok_or_else(|| GpuError::Device(format!("no physical device group {}", group_index)))?;
        let physical_devices: Vec<vk::PhysicalDevice> =
            group.physical_devices[..group.physical_device_count as usize].to_vec();
        if physical_devices.is_empty() {
            return Err(GpuError::Device("empty physical device group".to_string()));
        }

        let per_device_flags: Vec<Vec<vk::QueueFlags>> = physical_devices
            .iter()
            .map(|pd| {
                unsafe { instance.get_physical_device_queue_family_properties(*pd) }
                    .iter()
                    .map(|props| props.queue_flags)
                    .collect()
            })
            .collect();
        let queue_families = match select_queue_families(&per_device_flags) {
            Some(families) => families,
            None => {
                dd_emit!(DD301, "device group {}", group_index);
                return Err(GpuError::NoQueueFamily);
            }
        };
        log::info!(
            "queue families: graphics {}, transfer {}, framebuffer transfer {}",
            queue_families.graphics,
            queue_families.transfer,
            queue_families.framebuffer_transfer
        );

        let mut unique_families = vec![
            queue_families.graphics,
            queue_families.transfer,
            queue_families.framebuffer_transfer,
        ];
        unique_families.sort_unstable();
        unique_families.dedup();

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let mut sync2 = vk::PhysicalDeviceSynchronization2Features::builder().synchronization2(true);
        let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::builder().timeline_semaphore(true);
        let mut group_info = vk::DeviceGroupDeviceCreateInfo::builder().physical_devices(&physical_devices);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut sync2)
            .push_next(&mut timeline);
        if physical_devices.len() > 1 {
            create_info = create_info.push_next(&mut group_info);
        }

        let device = unsafe { instance.create_device(physical_devices[0], &create_info, None)? };

        let queues = unique_families
            .iter()
            .map(|family| (*family, Mutex::new(unsafe { device.get_device_queue(*family, 0) })))
            .collect();

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_devices[0]) };

        let surface_loader = khr::Surface::new(entry, instance);
        let display_loader = khr::Display::new(entry, instance);
        let swapchain_loader = khr::Swapchain::new(instance, &device);

        let mut displays: Vec<DisplayInfo> = Vec::new();
        for (index, pd) in physical_devices.iter().enumerate() {
            let properties = unsafe { display_loader.get_physical_device_display_properties(*pd)? };
            for props in properties {
                if let Some(info) = displays.iter_mut().find(|d| d.display == props.display) {
                    info.devices.push(index as DeviceIndex);
                    continue;
                }
                let name = if props.display_name.is_null() {
                    format!("{:?}", props.display)
                } else {
                    unsafe { CStr::from_ptr(props.display_name) }.to_string_lossy().into_owned()
                };
                displays.push(DisplayInfo {
                    display: props.display,
                    name,
                    devices: vec![index as DeviceIndex],
                });
            }
        }

        Ok(Self {
            physical_devices,
            device,
            queue_families,
            queues,
            memory_properties,
            surface_loader,
            display_loader,
            swapchain_loader,
            displays,
            shaders,
        })
    }

    /// The raw ash device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// Displays visible to any device of the group.
    pub fn displays(&self) -> Vec<vk::DisplayKHR> {
        self.displays.iter().map(|d| d.display).collect()
    }

    fn physical_device(&self, device_index: DeviceIndex) -> Result<vk::PhysicalDevice, GpuError> {
        self.physical_devices
            .get(device_index as usize)
            .copied()
            .ok_or_else(|| GpuError::Device(format!("no physical device {}", device_index)))
    }

    fn queue(&self, queue_family_index: u32) -> Result<&Mutex<vk::Queue>, GpuError> {
        self.queues
            .get(&queue_family_index)
            .ok_or_else(|| GpuError::Device(format!("no queue for family {}", queue_family_index)))
    }

    fn device_mask_or_all(&self, mask: DeviceMask) -> u32 {
        if mask.is_empty() {
            DeviceMask::all(self.physical_devices.len() as u32).bits()
        } else {
            mask.bits()
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

fn semaphore_info(op: &SemaphoreSubmit) -> vk::SemaphoreSubmitInfo {
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(op.semaphore)
        .value(op.value)
        .stage_mask(op.stage_mask)
        .device_index(op.device_index)
        .build()
}

fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl GpuDevice for VulkanDevice {
    fn physical_device_count(&self) -> u32 {
        self.physical_devices.len() as u32
    }

    fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_mask: DeviceMask,
    ) -> Result<vk::DeviceMemory, GpuError> {
        let mut flags = vk::MemoryAllocateFlagsInfo::builder()
            .flags(vk::MemoryAllocateFlags::DEVICE_MASK)
            .device_mask(device_mask.bits());
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if !device_mask.is_empty() {
            info = info.push_next(&mut flags);
        }
        Ok(unsafe { self.device.allocate_memory(&info, None)? })
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<NonNull<u8>, GpuError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr as *mut u8).ok_or_else(|| GpuError::Device("vkMapMemory returned null".to_string()))
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn create_buffer(&self, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<vk::Buffer, GpuError> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        Ok(unsafe { self.device.create_buffer(&info, None)? })
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), GpuError> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, offset)? })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image, GpuError> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Ok(unsafe { self.device.create_image(&info, None)? })
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), GpuError> {
        Ok(unsafe { self.device.bind_image_memory(image, memory, offset)? })
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView, GpuError> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect_mask));
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer, GpuError> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_fence(&self) -> Result<vk::Fence, GpuError> {
        Ok(unsafe { self.device.create_fence(&vk::FenceCreateInfo::builder(), None)? })
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> Result<(), GpuError> {
        if fences.is_empty() {
            return Ok(());
        }
        Ok(unsafe { self.device.wait_for_fences(fences, true, u64::MAX)? })
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), GpuError> {
        if fences.is_empty() {
            return Ok(());
        }
        Ok(unsafe { self.device.reset_fences(fences)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<vk::Semaphore, GpuError> {
        let semaphore = match kind {
            SemaphoreKind::Binary => unsafe {
                self.device
                    .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)?
            },
            SemaphoreKind::Timeline { initial_value } => {
                let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
                    .semaphore_type(vk::SemaphoreType::TIMELINE)
                    .initial_value(initial_value);
                let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
                unsafe { self.device.create_semaphore(&info, None)? }
            }
        };
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        Ok(unsafe { self.device.device_wait_idle()? })
    }

    fn create_command_pool(&self, queue_family_index: u32) -> Result<vk::CommandPool, GpuError> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_family_index);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GpuError> {
        Ok(unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, GpuError> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Device("no command buffer allocated".to_string()))
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, device_mask: DeviceMask) -> Result<(), GpuError> {
        let mut group_info = vk::DeviceGroupCommandBufferBeginInfo::builder().device_mask(device_mask.bits());
        let mut info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if !device_mask.is_empty() {
            info = info.push_next(&mut group_info);
        }
        Ok(unsafe { self.device.begin_command_buffer(command_buffer, &info)? })
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), GpuError> {
        Ok(unsafe { self.device.end_command_buffer(command_buffer)? })
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) {
        let buffers: Vec<vk::BufferMemoryBarrier2> = buffer_barriers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier2::builder()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .src_queue_family_index(b.src_queue_family_index)
                    .dst_queue_family_index(b.dst_queue_family_index)
                    .buffer(b.buffer)
                    .offset(b.offset)
                    .size(b.size)
                    .build()
            })
            .collect();
        let images: Vec<vk::ImageMemoryBarrier2> = image_barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::builder()
                    .src_stage_mask(b.src_stage_mask)
                    .src_access_mask(b.src_access_mask)
                    .dst_stage_mask(b.dst_stage_mask)
                    .dst_access_mask(b.dst_access_mask)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(b.src_queue_family_index)
                    .dst_queue_family_index(b.dst_queue_family_index)
                    .image(b.image)
                    .subresource_range(subresource_range(b.aspect_mask))
                    .build()
            })
            .collect();
        let info = vk::DependencyInfo::builder()
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .buffer_memory_barriers(&buffers)
            .image_memory_barriers(&images);
        unsafe { self.device.cmd_pipeline_barrier2(command_buffer, &info) }
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: begin.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: begin.clear_depth,
                    stencil: begin.clear_stencil,
                },
            },
        ];
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area)
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) }
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_push_constants(&self, command_buffer: vk::CommandBuffer, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, vk::ShaderStageFlags::VERTEX, 0, data)
        }
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(command_buffer, 0, &[viewport]) }
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(command_buffer, 0, &[scissor]) }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe { self.device.cmd_bind_vertex_buffers(command_buffer, 0, buffers, offsets) }
    }

    fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, vk::IndexType::UINT32)
        }
    }

    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .cmd_draw_indexed(command_buffer, index_count, instance_count, 0, 0, 0)
        }
    }

    fn queue_submit(&self, queue_family_index: u32, batches: &[SubmitBatch], fence: vk::Fence) -> Result<(), GpuError> {
        let waits: Vec<Vec<vk::SemaphoreSubmitInfo>> = batches
            .iter()
            .map(|b| b.waits.iter().map(semaphore_info).collect())
            .collect();
        let signals: Vec<Vec<vk::SemaphoreSubmitInfo>> = batches
            .iter()
            .map(|b| b.signals.iter().map(semaphore_info).collect())
            .collect();
        let command_buffers: Vec<vk::CommandBufferSubmitInfo> = batches
            .iter()
            .map(|b| {
                vk::CommandBufferSubmitInfo::builder()
                    .command_buffer(b.command_buffer)
                    .device_mask(b.device_mask.bits())
                    .build()
            })
            .collect();
        let submits: Vec<vk::SubmitInfo2> = (0..batches.len())
            .map(|i| {
                vk::SubmitInfo2::builder()
                    .wait_semaphore_infos(&waits[i])
                    .command_buffer_infos(std::slice::from_ref(&command_buffers[i]))
                    .signal_semaphore_infos(&signals[i])
                    .build()
            })
            .collect();

        let queue = self.queue(queue_family_index)?.lock();
        Ok(unsafe { self.device.queue_submit2(*queue, &submits, fence)? })
    }

    fn queue_present(&self, queue_family_index: u32, targets: &[PresentTarget]) -> Result<(), GpuError> {
        let wait_semaphores: Vec<vk::Semaphore> = targets.iter().map(|t| t.wait_semaphore).collect();
        let swapchains: Vec<vk::SwapchainKHR> = targets.iter().map(|t| t.swapchain).collect();
        let image_indices: Vec<u32> = targets.iter().map(|t| t.image_index).collect();
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue(queue_family_index)?.lock();
        unsafe { self.swapchain_loader.queue_present(*queue, &info)? };
        Ok(())
    }

    fn display_device_indices(&self, display: vk::DisplayKHR) -> Vec<DeviceIndex> {
        self.displays
            .iter()
            .find(|d| d.display == display)
            .map(|d| d.devices.clone())
            .unwrap_or_default()
    }

    fn display_name(&self, display: vk::DisplayKHR) -> String {
        self.displays
            .iter()
            .find(|d| d.display == display)
            .map_or_else(|| format!("{:?}", display), |d| d.name.clone())
    }

    fn create_display_surface(&self, display: vk::DisplayKHR, device_index: DeviceIndex) -> Result<DisplaySurface, GpuError> {
        let pd = self.physical_device(device_index)?;

        let modes = unsafe { self.display_loader.get_display_mode_properties(pd, display)? };
        let mode = modes
            .iter()
            .max_by_key(|m| {
                let p = m.parameters;
                (p.visible_region.width, p.visible_region.height, p.refresh_rate)
            })
            .ok_or_else(|| GpuError::Unsupported("display has no modes".to_string()))?;

        let planes = unsafe { self.display_loader.get_physical_device_display_plane_properties(pd)? };
        let mut plane_index = None;
        for index in 0..planes.len() as u32 {
            let supported = unsafe { self.display_loader.get_display_plane_supported_displays(pd, index)? };
            if supported.contains(&display) {
                plane_index = Some(index);
                break;
            }
        }
        let plane_index = plane_index.ok_or_else(|| GpuError::Unsupported("no plane for display".to_string()))?;

        let caps = unsafe {
            self.display_loader
                .get_display_plane_capabilities(pd, mode.display_mode, plane_index)?
        };
        if !caps.supported_alpha.contains(vk::DisplayPlaneAlphaFlagsKHR::OPAQUE) {
            return Err(GpuError::Unsupported("display plane lacks opaque alpha".to_string()));
        }

        let extent = mode.parameters.visible_region;
        let info = vk::DisplaySurfaceCreateInfoKHR::builder()
            .display_mode(mode.display_mode)
            .plane_index(plane_index)
            .plane_stack_index(planes[plane_index as usize].current_stack_index)
            .transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .global_alpha(1.0)
            .alpha_mode(vk::DisplayPlaneAlphaFlagsKHR::OPAQUE)
            .image_extent(extent);
        let surface = unsafe { self.display_loader.create_display_plane_surface(&info, None)? };

        Ok(DisplaySurface { surface, extent })
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) }
    }

    fn present_rectangles(&self, device_index: DeviceIndex, surface: vk::SurfaceKHR) -> Result<Vec<vk::Rect2D>, GpuError> {
        let pd = self.physical_device(device_index)?;
        Ok(unsafe {
            self.swapchain_loader
                .get_physical_device_present_rectangles(pd, surface)?
        })
    }

    fn surface_support(&self, device_index: DeviceIndex, queue_family_index: u32, surface: vk::SurfaceKHR) -> bool {
        let Ok(pd) = self.physical_device(device_index) else {
            return false;
        };
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(pd, queue_family_index, surface)
                .unwrap_or(false)
        }
    }

    fn surface_capabilities(
        &self,
        device_index: DeviceIndex,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, GpuError> {
        let pd = self.physical_device(device_index)?;
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(pd, surface)?
        })
    }

    fn surface_formats(&self, device_index: DeviceIndex, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>, GpuError> {
        let pd = self.physical_device(device_index)?;
        Ok(unsafe { self.surface_loader.get_physical_device_surface_formats(pd, surface)? })
    }

    fn surface_present_modes(
        &self,
        device_index: DeviceIndex,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, GpuError> {
        let pd = self.physical_device(device_index)?;
        Ok(unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(pd, surface)?
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR, GpuError> {
        let mut group_info =
            vk::DeviceGroupSwapchainCreateInfoKHR::builder().modes(vk::DeviceGroupPresentModeFlagsKHR::LOCAL_MULTI_DEVICE);
        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);
        if self.physical_devices.len() > 1 {
            info = info.push_next(&mut group_info);
        }
        Ok(unsafe { self.swapchain_loader.create_swapchain(&info, None)? })
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>, GpuError> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        device_mask: DeviceMask,
    ) -> Result<u32, GpuError> {
        let info = vk::AcquireNextImageInfoKHR::builder()
            .swapchain(swapchain)
            .timeout(u64::MAX)
            .semaphore(semaphore)
            .fence(vk::Fence::null())
            .device_mask(self.device_mask_or_all(device_mask));
        let (index, _suboptimal) = unsafe { self.swapchain_loader.acquire_next_image2(&info)? };
        Ok(index)
    }

    fn create_render_pass(&self, color_format: vk::Format, depth_format: vk::Format) -> Result<vk::RenderPass, GpuError> {
        Ok(pipeline::create_render_pass(&self.device, color_format, depth_format)?)
    }

    fn create_donut_pipeline(&self, render_pass: vk::RenderPass) -> Result<GraphicsPipeline, GpuError> {
        let (layout, pipeline) =
            pipeline::create_donut_pipeline(&self.device, render_pass, &self.shaders.vertex, &self.shaders.fragment)?;
        Ok(GraphicsPipeline {
            render_pass,
            layout,
            pipeline,
        })
    }

    fn destroy_pipeline(&self, pipeline: &GraphicsPipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
            self.device.destroy_render_pass(pipeline.render_pass, None);
        }
    }
}
