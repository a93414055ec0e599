//! Dummy GPU device for testing
//!
//! Hands out unique handles, backs every memory block with heap storage and
//! executes submissions immediately. Copies recorded in command buffers are
//! applied to that storage on submit, so tests can read back what reached a
//! device-local buffer. Misuse that a validation layer would catch is
//! collected in [`DummyDevice::validation_errors`] instead of aborting.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ash::vk;
use ash::vk::Handle;

use super::traits::{GpuDevice, GpuError};
use super::types::*;
use crate::sync::Mutex;

/// A display known to the dummy device.
#[derive(Debug, Clone)]
pub struct DummyDisplay {
    pub handle: vk::DisplayKHR,
    pub name: String,
    pub extent: vk::Extent2D,
    /// Present rectangles per device index that sees the display.
    pub present_rects: Vec<(DeviceIndex, Vec<vk::Rect2D>)>,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub opaque_alpha: bool,
    /// 0 means unbounded.
    pub max_image_count: u32,
}

impl DummyDisplay {
    /// A display of the given size seen in full by device 0.
    pub fn new(raw: u64, name: &str, width: u32, height: u32) -> Self {
        let extent = vk::Extent2D { width, height };
        Self {
            handle: vk::DisplayKHR::from_raw(raw),
            name: name.to_string(),
            extent,
            present_rects: vec![(0, vec![full_rect(extent)])],
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            opaque_alpha: true,
            max_image_count: 8,
        }
    }

    /// Replace the present rectangles with explicit per-device ones.
    pub fn with_present_rects(mut self, rects: Vec<(DeviceIndex, Vec<vk::Rect2D>)>) -> Self {
        self.present_rects = rects;
        self
    }

    pub fn with_formats(mut self, formats: Vec<vk::SurfaceFormatKHR>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_opaque_alpha(mut self, opaque_alpha: bool) -> Self {
        self.opaque_alpha = opaque_alpha;
        self
    }

    pub fn with_max_image_count(mut self, max_image_count: u32) -> Self {
        self.max_image_count = max_image_count;
        self
    }
}

fn full_rect(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// A command captured by the dummy device.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        /// `(src_offset, dst_offset, size)` per region.
        regions: Vec<(vk::DeviceSize, vk::DeviceSize, vk::DeviceSize)>,
    },
    PipelineBarrier {
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    BeginRenderPass {
        framebuffer: vk::Framebuffer,
        /// `(x, y, width, height)`
        render_area: (i32, i32, u32, u32),
        clear_color: [f32; 4],
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    PushConstants(Vec<u8>),
    /// `(x, y, width, height)`
    SetViewport(f32, f32, f32, f32),
    SetScissor(i32, i32, u32, u32),
    BindVertexBuffers(Vec<vk::Buffer>),
    BindIndexBuffer(vk::Buffer),
    DrawIndexed { index_count: u32, instance_count: u32 },
}

/// One `queue_submit` call.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub queue_family_index: u32,
    pub batches: Vec<SubmitBatch>,
    pub fence: vk::Fence,
}

/// Number of live objects per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub memory: usize,
    pub buffers: usize,
    pub images: usize,
    pub image_views: usize,
    pub framebuffers: usize,
    pub fences: usize,
    pub semaphores: usize,
    pub command_pools: usize,
    pub swapchains: usize,
    pub surfaces: usize,
    pub pipelines: usize,
}

/// Heap storage of one memory block.
struct HostBlock {
    ptr: NonNull<u8>,
    len: usize,
}

// The block is only touched through raw pointers handed out by map_memory
// or under the device lock.
unsafe impl Send for HostBlock {}

impl HostBlock {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len.max(1)].into_boxed_slice();
        let len = boxed.len();
        // SAFETY: Box::into_raw never returns null
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut u8) };
        Self { ptr, len }
    }

    fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        // SAFETY: range checked against the allocation
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from Box::into_raw in `zeroed`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)));
        }
    }
}

struct MemoryBlock {
    type_index: u32,
    device_mask: DeviceMask,
    storage: HostBlock,
    mapped: bool,
}

struct BufferState {
    size: vk::DeviceSize,
    bound: Option<(vk::DeviceMemory, vk::DeviceSize)>,
}

struct CommandBufferState {
    pool: vk::CommandPool,
    recording: bool,
    device_mask: DeviceMask,
    commands: Vec<RecordedCommand>,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next_image: u32,
}

#[derive(Default)]
struct DummyState {
    memory: HashMap<vk::DeviceMemory, MemoryBlock>,
    buffers: HashMap<vk::Buffer, BufferState>,
    images: HashMap<vk::Image, ImageDesc>,
    image_views: HashMap<vk::ImageView, vk::Image>,
    framebuffers: HashMap<vk::Framebuffer, vk::Extent2D>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, SemaphoreKind>,
    timeline_values: HashMap<vk::Semaphore, u64>,
    command_pools: HashMap<vk::CommandPool, u32>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    surfaces: HashMap<vk::SurfaceKHR, vk::DisplayKHR>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    swapchain_images: HashMap<vk::Image, vk::SwapchainKHR>,
    pipelines: HashMap<vk::Pipeline, GraphicsPipeline>,
    submissions: Vec<SubmitRecord>,
    presents: Vec<Vec<PresentTarget>>,
    acquires: Vec<(vk::SwapchainKHR, vk::Semaphore, DeviceMask)>,
    validation_errors: Vec<String>,
}

impl DummyState {
    fn validation(&mut self, msg: String) {
        log::error!("dummy device validation: {}", msg);
        self.validation_errors.push(msg);
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        let recording = self.command_buffers.get(&command_buffer).map(|s| s.recording);
        match recording {
            Some(true) => {
                if let Some(state) = self.command_buffers.get_mut(&command_buffer) {
                    state.commands.push(command);
                }
            }
            Some(false) => self.validation(format!("{:?} recorded outside begin/end", command)),
            None => self.validation(format!("{:?} recorded into unknown command buffer", command)),
        }
    }

    fn execute_copy(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[(u64, u64, u64)]) {
        let src_binding = self.buffers.get(&src).and_then(|b| b.bound);
        let dst_binding = self.buffers.get(&dst).and_then(|b| b.bound);
        let (Some((src_mem, src_base)), Some((dst_mem, dst_base))) = (src_binding, dst_binding) else {
            self.validation(format!("copy between unbound buffers {:?} -> {:?}", src, dst));
            return;
        };

        for &(src_offset, dst_offset, size) in regions {
            let data = self
                .memory
                .get(&src_mem)
                .and_then(|m| m.storage.bytes((src_base + src_offset) as usize, size as usize))
                .map(<[u8]>::to_vec);
            let Some(data) = data else {
                self.validation(format!("copy source out of range on {:?}", src));
                continue;
            };
            let Some((ptr, capacity)) = self.memory.get(&dst_mem).map(|m| (m.storage.ptr, m.storage.len)) else {
                self.validation(format!("copy destination memory of {:?} freed", dst));
                continue;
            };
            let start = (dst_base + dst_offset) as usize;
            if start + data.len() > capacity {
                self.validation(format!("copy destination out of range on {:?}", dst));
                continue;
            }
            // SAFETY: range checked; the block stays alive while the lock is held
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(start), data.len());
            }
        }
    }
}

/// In-memory [`GpuDevice`].
///
/// Queue families: 0 graphics, 1 transfer, 2 framebuffer transfer.
/// Memory types: 0 device local, 1 host visible + coherent, 2 host visible +
/// coherent + cached.
pub struct DummyDevice {
    device_count: u32,
    displays: Vec<DummyDisplay>,
    next_handle: AtomicU64,
    fail_acquire: AtomicBool,
    fail_present: AtomicBool,
    fail_begin: AtomicBool,
    fail_buffer_creation: AtomicBool,
    state: Mutex<DummyState>,
}

impl DummyDevice {
    /// A device group of `device_count` physical devices without displays.
    pub fn new(device_count: u32) -> Self {
        Self {
            device_count: device_count.max(1),
            displays: Vec::new(),
            next_handle: AtomicU64::new(0x1000),
            fail_acquire: AtomicBool::new(false),
            fail_present: AtomicBool::new(false),
            fail_begin: AtomicBool::new(false),
            fail_buffer_creation: AtomicBool::new(false),
            state: Mutex::new(DummyState::default()),
        }
    }

    pub fn with_display(mut self, display: DummyDisplay) -> Self {
        self.displays.push(display);
        self
    }

    /// Make every following acquire fail until reset.
    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::Relaxed);
    }

    /// Make every following present fail until reset.
    pub fn set_fail_present(&self, fail: bool) {
        self.fail_present.store(fail, Ordering::Relaxed);
    }

    /// Make every following `begin_command_buffer` fail until reset.
    pub fn set_fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::Relaxed);
    }

    /// Make every following `create_buffer` fail with out of memory until reset.
    pub fn set_fail_buffer_creation(&self, fail: bool) {
        self.fail_buffer_creation.store(fail, Ordering::Relaxed);
    }

    fn next_raw(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn display(&self, display: vk::DisplayKHR) -> Option<&DummyDisplay> {
        self.displays.iter().find(|d| d.handle == display)
    }

    fn surface_display(&self, surface: vk::SurfaceKHR) -> Result<&DummyDisplay, GpuError> {
        let display = self
            .state
            .lock()
            .surfaces
            .get(&surface)
            .copied()
            .ok_or_else(|| GpuError::Device(format!("unknown surface {:?}", surface)))?;
        self.display(display)
            .ok_or_else(|| GpuError::Device(format!("unknown display {:?}", display)))
    }

    /// Commands recorded into `command_buffer` since its last begin.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    /// Whether `command_buffer` was begun and not yet ended.
    pub fn is_recording(&self, command_buffer: vk::CommandBuffer) -> bool {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map_or(false, |s| s.recording)
    }

    /// Device mask passed to the last begin of `command_buffer`.
    pub fn command_buffer_device_mask(&self, command_buffer: vk::CommandBuffer) -> Option<DeviceMask> {
        self.state.lock().command_buffers.get(&command_buffer).map(|s| s.device_mask)
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state.lock().submissions.clone()
    }

    /// Drain the submission log.
    pub fn take_submissions(&self) -> Vec<SubmitRecord> {
        std::mem::take(&mut self.state.lock().submissions)
    }

    pub fn presents(&self) -> Vec<Vec<PresentTarget>> {
        self.state.lock().presents.clone()
    }

    pub fn acquire_count(&self) -> usize {
        self.state.lock().acquires.len()
    }

    /// Highest value signaled on a timeline semaphore so far.
    pub fn timeline_value(&self, semaphore: vk::Semaphore) -> Option<u64> {
        let state = self.state.lock();
        match state.semaphores.get(&semaphore)? {
            SemaphoreKind::Timeline { initial_value } => {
                Some(state.timeline_values.get(&semaphore).copied().unwrap_or(*initial_value))
            }
            SemaphoreKind::Binary => None,
        }
    }

    /// Contents of the memory bound to `buffer`.
    pub fn read_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let buf = state.buffers.get(&buffer)?;
        let (memory, base) = buf.bound?;
        if offset + len as u64 > buf.size {
            return None;
        }
        state
            .memory
            .get(&memory)?
            .storage
            .bytes((base + offset) as usize, len)
            .map(<[u8]>::to_vec)
    }

    /// Size of a live memory block.
    pub fn memory_size(&self, memory: vk::DeviceMemory) -> Option<vk::DeviceSize> {
        self.state.lock().memory.get(&memory).map(|m| m.storage.len as vk::DeviceSize)
    }

    /// Memory type and device mask of a live memory block.
    pub fn memory_info(&self, memory: vk::DeviceMemory) -> Option<(u32, DeviceMask)> {
        self.state.lock().memory.get(&memory).map(|m| (m.type_index, m.device_mask))
    }

    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            memory: state.memory.len(),
            buffers: state.buffers.len(),
            images: state.images.len(),
            image_views: state.image_views.len(),
            framebuffers: state.framebuffers.len(),
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            command_pools: state.command_pools.len(),
            swapchains: state.swapchains.len(),
            surfaces: state.surfaces.len(),
            pipelines: state.pipelines.len(),
        }
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().validation_errors.clone()
    }
}

const BUFFER_ALIGNMENT: vk::DeviceSize = 256;
const IMAGE_ALIGNMENT: vk::DeviceSize = 4096;

impl GpuDevice for DummyDevice {
    fn physical_device_count(&self) -> u32 {
        self.device_count
    }

    fn queue_families(&self) -> QueueFamilies {
        QueueFamilies {
            graphics: 0,
            transfer: 1,
            framebuffer_transfer: 2,
        }
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let types = [
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (host, 1),
            (host | vk::MemoryPropertyFlags::HOST_CACHED, 1),
        ];
        props.memory_type_count = types.len() as u32;
        for (i, (flags, heap)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: *heap,
            };
        }
        props.memory_heap_count = 2;
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 8 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_heaps[1] = vk::MemoryHeap {
            size: 16 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        props
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_mask: DeviceMask,
    ) -> Result<vk::DeviceMemory, GpuError> {
        if memory_type_index >= 3 {
            return Err(GpuError::NoMemoryType);
        }
        if !device_mask.is_empty() && device_mask.bits() >> self.device_count != 0 {
            return Err(GpuError::Device(format!("device mask {:#b} out of range", device_mask.bits())));
        }
        let memory = vk::DeviceMemory::from_raw(self.next_raw());
        self.state.lock().memory.insert(
            memory,
            MemoryBlock {
                type_index: memory_type_index,
                device_mask,
                storage: HostBlock::zeroed(size as usize),
                mapped: false,
            },
        );
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        match state.memory.remove(&memory) {
            Some(block) if block.mapped => state.validation(format!("{:?} freed while mapped", memory)),
            Some(_) => {}
            None => state.validation(format!("free of unknown memory {:?}", memory)),
        }
    }

    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Result<NonNull<u8>, GpuError> {
        let mut state = self.state.lock();
        let block = state
            .memory
            .get_mut(&memory)
            .ok_or_else(|| GpuError::Device(format!("map of unknown memory {:?}", memory)))?;
        if block.type_index == 0 {
            return Err(GpuError::Unsupported("mapping device-local memory".to_string()));
        }
        if size as usize > block.storage.len {
            return Err(GpuError::Device("map range exceeds allocation".to_string()));
        }
        block.mapped = true;
        Ok(block.storage.ptr)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(block) = self.state.lock().memory.get_mut(&memory) {
            block.mapped = false;
        }
    }

    fn create_buffer(&self, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer, GpuError> {
        if self.fail_buffer_creation.load(Ordering::Relaxed) {
            return Err(GpuError::OutOfMemory);
        }
        let buffer = vk::Buffer::from_raw(self.next_raw());
        self.state.lock().buffers.insert(buffer, BufferState { size, bound: None });
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self.state.lock().buffers.get(&buffer).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size: crate::util::layout::align_up(size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        if !state.memory.contains_key(&memory) {
            return Err(GpuError::Device(format!("bind to unknown memory {:?}", memory)));
        }
        let buf = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::Device(format!("bind of unknown buffer {:?}", buffer)))?;
        buf.bound = Some((memory, offset));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer).is_none() {
            state.validation(format!("destroy of unknown buffer {:?}", buffer));
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image, GpuError> {
        let image = vk::Image::from_raw(self.next_raw());
        self.state.lock().images.insert(image, *desc);
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .images
            .get(&image)
            .map_or(0, |d| d.extent.width as u64 * d.extent.height as u64 * 4);
        vk::MemoryRequirements {
            size: crate::util::layout::align_up(size, IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: 0b001,
        }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<(), GpuError> {
        let state = self.state.lock();
        if !state.images.contains_key(&image) || !state.memory.contains_key(&memory) {
            return Err(GpuError::Device(format!("bad image binding {:?} -> {:?}", image, memory)));
        }
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_none() {
            state.validation(format!("destroy of unknown image {:?}", image));
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect_mask: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView, GpuError> {
        let view = vk::ImageView::from_raw(self.next_raw());
        let mut state = self.state.lock();
        if !state.images.contains_key(&image) && !state.swapchain_images.contains_key(&image) {
            return Err(GpuError::Device(format!("view of unknown image {:?}", image)));
        }
        state.image_views.insert(view, image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if state.image_views.remove(&view).is_none() {
            state.validation(format!("destroy of unknown image view {:?}", view));
        }
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer, GpuError> {
        let mut state = self.state.lock();
        if let Some(view) = attachments.iter().find(|v| !state.image_views.contains_key(v)) {
            return Err(GpuError::Device(format!("framebuffer with unknown view {:?}", view)));
        }
        let framebuffer = vk::Framebuffer::from_raw(self.next_raw());
        state.framebuffers.insert(framebuffer, extent);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        if state.framebuffers.remove(&framebuffer).is_none() {
            state.validation(format!("destroy of unknown framebuffer {:?}", framebuffer));
        }
    }

    fn create_fence(&self) -> Result<vk::Fence, GpuError> {
        let fence = vk::Fence::from_raw(self.next_raw());
        self.state.lock().fences.insert(fence, false);
        Ok(fence)
    }

    fn wait_for_fences(&self, fences: &[vk::Fence]) -> Result<(), GpuError> {
        let state = self.state.lock();
        for fence in fences {
            match state.fences.get(fence) {
                Some(true) => {}
                Some(false) => return Err(GpuError::Device(format!("{:?} would never signal", fence))),
                None => return Err(GpuError::Device(format!("wait on unknown fence {:?}", fence))),
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        for fence in fences {
            match state.fences.get_mut(fence) {
                Some(signaled) => *signaled = false,
                None => return Err(GpuError::Device(format!("reset of unknown fence {:?}", fence))),
            }
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence).is_none() {
            state.validation(format!("destroy of unknown fence {:?}", fence));
        }
    }

    fn create_semaphore(&self, kind: SemaphoreKind) -> Result<vk::Semaphore, GpuError> {
        let semaphore = vk::Semaphore::from_raw(self.next_raw());
        self.state.lock().semaphores.insert(semaphore, kind);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.timeline_values.remove(&semaphore);
        if state.semaphores.remove(&semaphore).is_none() {
            state.validation(format!("destroy of unknown semaphore {:?}", semaphore));
        }
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        Ok(())
    }

    fn create_command_pool(&self, queue_family_index: u32) -> Result<vk::CommandPool, GpuError> {
        if queue_family_index > 2 {
            return Err(GpuError::NoQueueFamily);
        }
        let pool = vk::CommandPool::from_raw(self.next_raw());
        self.state.lock().command_pools.insert(pool, queue_family_index);
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        for cb in state.command_buffers.values_mut().filter(|cb| cb.pool == pool) {
            cb.recording = false;
            cb.commands.clear();
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.command_buffers.retain(|_, cb| cb.pool != pool);
        if state.command_pools.remove(&pool).is_none() {
            state.validation(format!("destroy of unknown command pool {:?}", pool));
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, GpuError> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool) {
            return Err(GpuError::Device(format!("allocation from unknown pool {:?}", pool)));
        }
        let command_buffer = vk::CommandBuffer::from_raw(self.next_raw());
        state.command_buffers.insert(
            command_buffer,
            CommandBufferState {
                pool,
                recording: false,
                device_mask: DeviceMask::none(),
                commands: Vec::new(),
            },
        );
        Ok(command_buffer)
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, device_mask: DeviceMask) -> Result<(), GpuError> {
        if self.fail_begin.load(Ordering::Relaxed) {
            return Err(GpuError::Backend(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        }
        let mut state = self.state.lock();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| GpuError::Device(format!("begin of unknown command buffer {:?}", command_buffer)))?;
        if cb.recording {
            return Err(GpuError::Device(format!("{:?} is already recording", command_buffer)));
        }
        cb.recording = true;
        cb.device_mask = device_mask;
        cb.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.recording => {
                cb.recording = false;
                Ok(())
            }
            Some(_) => Err(GpuError::Device(format!("end without begin on {:?}", command_buffer))),
            None => Err(GpuError::Device(format!("end of unknown command buffer {:?}", command_buffer))),
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let regions = regions.iter().map(|r| (r.src_offset, r.dst_offset, r.size)).collect();
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::CopyBuffer { src, dst, regions });
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::PipelineBarrier {
                buffers: buffer_barriers.to_vec(),
                images: image_barriers.to_vec(),
            },
        );
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        let area = begin.render_area;
        self.state.lock().record(
            command_buffer,
            RecordedCommand::BeginRenderPass {
                framebuffer: begin.framebuffer,
                render_area: (area.offset.x, area.offset.y, area.extent.width, area.extent.height),
                clear_color: begin.clear_color,
            },
        );
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().record(command_buffer, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.lock().record(command_buffer, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_push_constants(&self, command_buffer: vk::CommandBuffer, _layout: vk::PipelineLayout, data: &[u8]) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::PushConstants(data.to_vec()));
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::SetViewport(viewport.x, viewport.y, viewport.width, viewport.height),
        );
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::SetScissor(
                scissor.offset.x,
                scissor.offset.y,
                scissor.extent.width,
                scissor.extent.height,
            ),
        );
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::BindVertexBuffers(buffers.to_vec()));
    }

    fn cmd_bind_index_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.state
            .lock()
            .record(command_buffer, RecordedCommand::BindIndexBuffer(buffer));
    }

    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        self.state.lock().record(
            command_buffer,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn queue_submit(&self, queue_family_index: u32, batches: &[SubmitBatch], fence: vk::Fence) -> Result<(), GpuError> {
        let mut state = self.state.lock();

        for batch in batches {
            let lookup = state.command_buffers.get(&batch.command_buffer).map(|cb| {
                let copies: Vec<_> = cb
                    .commands
                    .iter()
                    .filter_map(|c| match c {
                        RecordedCommand::CopyBuffer { src, dst, regions } => Some((*src, *dst, regions.clone())),
                        _ => None,
                    })
                    .collect();
                (cb.recording, cb.pool, copies)
            });
            let copies = match lookup {
                Some((true, _, _)) => {
                    state.validation(format!("{:?} submitted while recording", batch.command_buffer));
                    continue;
                }
                Some((false, pool, copies)) => {
                    if state.command_pools.get(&pool) != Some(&queue_family_index) {
                        let msg = format!("{:?} submitted to family {}", batch.command_buffer, queue_family_index);
                        state.validation(msg);
                    }
                    copies
                }
                None => {
                    state.validation(format!("submit of unknown command buffer {:?}", batch.command_buffer));
                    continue;
                }
            };
            for (src, dst, regions) in copies {
                state.execute_copy(src, dst, &regions);
            }
            for signal in &batch.signals {
                let is_timeline = matches!(
                    state.semaphores.get(&signal.semaphore),
                    Some(SemaphoreKind::Timeline { .. })
                );
                if is_timeline {
                    let value = state.timeline_values.entry(signal.semaphore).or_insert(0);
                    *value = (*value).max(signal.value);
                }
            }
        }

        if fence != vk::Fence::null() {
            match state.fences.get(&fence).copied() {
                Some(true) => state.validation(format!("{:?} submitted while still signaled", fence)),
                Some(false) => {
                    state.fences.insert(fence, true);
                }
                None => return Err(GpuError::Device(format!("submit with unknown fence {:?}", fence))),
            }
        }

        state.submissions.push(SubmitRecord {
            queue_family_index,
            batches: batches.to_vec(),
            fence,
        });
        Ok(())
    }

    fn queue_present(&self, _queue_family_index: u32, targets: &[PresentTarget]) -> Result<(), GpuError> {
        if self.fail_present.load(Ordering::Relaxed) {
            return Err(GpuError::Backend(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        let mut state = self.state.lock();
        for target in targets {
            let known = state
                .swapchains
                .get(&target.swapchain)
                .map_or(false, |s| (target.image_index as usize) < s.images.len());
            if !known {
                state.validation(format!("present of unknown image {:?}", target));
            }
        }
        state.presents.push(targets.to_vec());
        Ok(())
    }

    fn display_device_indices(&self, display: vk::DisplayKHR) -> Vec<DeviceIndex> {
        self.display(display)
            .map(|d| {
                d.present_rects
                    .iter()
                    .map(|(index, _)| *index)
                    .filter(|index| *index < self.device_count)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn display_name(&self, display: vk::DisplayKHR) -> String {
        self.display(display)
            .map_or_else(|| format!("{:?}", display), |d| d.name.clone())
    }

    fn create_display_surface(&self, display: vk::DisplayKHR, device_index: DeviceIndex) -> Result<DisplaySurface, GpuError> {
        let info = self
            .display(display)
            .ok_or_else(|| GpuError::Device(format!("unknown display {:?}", display)))?;
        if !info.present_rects.iter().any(|(index, _)| *index == device_index) {
            return Err(GpuError::Device(format!("{} not visible to device {}", info.name, device_index)));
        }
        if !info.opaque_alpha {
            return Err(GpuError::Unsupported("display plane lacks opaque alpha".to_string()));
        }
        let surface = vk::SurfaceKHR::from_raw(self.next_raw());
        self.state.lock().surfaces.insert(surface, display);
        Ok(DisplaySurface {
            surface,
            extent: info.extent,
        })
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        let mut state = self.state.lock();
        if state.surfaces.remove(&surface).is_none() {
            state.validation(format!("destroy of unknown surface {:?}", surface));
        }
    }

    fn present_rectangles(&self, device_index: DeviceIndex, surface: vk::SurfaceKHR) -> Result<Vec<vk::Rect2D>, GpuError> {
        let display = self.surface_display(surface)?;
        Ok(display
            .present_rects
            .iter()
            .find(|(index, _)| *index == device_index)
            .map(|(_, rects)| rects.clone())
            .unwrap_or_default())
    }

    fn surface_support(&self, _device_index: DeviceIndex, _queue_family_index: u32, surface: vk::SurfaceKHR) -> bool {
        self.state.lock().surfaces.contains_key(&surface)
    }

    fn surface_capabilities(
        &self,
        _device_index: DeviceIndex,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, GpuError> {
        let display = self.surface_display(surface)?;
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: display.max_image_count,
            current_extent: display.extent,
            min_image_extent: display.extent,
            max_image_extent: display.extent,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        })
    }

    fn surface_formats(&self, _device_index: DeviceIndex, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>, GpuError> {
        Ok(self.surface_display(surface)?.formats.clone())
    }

    fn surface_present_modes(
        &self,
        _device_index: DeviceIndex,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, GpuError> {
        self.surface_display(surface)?;
        Ok(vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO])
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR, GpuError> {
        self.surface_display(desc.surface)?;
        let swapchain = vk::SwapchainKHR::from_raw(self.next_raw());
        let images: Vec<vk::Image> = (0..desc.min_image_count)
            .map(|_| vk::Image::from_raw(self.next_raw()))
            .collect();

        let mut state = self.state.lock();
        for image in &images {
            state.swapchain_images.insert(*image, swapchain);
        }
        state.swapchains.insert(swapchain, SwapchainState { images, next_image: 0 });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>, GpuError> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or_else(|| GpuError::Device(format!("unknown swapchain {:?}", swapchain)))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchain_images.retain(|_, owner| *owner != swapchain);
        if state.swapchains.remove(&swapchain).is_none() {
            state.validation(format!("destroy of unknown swapchain {:?}", swapchain));
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        device_mask: DeviceMask,
    ) -> Result<u32, GpuError> {
        if self.fail_acquire.load(Ordering::Relaxed) {
            return Err(GpuError::Backend(vk::Result::ERROR_OUT_OF_DATE_KHR));
        }
        let mut state = self.state.lock();
        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GpuError::Device(format!("unknown swapchain {:?}", swapchain)))?;
        let index = chain.next_image;
        chain.next_image = (index + 1) % chain.images.len().max(1) as u32;
        state.acquires.push((swapchain, semaphore, device_mask));
        Ok(index)
    }

    fn create_render_pass(&self, _color_format: vk::Format, _depth_format: vk::Format) -> Result<vk::RenderPass, GpuError> {
        Ok(vk::RenderPass::from_raw(self.next_raw()))
    }

    fn create_donut_pipeline(&self, render_pass: vk::RenderPass) -> Result<GraphicsPipeline, GpuError> {
        let pipeline = GraphicsPipeline {
            render_pass,
            layout: vk::PipelineLayout::from_raw(self.next_raw()),
            pipeline: vk::Pipeline::from_raw(self.next_raw()),
        };
        self.state.lock().pipelines.insert(pipeline.pipeline, pipeline);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: &GraphicsPipeline) {
        let mut state = self.state.lock();
        if state.pipelines.remove(&pipeline.pipeline).is_none() {
            state.validation(format!("destroy of unknown pipeline {:?}", pipeline.pipeline));
        }
    }
}
