//! A display driven directly by a logical device.
//!
//! Every physical device of the group that sees the display gets one
//! render thread. The threads share the swapchain image but each one only
//! touches the bounding box of its device's present rectangles.

use std::sync::Arc;

use ash::vk;

use super::config::CanvasRegion;
use super::context::DeviceContext;
use crate::allocators::ImageAllocation;
use crate::command::CommandExecutionUnit;
use crate::dd_emit;
use crate::gpu::{
    DeviceIndex, DeviceMask, DisplaySurface, GpuDevice, GpuError, GraphicsPipeline, ImageBarrier, ImageDesc,
    PresentTarget, SemaphoreKind, SemaphoreSubmit, SwapchainDesc,
};
use crate::render::{CanvasRegionRenderer, RegionTarget, RenderThread};
use crate::scene::Scene;
use crate::sync::RwLock;

/// Depth/stencil format of every display framebuffer.
pub const DEPTH_STENCIL_FORMAT: vk::Format = vk::Format::D24_UNORM_S8_UINT;

/// What one display contributes to the batched present.
pub type PresentData = PresentTarget;

/// Smallest rectangle containing every rectangle of `rects`.
pub fn bounding_box(rects: &[vk::Rect2D]) -> Option<vk::Rect2D> {
    let first = rects.first()?;
    let (mut min_x, mut min_y) = (first.offset.x, first.offset.y);
    let (mut max_x, mut max_y) = (min_x, min_y);
    for rect in rects {
        min_x = min_x.min(rect.offset.x);
        min_y = min_y.min(rect.offset.y);
        max_x = max_x.max(rect.offset.x + rect.extent.width as i32);
        max_y = max_y.max(rect.offset.y + rect.extent.height as i32);
    }
    Some(vk::Rect2D {
        offset: vk::Offset2D { x: min_x, y: min_y },
        extent: vk::Extent2D {
            width: (max_x - min_x) as u32,
            height: (max_y - min_y) as u32,
        },
    })
}

fn contains(rect: &vk::Rect2D, x: i32, y: i32) -> bool {
    rect.offset.x <= x
        && x < rect.offset.x + rect.extent.width as i32
        && rect.offset.y <= y
        && y < rect.offset.y + rect.extent.height as i32
}

/// Whether `rects` cover their bounding box without holes.
///
/// The box is split along every rectangle edge; each resulting cell is
/// either fully covered by one rectangle or not covered at all.
pub fn is_tightly_packed(rects: &[vk::Rect2D]) -> bool {
    let mut xs: Vec<i32> = Vec::with_capacity(2 * rects.len());
    let mut ys: Vec<i32> = Vec::with_capacity(2 * rects.len());
    for rect in rects {
        xs.extend([rect.offset.x, rect.offset.x + rect.extent.width as i32]);
        ys.extend([rect.offset.y, rect.offset.y + rect.extent.height as i32]);
    }
    xs.sort_unstable();
    xs.dedup();
    ys.sort_unstable();
    ys.dedup();

    ys.windows(2).all(|y| {
        xs.windows(2)
            .all(|x| rects.iter().any(|rect| contains(rect, x[0], y[0])))
    })
}

struct AcquiredImage {
    index: u32,
    image: vk::Image,
}

/// Swapchain and the per-image objects built on it.
///
/// Filled step by step; dropping a partially built value releases what
/// exists so far.
struct SwapchainResources {
    gpu: Arc<dyn GpuDevice>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    image_acquired: Vec<vk::Semaphore>,
    ready_to_present: vk::Semaphore,
    depth_stencil: Option<ImageAllocation>,
    depth_stencil_view: vk::ImageView,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl Drop for SwapchainResources {
    fn drop(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            self.gpu.destroy_framebuffer(framebuffer);
        }
        for view in self.image_views.drain(..) {
            self.gpu.destroy_image_view(view);
        }
        if self.depth_stencil_view != vk::ImageView::null() {
            self.gpu.destroy_image_view(self.depth_stencil_view);
        }
        self.depth_stencil = None;
        for semaphore in self.image_acquired.drain(..) {
            self.gpu.destroy_semaphore(semaphore);
        }
        if self.ready_to_present != vk::Semaphore::null() {
            self.gpu.destroy_semaphore(self.ready_to_present);
        }
        self.gpu.destroy_swapchain(self.swapchain);
    }
}

/// One display of a logical device.
pub struct LogicalDisplay {
    ctx: Arc<DeviceContext>,
    display: vk::DisplayKHR,
    name: String,
    region: CanvasRegion,
    scene: Arc<RwLock<Scene>>,
    surface: DisplaySurface,
    device_mask: DeviceMask,
    targets: Vec<(DeviceIndex, RegionTarget)>,
    threads: Vec<RenderThread>,
    swapchain: Option<SwapchainResources>,
    acquired: Option<AcquiredImage>,
    depth_initialized: bool,
}

impl LogicalDisplay {
    /// Create the display-plane surface and one render context per device
    /// that sees `display`.
    pub fn new(
        ctx: Arc<DeviceContext>,
        display: vk::DisplayKHR,
        region: CanvasRegion,
        scene: Arc<RwLock<Scene>>,
    ) -> Result<Self, GpuError> {
        let gpu = Arc::clone(ctx.gpu());
        let name = gpu.display_name(display);
        let device_indices = gpu.display_device_indices(display);
        let Some(&first_device) = device_indices.first() else {
            dd_emit!(DD304, "display {}", name);
            return Err(GpuError::Device(format!("display {} is not connected to the device group", name)));
        };

        let surface = match gpu.create_display_surface(display, first_device) {
            Ok(surface) => surface,
            Err(GpuError::Unsupported(reason)) => {
                dd_emit!(DD204, "display {}", name);
                return Err(GpuError::Unsupported(reason));
            }
            Err(err) => return Err(err),
        };

        let mut this = Self {
            ctx,
            display,
            name,
            region,
            scene,
            surface,
            device_mask: DeviceMask::none(),
            targets: Vec::with_capacity(device_indices.len()),
            threads: Vec::new(),
            swapchain: None,
            acquired: None,
            depth_initialized: false,
        };
        for device_index in device_indices {
            this.push_render_context(device_index)?;
        }
        Ok(this)
    }

    fn push_render_context(&mut self, device_index: DeviceIndex) -> Result<(), GpuError> {
        let gpu = self.ctx.gpu();
        let rects = gpu.present_rectangles(device_index, self.surface.surface)?;
        let Some(render_area) = bounding_box(&rects) else {
            log::warn!("device {} reports no present rectangles on display {}", device_index, self.name);
            return Ok(());
        };

        if is_tightly_packed(&rects) {
            log::info!(
                "{} present rectangle(s) of device {} on display {} packed into one",
                rects.len(),
                device_index,
                self.name
            );
        } else {
            dd_emit!(
                DD203,
                "{} present rectangles of device {} on display {}",
                rects.len(),
                device_index,
                self.name
            );
        }

        let caps = gpu.surface_capabilities(device_index, self.surface.surface)?;
        let target = RegionTarget {
            render_area,
            viewport: self.region.viewport(caps.current_extent),
        };
        self.targets.push((device_index, target));
        self.device_mask.add(device_index);
        Ok(())
    }

    pub fn display(&self) -> vk::DisplayKHR {
        self.display
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> CanvasRegion {
        self.region
    }

    /// Devices rendering into this display.
    pub fn device_mask(&self) -> DeviceMask {
        self.device_mask
    }

    /// Render area and viewport per device.
    pub fn render_targets(&self) -> &[(DeviceIndex, RegionTarget)] {
        &self.targets
    }

    pub fn render_threads(&self) -> &[RenderThread] {
        &self.threads
    }

    pub fn is_started(&self) -> bool {
        self.swapchain.is_some()
    }

    pub fn swapchain_image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, |s| s.images.len())
    }

    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        self.swapchain.as_ref().map(|s| s.present_mode)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.as_ref().map_or(self.surface.extent, |s| s.extent)
    }

    /// First device able to present to the surface from the graphics family.
    fn main_device(&self) -> Option<DeviceIndex> {
        let gpu = self.ctx.gpu();
        let graphics = self.ctx.queue_families().graphics;
        (0..gpu.physical_device_count()).find(|&device| gpu.surface_support(device, graphics, self.surface.surface))
    }

    /// Formats the swapchain may use; empty if no device can present.
    pub fn surface_formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>, GpuError> {
        match self.main_device() {
            Some(device) => self.ctx.gpu().surface_formats(device, self.surface.surface),
            None => Ok(Vec::new()),
        }
    }

    /// Create the swapchain and framebuffers, then start the render threads.
    pub fn start(&mut self, surface_format: vk::SurfaceFormatKHR, pipeline: GraphicsPipeline) -> Result<(), GpuError> {
        let Some(main_device) = self.main_device() else {
            log::error!("no device can present to display {}", self.name);
            return Err(GpuError::Unsupported(format!("no presenting device for {}", self.name)));
        };
        let gpu = Arc::clone(self.ctx.gpu());
        let surface = self.surface.surface;

        let modes = gpu.surface_present_modes(main_device, surface)?;
        let Some(&first_mode) = modes.first() else {
            log::error!("no present modes available for display {}", self.name);
            return Err(GpuError::Unsupported(format!("no present modes for {}", self.name)));
        };
        let present_mode = modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::FIFO)
            .unwrap_or(first_mode);

        let caps = gpu.surface_capabilities(main_device, surface)?;
        let queued = self.ctx.config().queued_frames;
        let cap = if caps.max_image_count == 0 {
            queued
        } else {
            queued.min(caps.max_image_count)
        };
        let image_count = caps.min_image_count.max(cap);
        let extent = caps.current_extent;

        let swapchain = gpu.create_swapchain(&SwapchainDesc {
            surface,
            min_image_count: image_count,
            format: surface_format,
            extent,
            pre_transform: caps.current_transform,
            present_mode,
        })?;
        let mut resources = SwapchainResources {
            gpu: Arc::clone(&gpu),
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            image_acquired: Vec::with_capacity(queued as usize),
            ready_to_present: vk::Semaphore::null(),
            depth_stencil: None,
            depth_stencil_view: vk::ImageView::null(),
            present_mode,
            extent,
        };

        for _ in 0..queued {
            resources
                .image_acquired
                .push(gpu.create_semaphore(SemaphoreKind::Binary)?);
        }
        resources.ready_to_present = gpu.create_semaphore(SemaphoreKind::Binary)?;

        let depth_stencil = self.ctx.memory().create_image(
            &ImageDesc {
                format: DEPTH_STENCIL_FORMAT,
                extent,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            },
            None,
        )?;
        let depth_image = depth_stencil.image();
        resources.depth_stencil = Some(depth_stencil);
        resources.depth_stencil_view = gpu.create_image_view(
            depth_image,
            DEPTH_STENCIL_FORMAT,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        )?;

        resources.images = gpu.swapchain_images(swapchain)?;
        for i in 0..resources.images.len() {
            let view = gpu.create_image_view(resources.images[i], surface_format.format, vk::ImageAspectFlags::COLOR)?;
            resources.image_views.push(view);
            let framebuffer =
                gpu.create_framebuffer(pipeline.render_pass, &[view, resources.depth_stencil_view], extent)?;
            resources.framebuffers.push(framebuffer);
        }

        let mut threads = Vec::with_capacity(self.targets.len());
        for (i, &(device_index, target)) in self.targets.iter().enumerate() {
            let renderer = CanvasRegionRenderer::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.scene),
                device_index,
                target,
                pipeline,
            );
            let name = format!("ddisplay-{}-{}", self.name, i);
            threads.push(RenderThread::spawn(Arc::clone(&gpu), device_index, name, renderer)?);
        }

        log::info!(
            "display {}: {} swapchain images of {}x{}, {:?}, {} render thread(s)",
            self.name,
            resources.images.len(),
            extent.width,
            extent.height,
            present_mode,
            threads.len()
        );
        self.swapchain = Some(resources);
        self.threads = threads;
        self.depth_initialized = false;
        Ok(())
    }

    /// Acquire the next image and kick off every render thread.
    ///
    /// Returns `Ok(false)` when the frame is skipped for this display.
    pub fn render_frame_async(&mut self, unit: &Arc<CommandExecutionUnit>, frame: u64) -> Result<bool, GpuError> {
        self.acquired = None;
        let Some(resources) = self.swapchain.as_ref() else {
            return Ok(false);
        };
        let gpu = self.ctx.gpu();
        let graphics = self.ctx.queue_families().graphics;

        let semaphore = resources.image_acquired[(frame % resources.image_acquired.len() as u64) as usize];
        let index = match gpu.acquire_next_image(resources.swapchain, semaphore, self.device_mask) {
            Ok(index) => index,
            Err(err) => {
                dd_emit!(DD201, "display {}: {}", self.name, err);
                return Ok(false);
            }
        };
        let image = resources.images[index as usize];
        let framebuffer = resources.framebuffers[index as usize];

        // one binary wait on the acquire semaphore fans out into one signal per render thread
        let pre_render = unit.request_command_buffer(graphics, DeviceMask::none())?;
        unit.push_wait(
            pre_render,
            SemaphoreSubmit::binary(semaphore, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
        );
        let mut barriers = vec![ImageBarrier {
            src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags2::NONE,
            dst_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            dst_access_mask: vk::AccessFlags2::MEMORY_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_queue_family_index: graphics,
            dst_queue_family_index: graphics,
            image,
            aspect_mask: vk::ImageAspectFlags::COLOR,
        }];
        if !self.depth_initialized {
            if let Some(depth) = resources.depth_stencil.as_ref() {
                barriers.push(ImageBarrier {
                    src_stage_mask: vk::PipelineStageFlags2::NONE,
                    src_access_mask: vk::AccessFlags2::NONE,
                    dst_stage_mask: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                    dst_access_mask: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    src_queue_family_index: graphics,
                    dst_queue_family_index: graphics,
                    image: depth.image(),
                    aspect_mask: vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                });
            }
        }
        // the threads are only kicked once nothing can fail any more
        gpu.begin_command_buffer(pre_render, DeviceMask::none())?;
        gpu.cmd_pipeline_barrier(pre_render, &[], &barriers);
        gpu.end_command_buffer(pre_render)?;

        for thread in &self.threads {
            thread.record_commands_async(Arc::clone(unit), framebuffer, frame);
            unit.push_signal(
                pre_render,
                SemaphoreSubmit::binary(
                    thread.image_acquired_semaphore(),
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                ),
            );
        }

        self.depth_initialized = true;
        self.acquired = Some(AcquiredImage { index, image });
        Ok(true)
    }

    /// Wait for every render thread and record the transition to present.
    ///
    /// Returns `None` when [`render_frame_async`](Self::render_frame_async)
    /// skipped the frame.
    pub fn finish_frame_rendering(&mut self, unit: &CommandExecutionUnit) -> Result<Option<PresentData>, GpuError> {
        let Some(acquired) = self.acquired.take() else {
            return Ok(None);
        };
        let Some(resources) = self.swapchain.as_ref() else {
            return Ok(None);
        };
        for thread in &self.threads {
            thread.finish_command_recording();
        }

        let gpu = self.ctx.gpu();
        let graphics = self.ctx.queue_families().graphics;
        let post_render = unit.request_command_buffer(graphics, DeviceMask::none())?;
        for thread in &self.threads {
            unit.push_wait(
                post_render,
                SemaphoreSubmit::binary(thread.render_done_semaphore(), vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }

        let to_present = ImageBarrier {
            src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access_mask: vk::AccessFlags2::NONE,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_queue_family_index: graphics,
            dst_queue_family_index: graphics,
            image: acquired.image,
            aspect_mask: vk::ImageAspectFlags::COLOR,
        };
        gpu.begin_command_buffer(post_render, DeviceMask::none())?;
        gpu.cmd_pipeline_barrier(post_render, &[], &[to_present]);
        gpu.end_command_buffer(post_render)?;
        unit.push_signal(
            post_render,
            SemaphoreSubmit::binary(resources.ready_to_present, vk::PipelineStageFlags2::ALL_COMMANDS),
        );

        Ok(Some(PresentData {
            wait_semaphore: resources.ready_to_present,
            swapchain: resources.swapchain,
            image_index: acquired.index,
        }))
    }

    pub fn interrupt(&self) {
        for thread in &self.threads {
            thread.interrupt();
        }
    }

    pub fn join(&mut self) {
        for thread in &mut self.threads {
            thread.join();
        }
    }
}

impl Drop for LogicalDisplay {
    fn drop(&mut self) {
        // threads first: their recorders still reference the framebuffers
        self.threads.clear();
        self.swapchain = None;
        self.ctx.gpu().destroy_surface(self.surface.surface);
    }
}

impl std::fmt::Debug for LogicalDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalDisplay")
            .field("name", &self.name)
            .field("device_mask", &self.device_mask)
            .field("render_threads", &self.threads.len())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    use crate::api::RenderConfig;
    use crate::gpu::{DummyDevice, DummyDisplay, RecordedCommand};
    use crate::render::RenderThreadStatus;

    fn rect(x: i32, y: i32, w: u32, h: u32) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width: w, height: h },
        }
    }

    fn format() -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn display_on(gpu: Arc<DummyDevice>, raw: u64) -> (Arc<DeviceContext>, LogicalDisplay) {
        let ctx = DeviceContext::new(gpu, RenderConfig::minimal()).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        let display = LogicalDisplay::new(
            ctx.clone(),
            vk::DisplayKHR::from_raw(raw),
            CanvasRegion::default(),
            scene,
        )
        .unwrap();
        (ctx, display)
    }

    #[test]
    fn test_bounding_box_and_packing() {
        let halves = [rect(0, 0, 960, 1080), rect(960, 0, 960, 1080)];
        let bbox = bounding_box(&halves).unwrap();
        assert_eq!((bbox.offset.x, bbox.extent.width, bbox.extent.height), (0, 1920, 1080));
        assert!(is_tightly_packed(&halves));

        // an L shape leaves the lower right quarter uncovered
        let l_shape = [rect(0, 0, 200, 100), rect(0, 100, 100, 100)];
        assert!(!is_tightly_packed(&l_shape));

        let gap = [rect(0, 0, 100, 100), rect(101, 0, 100, 100)];
        assert!(!is_tightly_packed(&gap));
        assert!(bounding_box(&[]).is_none());
    }

    #[test]
    fn test_render_context_per_device() {
        let display = DummyDisplay::new(7, "wall", 1920, 1080)
            .with_present_rects(vec![(0, vec![rect(0, 0, 960, 1080)]), (1, vec![rect(960, 0, 960, 1080)])]);
        let gpu = Arc::new(DummyDevice::new(2).with_display(display));
        let (_ctx, display) = display_on(gpu, 7);

        assert_eq!(display.device_mask(), DeviceMask::all(2));
        let targets = display.render_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].1.render_area.offset.x, 960);
        assert_eq!(targets[1].1.viewport.width, 1920.0);
    }

    #[test]
    fn test_invisible_display_rejected() {
        let gpu = Arc::new(DummyDevice::new(1));
        let ctx = DeviceContext::new(gpu, RenderConfig::minimal()).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        let result = LogicalDisplay::new(ctx, vk::DisplayKHR::from_raw(99), CanvasRegion::default(), scene);
        assert!(matches!(result, Err(GpuError::Device(_))));
    }

    #[test]
    fn test_plane_without_opaque_alpha_rejected() {
        let display = DummyDisplay::new(3, "glass", 640, 480).with_opaque_alpha(false);
        let gpu = Arc::new(DummyDevice::new(1).with_display(display));
        let ctx = DeviceContext::new(gpu, RenderConfig::minimal()).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        let result = LogicalDisplay::new(ctx, vk::DisplayKHR::from_raw(3), CanvasRegion::default(), scene);
        assert!(matches!(result, Err(GpuError::Unsupported(_))));
    }

    #[test]
    fn test_start_picks_fifo_and_image_count() {
        let display = DummyDisplay::new(1, "main", 640, 480).with_max_image_count(0);
        let gpu = Arc::new(DummyDevice::new(1).with_display(display));
        let (_ctx, mut display) = display_on(gpu.clone(), 1);
        let pipeline = gpu
            .create_donut_pipeline(gpu.create_render_pass(format().format, DEPTH_STENCIL_FORMAT).unwrap())
            .unwrap();

        display.start(format(), pipeline).unwrap();
        assert_eq!(display.present_mode(), Some(vk::PresentModeKHR::FIFO));
        // max(min 2, queued 2) with an unbounded maximum
        assert_eq!(display.swapchain_image_count(), 2);
        assert_eq!(display.render_threads().len(), 1);
        assert_eq!(gpu.live_objects().framebuffers, 2);

        display.interrupt();
        display.join();
        assert_eq!(display.render_threads()[0].status(), RenderThreadStatus::Interrupted);
        drop(display);
        let live = gpu.live_objects();
        assert_eq!((live.framebuffers, live.image_views, live.swapchains, live.surfaces), (0, 0, 0, 0));
    }

    #[test]
    fn test_frame_records_pre_and_post_render_buffers() {
        let display = DummyDisplay::new(1, "main", 640, 480);
        let gpu = Arc::new(DummyDevice::new(1).with_display(display));
        let (_ctx, mut display) = display_on(gpu.clone(), 1);
        let pipeline = gpu
            .create_donut_pipeline(gpu.create_render_pass(format().format, DEPTH_STENCIL_FORMAT).unwrap())
            .unwrap();
        display.start(format(), pipeline).unwrap();

        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        assert!(display.render_frame_async(&unit, 0).unwrap());
        let present = display.finish_frame_rendering(&unit).unwrap().unwrap();
        assert_eq!(present.image_index, 0);

        let graphics = unit.pending_command_buffers(0);
        // pre render, render thread, post render
        assert_eq!(graphics.len(), 3);
        let pre = gpu.commands(graphics[0]);
        assert!(matches!(&pre[0], RecordedCommand::PipelineBarrier { images, .. } if images.len() == 2));
        let post = gpu.commands(graphics[2]);
        assert!(matches!(
            &post[0],
            RecordedCommand::PipelineBarrier { images, .. }
                if images[0].new_layout == vk::ImageLayout::PRESENT_SRC_KHR
        ));

        unit.submit().unwrap();
        unit.wait_for_idle_and_reset().unwrap();

        // depth is transitioned only once
        assert!(display.render_frame_async(&unit, 1).unwrap());
        display.finish_frame_rendering(&unit).unwrap();
        let pre = gpu.commands(unit.pending_command_buffers(0)[0]);
        assert!(matches!(&pre[0], RecordedCommand::PipelineBarrier { images, .. } if images.len() == 1));
        unit.submit().unwrap();
        assert!(gpu.validation_errors().is_empty());
    }

    #[test]
    fn test_failed_acquire_skips_frame() {
        let display = DummyDisplay::new(1, "main", 640, 480);
        let gpu = Arc::new(DummyDevice::new(1).with_display(display));
        let (_ctx, mut display) = display_on(gpu.clone(), 1);
        display.start(format(), GraphicsPipeline::default()).unwrap();

        gpu.set_fail_acquire(true);
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        assert!(!display.render_frame_async(&unit, 0).unwrap());
        assert!(display.finish_frame_rendering(&unit).unwrap().is_none());
        assert!(unit.pending_command_buffers(0).is_empty());
    }

    #[test]
    fn test_failed_pre_render_leaves_threads_idle() {
        let display = DummyDisplay::new(1, "main", 640, 480);
        let gpu = Arc::new(DummyDevice::new(1).with_display(display));
        let (_ctx, mut display) = display_on(gpu.clone(), 1);
        let pipeline = gpu
            .create_donut_pipeline(gpu.create_render_pass(format().format, DEPTH_STENCIL_FORMAT).unwrap())
            .unwrap();
        display.start(format(), pipeline).unwrap();
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));

        gpu.set_fail_begin(true);
        assert!(display.render_frame_async(&unit, 0).is_err());
        assert!(display.finish_frame_rendering(&unit).unwrap().is_none());
        gpu.set_fail_begin(false);

        // no worker may still be recording into the unit once the frame is given up
        for thread in &display.threads {
            thread.finish_command_recording();
            assert_eq!(thread.recorded_count(), 0);
            assert_ne!(thread.status(), RenderThreadStatus::Recording);
        }
        unit.submit().unwrap();
        unit.wait_for_idle_and_reset().unwrap();

        assert!(display.render_frame_async(&unit, 1).unwrap());
        assert!(display.finish_frame_rendering(&unit).unwrap().is_some());
        assert!(display.threads.iter().all(|t| t.recorded_count() == 1));
        unit.submit().unwrap();
        assert!(gpu.validation_errors().is_empty());
    }
}
