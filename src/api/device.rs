//! The per-device-group frame loop.

use std::sync::Arc;

use ash::vk;

use super::config::{CanvasRegion, RenderConfig};
use super::context::DeviceContext;
use super::display::{LogicalDisplay, PresentData, DEPTH_STENCIL_FORMAT};
use super::stats::{FrameCounters, RenderStats};
use crate::command::CommandExecutionUnit;
use crate::dd_emit;
use crate::gpu::{FrameIndex, GpuDevice, GpuError, GraphicsPipeline};
use crate::scene::Scene;
use crate::sync::RwLock;

/// Surface format used when every display supports it.
pub const PREFERRED_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Pick the format every display supports, preferring
/// [`PREFERRED_SURFACE_FORMAT`].
pub fn common_surface_format(per_display: &[Vec<vk::SurfaceFormatKHR>]) -> Option<vk::SurfaceFormatKHR> {
    let (first, rest) = per_display.split_first()?;
    let same = |a: &vk::SurfaceFormatKHR, b: &vk::SurfaceFormatKHR| a.format == b.format && a.color_space == b.color_space;
    let common: Vec<vk::SurfaceFormatKHR> = first
        .iter()
        .filter(|f| rest.iter().all(|formats| formats.iter().any(|g| same(f, g))))
        .copied()
        .collect();
    common
        .iter()
        .find(|f| same(f, &PREFERRED_SURFACE_FORMAT))
        .or_else(|| common.first())
        .copied()
}

/// A device group rendering to all of its enabled displays.
///
/// Owns a ring of [`CommandExecutionUnit`]s, one per queued frame. A slot
/// is reused only after the GPU work submitted from it has finished.
pub struct LogicalDevice {
    ctx: Arc<DeviceContext>,
    units: Vec<Arc<CommandExecutionUnit>>,
    displays: Vec<LogicalDisplay>,
    pipeline: Option<GraphicsPipeline>,
    surface_format: Option<vk::SurfaceFormatKHR>,
    counters: FrameCounters,
}

impl LogicalDevice {
    pub fn new(gpu: Arc<dyn GpuDevice>, config: RenderConfig) -> Result<Self, GpuError> {
        let queued_frames = config.queued_frames.max(1);
        let units = (0..queued_frames)
            .map(|_| Arc::new(CommandExecutionUnit::new(Arc::clone(&gpu))))
            .collect();
        let ctx = DeviceContext::new(gpu, config)?;
        log::info!(
            "logical device with {} physical device(s), {} queued frames, queue families {:?}",
            ctx.gpu().physical_device_count(),
            queued_frames,
            ctx.queue_families()
        );
        Ok(Self {
            ctx,
            units,
            displays: Vec::new(),
            pipeline: None,
            surface_format: None,
            counters: FrameCounters::new(),
        })
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn displays(&self) -> &[LogicalDisplay] {
        &self.displays
    }

    /// Swapchain format chosen by [`start`](Self::start).
    pub fn surface_format(&self) -> Option<vk::SurfaceFormatKHR> {
        self.surface_format
    }

    pub fn pipeline(&self) -> Option<GraphicsPipeline> {
        self.pipeline
    }

    /// Drive `display` from this device, showing `region` of the canvas.
    pub fn enable_display(
        &mut self,
        display: vk::DisplayKHR,
        region: CanvasRegion,
        scene: Arc<RwLock<Scene>>,
    ) -> Result<(), GpuError> {
        let gpu = self.ctx.gpu();
        let name = gpu.display_name(display);
        if self.displays.iter().any(|d| d.display() == display) {
            dd_emit!(DD303, "display {}", name);
            return Err(GpuError::Device(format!("display {} is already enabled", name)));
        }
        if gpu.display_device_indices(display).is_empty() {
            dd_emit!(DD304, "display {}", name);
            return Err(GpuError::Device(format!("display {} is not connected to the device group", name)));
        }
        let logical = LogicalDisplay::new(Arc::clone(&self.ctx), display, region, scene)?;
        log::info!("enabled display {} on devices {:?}", name, logical.device_mask().iter().collect::<Vec<_>>());
        self.displays.push(logical);
        Ok(())
    }

    /// Pick the swapchain format, build the pipeline and start every display.
    ///
    /// Displays failing to start are logged and dropped.
    pub fn start(&mut self) -> Result<(), GpuError> {
        let mut per_display = Vec::with_capacity(self.displays.len());
        for display in &self.displays {
            per_display.push(display.surface_formats()?);
        }
        let Some(surface_format) = common_surface_format(&per_display) else {
            dd_emit!(DD302, "{} display(s)", self.displays.len());
            return Err(GpuError::NoSurfaceFormat);
        };

        let gpu = Arc::clone(self.ctx.gpu());
        if let Some(old) = self.pipeline.take() {
            gpu.destroy_pipeline(&old);
        }
        let render_pass = gpu.create_render_pass(surface_format.format, DEPTH_STENCIL_FORMAT)?;
        let pipeline = match gpu.create_donut_pipeline(render_pass) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                gpu.destroy_pipeline(&GraphicsPipeline {
                    render_pass,
                    ..GraphicsPipeline::default()
                });
                return Err(err);
            }
        };
        self.pipeline = Some(pipeline);
        self.surface_format = Some(surface_format);

        let mut started = Vec::with_capacity(self.displays.len());
        for mut display in self.displays.drain(..) {
            match display.start(surface_format, pipeline) {
                Ok(()) => started.push(display),
                Err(err) => log::error!("failed to start display {}: {}", display.name(), err),
            }
        }
        self.displays = started;
        log::info!(
            "started {} display(s) with {:?}/{:?}",
            self.displays.len(),
            surface_format.format,
            surface_format.color_space
        );
        Ok(())
    }

    /// Index of the frame the next [`render`](Self::render) builds.
    pub fn frame_index(&self) -> FrameIndex {
        self.ctx.frame_index()
    }

    /// Record, submit and present one frame on every display.
    ///
    /// Failures are logged; the frame loop itself never fails.
    pub fn render(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let frame = ctx.frame_index();
        let unit = Arc::clone(&self.units[(frame % self.units.len() as u64) as usize]);

        if let Err(err) = unit.wait_for_idle_and_reset() {
            log::error!("frame {}: waiting for slot failed: {}", frame, err);
        }
        if let Err(err) = ctx.uploader().prepare(&unit, frame) {
            log::error!("frame {}: upload preparation failed: {}", frame, err);
        }

        for display in &mut self.displays {
            match display.render_frame_async(&unit, frame) {
                Ok(true) => {}
                Ok(false) => self.counters.skipped_presents.increment(),
                Err(err) => {
                    log::error!("frame {}: display {} failed: {}", frame, display.name(), err);
                    self.counters.skipped_presents.increment();
                }
            }
        }

        let mut presents: Vec<PresentData> = Vec::with_capacity(self.displays.len());
        for display in &mut self.displays {
            match display.finish_frame_rendering(&unit) {
                Ok(Some(present)) => presents.push(present),
                Ok(None) => {}
                Err(err) => log::error!("frame {}: display {} failed: {}", frame, display.name(), err),
            }
        }

        if let Err(err) = ctx
            .uploader()
            .finish(ctx.deallocations(), frame, ctx.config().frames_to_keep)
        {
            log::error!("frame {}: recording uploads failed: {}", frame, err);
        }
        match unit.submit() {
            Ok(()) => self.counters.frames_rendered.increment(),
            Err(err) => log::error!("frame {}: submit failed: {}", frame, err),
        }

        // every display of the group in one present
        if !presents.is_empty() {
            if let Err(err) = ctx.gpu().queue_present(ctx.queue_families().graphics, &presents) {
                dd_emit!(DD202, "frame {}: {}", frame, err);
                self.counters.failed_presents.increment();
            }
        }

        // everything targeted at this frame or earlier is gone before the next one starts
        let next = ctx.advance_frame();
        let freed = ctx.deallocations().collect(next);
        if freed > 0 {
            log::debug!("frame {}: released {} resource(s)", frame, freed);
        }
        self.counters.deallocations.set(ctx.deallocations().len());
    }

    /// Stop rendering: wait for the last submitted frame, then tell every
    /// render thread to stop.
    pub fn interrupt(&mut self) {
        let n = self.units.len() as u64;
        let last = (self.ctx.frame_index() + n - 1) % n;
        if let Err(err) = self.units[last as usize].wait_for_idle() {
            log::error!("waiting for the last frame failed: {}", err);
        }
        for display in &self.displays {
            display.interrupt();
        }
        let cleared = self.ctx.deallocations().clear();
        self.counters.deallocations.set(0);
        log::debug!("interrupt released {} pending resource(s)", cleared);
    }

    /// Wait for every render thread to exit.
    pub fn join(&mut self) {
        for display in &mut self.displays {
            display.join();
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.counters.snapshot(self.ctx.memory().pool_count())
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        for display in &self.displays {
            display.interrupt();
        }
        if let Err(err) = self.ctx.gpu().wait_idle() {
            log::error!("device wait idle failed: {}", err);
        }
        self.displays.clear();
        for unit in &self.units {
            if let Err(err) = unit.wait_for_idle() {
                log::error!("waiting for queued frame failed: {}", err);
            }
        }
        self.ctx.deallocations().clear();
        if let Some(pipeline) = self.pipeline.take() {
            self.ctx.gpu().destroy_pipeline(&pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    use crate::gpu::{DummyDevice, DummyDisplay};

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_common_surface_format() {
        let unorm = format(vk::Format::B8G8R8A8_UNORM);
        let srgb = format(vk::Format::B8G8R8A8_SRGB);
        let rgba = format(vk::Format::R8G8B8A8_UNORM);

        let picked = common_surface_format(&[vec![srgb, unorm], vec![unorm, rgba]]).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_UNORM);

        let picked = common_surface_format(&[vec![rgba, srgb], vec![srgb, rgba]]).unwrap();
        assert_eq!(picked.format, vk::Format::R8G8B8A8_UNORM);

        assert!(common_surface_format(&[vec![srgb], vec![rgba]]).is_none());
        assert!(common_surface_format(&[]).is_none());
    }

    #[test]
    fn test_enable_display_twice_fails() {
        let gpu = Arc::new(DummyDevice::new(1).with_display(DummyDisplay::new(1, "main", 320, 240)));
        let mut device = LogicalDevice::new(gpu, RenderConfig::minimal()).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        let display = vk::DisplayKHR::from_raw(1);

        device.enable_display(display, CanvasRegion::default(), scene.clone()).unwrap();
        assert!(device.enable_display(display, CanvasRegion::default(), scene.clone()).is_err());
        assert!(device
            .enable_display(vk::DisplayKHR::from_raw(2), CanvasRegion::default(), scene)
            .is_err());
        assert_eq!(device.displays().len(), 1);
    }

    #[test]
    fn test_start_without_common_format_fails() {
        let a = DummyDisplay::new(1, "a", 320, 240).with_formats(vec![format(vk::Format::B8G8R8A8_SRGB)]);
        let b = DummyDisplay::new(2, "b", 320, 240).with_formats(vec![format(vk::Format::R8G8B8A8_UNORM)]);
        let gpu = Arc::new(DummyDevice::new(1).with_display(a).with_display(b));
        let mut device = LogicalDevice::new(gpu, RenderConfig::minimal()).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        device.enable_display(vk::DisplayKHR::from_raw(1), CanvasRegion::default(), scene.clone()).unwrap();
        device.enable_display(vk::DisplayKHR::from_raw(2), CanvasRegion::default(), scene).unwrap();

        assert!(matches!(device.start(), Err(GpuError::NoSurfaceFormat)));
    }

    #[test]
    fn test_ring_slots_rotate() {
        let gpu = Arc::new(DummyDevice::new(1).with_display(DummyDisplay::new(1, "main", 320, 240)));
        let mut device = LogicalDevice::new(gpu.clone(), RenderConfig::minimal()).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        device.enable_display(vk::DisplayKHR::from_raw(1), CanvasRegion::default(), scene).unwrap();
        device.start().unwrap();

        for _ in 0..5 {
            device.render();
        }
        assert_eq!(device.frame_index(), 5);
        assert_eq!(device.stats().frames_rendered, 5);
        assert_eq!(gpu.presents().len(), 5);
        device.interrupt();
        device.join();
        assert!(gpu.validation_errors().is_empty(), "{:?}", gpu.validation_errors());
    }

    #[test]
    fn test_scheduled_resource_lifetime() {
        let gpu = Arc::new(DummyDevice::new(1).with_display(DummyDisplay::new(1, "main", 320, 240)));
        let config = RenderConfig::minimal().with_frames_to_keep(10);
        let mut device = LogicalDevice::new(gpu, config).unwrap();
        let scene = Arc::new(RwLock::new(Scene::new()));
        device.enable_display(vk::DisplayKHR::from_raw(1), CanvasRegion::default(), scene).unwrap();
        device.start().unwrap();
        device.render();

        let ctx = device.context().clone();
        let frame = device.frame_index();
        let staging = ctx.memory().create_staging_buffer(64).unwrap();
        ctx.deallocations().schedule(staging, frame, 3);

        for _ in 0..3 {
            device.render();
            assert!(ctx.deallocations().target_frames().contains(&(frame + 3)));
        }
        // the end of frame + 3 releases it, before frame + 4 starts
        device.render();
        assert!(!ctx.deallocations().target_frames().contains(&(frame + 3)));
        device.interrupt();
        device.join();
    }
}
