//! Renderer configuration.

use ash::vk;

use crate::util::size::mb;

/// Frames in flight per logical device.
pub const NUM_QUEUED_FRAMES: u32 = 4;

/// Configuration of a logical device and everything it renders.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Depth of the command execution unit ring; also caps the swapchain
    /// image count (default: 4)
    pub queued_frames: u32,

    /// Frames a scheduled resource survives before destruction (default: 4)
    pub frames_to_keep: u64,

    /// Page size of every memory pool (default: 4 MB)
    pub min_page_size: vk::DeviceSize,

    /// Fur shells per torus, at least 1 (default: 32)
    pub num_fur_layers: u32,

    /// Extrusion of the outermost shell (default: 0.3)
    pub max_extrusion: f32,

    /// Torus samples around the tube; the ring gets twice as many (default: 16)
    pub torus_tessellation: u32,

    /// Pulse the clear colour of every canvas region
    pub highlight_regions: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            queued_frames: NUM_QUEUED_FRAMES,
            frames_to_keep: NUM_QUEUED_FRAMES as u64,
            min_page_size: mb(4),
            num_fur_layers: 32,
            max_extrusion: 0.3,
            torus_tessellation: 16,
            highlight_regions: false,
        }
    }
}

impl RenderConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            queued_frames: 2,
            frames_to_keep: 2,
            min_page_size: mb(1),
            num_fur_layers: 1,
            ..Self::default()
        }
    }

    /// Dense fur and large pages.
    pub fn high_quality() -> Self {
        Self {
            min_page_size: mb(16),
            num_fur_layers: 64,
            torus_tessellation: 32,
            ..Self::default()
        }
    }

    /// Builder pattern: set the ring depth. Clamped to at least 1.
    pub fn with_queued_frames(mut self, frames: u32) -> Self {
        self.queued_frames = frames.max(1);
        self
    }

    /// Builder pattern: set the deallocation delay.
    pub fn with_frames_to_keep(mut self, frames: u64) -> Self {
        self.frames_to_keep = frames;
        self
    }

    /// Builder pattern: set the memory pool page size.
    pub fn with_min_page_size(mut self, size: vk::DeviceSize) -> Self {
        self.min_page_size = size;
        self
    }

    /// Builder pattern: set the fur shell count. Clamped to at least 1.
    pub fn with_fur_layers(mut self, layers: u32) -> Self {
        self.num_fur_layers = layers.max(1);
        self
    }

    pub fn with_max_extrusion(mut self, extrusion: f32) -> Self {
        self.max_extrusion = extrusion;
        self
    }

    /// Builder pattern: set the torus tessellation. Clamped to at least 2.
    pub fn with_torus_tessellation(mut self, tessellation: u32) -> Self {
        self.torus_tessellation = tessellation.max(2);
        self
    }

    pub fn with_highlight_regions(mut self, enable: bool) -> Self {
        self.highlight_regions = enable;
        self
    }
}

/// Placement of a display on the shared canvas, in units of the display size.
///
/// `(0, 0, 1, 1)` shows the whole canvas. A 2 x 1 wall uses `(0, 0, 2, 1)`
/// for the left display and `(1, 0, 2, 1)` for the right one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasRegion {
    pub offset_x: f32,
    pub offset_y: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for CanvasRegion {
    fn default() -> Self {
        Self {
            offset_x: 0.0,
            offset_y: 0.0,
            width: 1.0,
            height: 1.0,
        }
    }
}

impl CanvasRegion {
    pub fn new(offset_x: f32, offset_y: f32, width: f32, height: f32) -> Self {
        Self {
            offset_x,
            offset_y,
            width,
            height,
        }
    }

    /// Viewport of a surface of `extent` showing this region of the canvas.
    pub fn viewport(&self, extent: vk::Extent2D) -> vk::Viewport {
        let width = extent.width as f32 / self.width;
        let height = extent.height as f32 / self.height;
        vk::Viewport {
            x: -width * self.offset_x,
            y: -height * self.offset_y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}
