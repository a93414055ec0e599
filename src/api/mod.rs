//! Public API for ddisplay.
//!
//! This module contains all user-facing types and functions.
//! Most users only need [`LogicalDevice`], [`RenderConfig`] and
//! [`CanvasRegion`].

pub mod config;
pub mod context;
pub mod device;
pub mod display;
pub mod stats;

pub use config::{CanvasRegion, RenderConfig, NUM_QUEUED_FRAMES};
pub use context::DeviceContext;
pub use device::{common_surface_format, LogicalDevice, PREFERRED_SURFACE_FORMAT};
pub use display::{bounding_box, is_tightly_packed, LogicalDisplay, PresentData, DEPTH_STENCIL_FORMAT};
pub use stats::RenderStats;
