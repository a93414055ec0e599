//! Per-device rendering
//!
//! - `mesh`: donut geometry and its per-device upload
//! - `instances`: fur shell instances streamed every frame
//! - `thread`: the render thread state machine
//! - `canvas_region`: what a render thread records for one region

pub mod canvas_region;
pub mod instances;
pub mod mesh;
pub mod thread;

pub use canvas_region::{clear_color, collect_fur_instances, CanvasRegionRenderer, RegionTarget, PALETTE};
pub use instances::{DefaultInstance, TriangleMeshInstanceSet};
pub use mesh::{DefaultVertex, MeshCache, MeshData, TriangleMesh, PRIMITIVE_RESTART};
pub use thread::{RecordCommands, RecordJob, RenderThread, RenderThreadStatus};

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Push constant block shared by every draw of a frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GlobalData {
    pub view: Mat4,
    pub proj: Mat4,
    pub runtime_millis: f32,
    pub _pad: [f32; 3],
}

impl GlobalData {
    pub fn new(view: Mat4, proj: Mat4, runtime_millis: f32) -> Self {
        Self {
            view,
            proj,
            runtime_millis,
            _pad: [0.0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_data_fits_push_constant_range() {
        // 128 bytes of matrices plus the clock, padded to 16
        assert_eq!(std::mem::size_of::<GlobalData>(), 144);
        let data = GlobalData::new(Mat4::IDENTITY, Mat4::IDENTITY, 2.5);
        assert_eq!(bytemuck::bytes_of(&data)[128..132], 2.5f32.to_le_bytes());
    }
}
