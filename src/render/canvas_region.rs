//! Recording one canvas region on one device.

use std::sync::Arc;

use ash::vk;
use glam::Vec3;

use super::instances::TriangleMeshInstanceSet;
use super::thread::{RecordCommands, RecordJob};
use super::GlobalData;
use crate::api::DeviceContext;
use crate::gpu::{
    DeviceIndex, DeviceMask, GpuError, GraphicsPipeline, RenderPassBegin, SemaphoreKind, SemaphoreSubmit,
};
use crate::scene::{NodeType, Scene};
use crate::sync::RwLock;

/// Clear colours, indexed by device.
pub const PALETTE: [[f32; 3]; 14] = [
    [0.725, 0.471, 0.0],
    [0.462, 0.725, 0.0],
    [0.0, 0.588, 0.725],
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [0.0, 1.0, 1.0],
    [1.0, 0.0, 1.0],
    [1.0, 1.0, 0.0],
    [1.0, 1.0, 1.0],
    [0.75, 0.75, 0.75],
    [0.5, 0.5, 0.5],
    [0.25, 0.25, 0.25],
    [0.0, 0.0, 0.0],
];

const DARK_GRAY: Vec3 = Vec3::splat(0.25);

/// Clear colour of a region. Highlighted regions pulse toward dark grey.
pub fn clear_color(device_index: DeviceIndex, highlighted: bool, runtime_millis: f32) -> [f32; 4] {
    let base = Vec3::from(PALETTE[device_index as usize % PALETTE.len()]);
    let color = if highlighted {
        base.lerp(DARK_GRAY, 0.5 + 0.5 * (1e-2 * runtime_millis).sin())
    } else {
        base
    };
    [color.x, color.y, color.z, 1.0]
}

/// Expand every torus of `scene` into `num_layers` fur shells.
///
/// Shell `i` has height `i / n` and is extruded by `max_extrusion` times
/// its height. `num_layers` is clamped to at least 1.
pub fn collect_fur_instances(
    scene: &Scene,
    instances: &mut TriangleMeshInstanceSet,
    num_layers: u32,
    max_extrusion: f32,
) {
    let layers = num_layers.max(1);
    scene.collect_visible_nodes(|node| {
        if node.node_type() != NodeType::Torus {
            return;
        }
        let model = node.model();
        for i in 0..layers {
            let shell_height = i as f32 / layers as f32;
            instances.push_instance(node.id(), model, shell_height, max_extrusion * shell_height);
        }
    });
}

/// Where a region renders inside the shared framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct RegionTarget {
    pub render_area: vk::Rect2D,
    pub viewport: vk::Viewport,
}

/// [`RecordCommands`] strategy drawing the fur donuts into one region.
pub struct CanvasRegionRenderer {
    ctx: Arc<DeviceContext>,
    scene: Arc<RwLock<Scene>>,
    device_index: DeviceIndex,
    target: RegionTarget,
    pipeline: GraphicsPipeline,
    highlighted: bool,
    instances: TriangleMeshInstanceSet,
    sync_semaphore: Option<vk::Semaphore>,
    sync_value: u64,
}

impl CanvasRegionRenderer {
    pub fn new(
        ctx: Arc<DeviceContext>,
        scene: Arc<RwLock<Scene>>,
        device_index: DeviceIndex,
        target: RegionTarget,
        pipeline: GraphicsPipeline,
    ) -> Self {
        let highlighted = ctx.config().highlight_regions;
        Self {
            ctx,
            scene,
            device_index,
            target,
            pipeline,
            highlighted,
            instances: TriangleMeshInstanceSet::new(device_index),
            sync_semaphore: None,
            sync_value: 0,
        }
    }

    fn sync_semaphore(&mut self) -> Result<vk::Semaphore, GpuError> {
        if let Some(semaphore) = self.sync_semaphore {
            return Ok(semaphore);
        }
        let semaphore = self
            .ctx
            .gpu()
            .create_semaphore(SemaphoreKind::Timeline { initial_value: 0 })?;
        self.sync_semaphore = Some(semaphore);
        self.sync_value = 0;
        Ok(semaphore)
    }
}

impl CanvasRegionRenderer {
    /// Everything between begin and end of `graphics_cb`.
    ///
    /// An error leaves no render pass open and no other command buffer
    /// recording. The sync timeline only advances for work that was fully
    /// recorded.
    fn record_region(
        &mut self,
        ctx: &Arc<DeviceContext>,
        job: &RecordJob,
        graphics_cb: vk::CommandBuffer,
    ) -> Result<(), GpuError> {
        let gpu = ctx.gpu();
        let config = ctx.config();
        let device = self.device_index;
        let mask = DeviceMask::of_single_device(device);

        let (clear, global) = {
            let scene = self.scene.read();
            self.instances.begin_collection();
            collect_fur_instances(&scene, &mut self.instances, config.num_fur_layers, config.max_extrusion);
            let camera = scene.camera();
            let global = GlobalData::new(camera.view, camera.proj, scene.runtime_millis());
            (clear_color(device, self.highlighted, scene.runtime_millis()), global)
        };
        self.instances.end_collection(ctx)?;
        if self.instances.is_empty() {
            return Ok(());
        }
        let mesh = ctx.donut_mesh(device, config.torus_tessellation)?;
        let sync = self.sync_semaphore()?;

        let transfer_cb = job.unit.request_command_buffer(ctx.queue_families().transfer, mask)?;
        job.unit.push_wait(
            transfer_cb,
            SemaphoreSubmit::timeline(sync, self.sync_value, vk::PipelineStageFlags2::TRANSFER).on_device(device),
        );
        gpu.begin_command_buffer(transfer_cb, mask)?;
        let uploaded = self.instances.update_device_memory(ctx, transfer_cb, graphics_cb);
        let ended = gpu.end_command_buffer(transfer_cb);
        uploaded.and(ended)?;

        self.sync_value += 1;
        job.unit.push_signal(
            transfer_cb,
            SemaphoreSubmit::timeline(sync, self.sync_value, vk::PipelineStageFlags2::TRANSFER).on_device(device),
        );
        job.unit.push_wait(
            graphics_cb,
            SemaphoreSubmit::timeline(sync, self.sync_value, vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT)
                .on_device(device),
        );

        gpu.cmd_begin_render_pass(
            graphics_cb,
            &RenderPassBegin {
                render_pass: self.pipeline.render_pass,
                framebuffer: job.framebuffer,
                render_area: self.target.render_area,
                clear_color: clear,
                clear_depth: 1.0,
                clear_stencil: 0,
            },
        );
        gpu.cmd_bind_pipeline(graphics_cb, self.pipeline.pipeline);
        gpu.cmd_push_constants(graphics_cb, self.pipeline.layout, bytemuck::bytes_of(&global));

        if job.frame < mesh.available_frame_index() {
            // vertex and index data are uploaded in this very frame
            job.unit.push_wait(
                graphics_cb,
                SemaphoreSubmit::timeline(
                    ctx.uploader().sync_semaphore(),
                    job.frame + 1,
                    vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                )
                .on_device(device),
            );
        }
        gpu.cmd_set_viewport(graphics_cb, self.target.viewport);
        // only pixels inside this device's present rectangles may be touched
        gpu.cmd_set_scissor(graphics_cb, self.target.render_area);
        self.instances.draw(ctx, graphics_cb, &mesh);
        gpu.cmd_end_render_pass(graphics_cb);

        self.sync_value += 1;
        job.unit.push_signal(
            graphics_cb,
            SemaphoreSubmit::timeline(sync, self.sync_value, vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT)
                .on_device(device),
        );
        Ok(())
    }
}

impl RecordCommands for CanvasRegionRenderer {
    fn record(&mut self, job: &RecordJob) -> Result<(), GpuError> {
        let ctx = Arc::clone(&self.ctx);
        let gpu = ctx.gpu();
        let device = self.device_index;
        let mask = DeviceMask::of_single_device(device);

        let graphics_cb = job.unit.request_command_buffer(ctx.queue_families().graphics, mask)?;
        job.unit.push_wait(
            graphics_cb,
            SemaphoreSubmit::binary(job.image_acquired, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .on_device(device),
        );
        gpu.begin_command_buffer(graphics_cb, mask)?;

        let recorded = self.record_region(&ctx, job, graphics_cb);

        // the post-render barrier waits on render_done, so a failed region still signals it
        let ended = gpu.end_command_buffer(graphics_cb);
        job.unit.push_signal(
            graphics_cb,
            SemaphoreSubmit::binary(job.render_done, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .on_device(device),
        );
        recorded.and(ended)
    }
}

impl Drop for CanvasRegionRenderer {
    fn drop(&mut self) {
        self.instances.retire(&self.ctx);
        if let Some(semaphore) = self.sync_semaphore.take() {
            self.ctx.gpu().destroy_semaphore(semaphore);
        }
    }
}
