//! Triangle meshes and the per-device donut mesh cache.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::allocators::BufferAllocation;
use crate::api::DeviceContext;
use crate::gpu::{DeviceIndex, FrameIndex, GpuError};
use crate::sync::Mutex;

/// Index value restarting a triangle strip.
pub const PRIMITIVE_RESTART: u32 = 0xFFFF_FFFF;

/// Per-vertex attributes of binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct DefaultVertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub tex: [f32; 2],
}

/// Vertices and strip indices of a parametric surface, before upload.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<DefaultVertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Sample `surface(s, t)` on a `count_s` x `count_t` grid over `[0, 1]^2`.
    ///
    /// Rows of the grid become triangle strips separated by
    /// [`PRIMITIVE_RESTART`]. Both counts must be at least 2.
    pub fn parametric<F>(count_s: u32, count_t: u32, surface: F) -> Self
    where
        F: Fn(f32, f32) -> DefaultVertex,
    {
        let count_s = count_s.max(2);
        let count_t = count_t.max(2);

        let mut vertices = Vec::with_capacity((count_s * count_t) as usize);
        for it in 0..count_t {
            let t = it as f32 / (count_t - 1) as f32;
            for is in 0..count_s {
                let s = is as f32 / (count_s - 1) as f32;
                vertices.push(surface(s, t));
            }
        }

        let mut indices = Vec::with_capacity(((count_t - 1) * (2 * count_s + 1)) as usize);
        for i in 0..count_t - 1 {
            for j in 0..count_s {
                indices.push(i * count_s + j);
                indices.push((i + 1) * count_s + j);
            }
            indices.push(PRIMITIVE_RESTART);
        }
        indices.pop();

        Self { vertices, indices }
    }

    /// Torus with tube radius 0.125 around a ring of radius 0.375.
    pub fn torus(count_s: u32, count_t: u32) -> Self {
        let r = 0.125f32;
        let big_r = 0.375f32;
        Self::parametric(count_s, count_t, |s, t| {
            let (sin_phi, cos_phi) = (TAU * s).sin_cos();
            let (sin_theta, cos_theta) = (TAU * t).sin_cos();
            let ring = big_r + r * cos_phi;

            let pos = [cos_theta * ring, sin_theta * ring, r * sin_phi];
            let tangent = [-cos_theta * r * sin_phi, -sin_theta * r * sin_phi, r * cos_phi];
            let bitangent = [-sin_theta * ring, cos_theta * ring, 0.0];
            let normal = [
                bitangent[1] * tangent[2] - bitangent[2] * tangent[1],
                bitangent[2] * tangent[0] - bitangent[0] * tangent[2],
                bitangent[0] * tangent[1] - bitangent[1] * tangent[0],
            ];
            DefaultVertex {
                pos,
                normal,
                tex: [s, t],
            }
        })
    }
}

/// Device-local vertex and index buffers of one mesh on one device.
#[derive(Debug)]
pub struct TriangleMesh {
    device_index: DeviceIndex,
    vertex_buffer: BufferAllocation,
    index_buffer: BufferAllocation,
    index_count: u32,
    available_frame_index: FrameIndex,
}

impl TriangleMesh {
    /// Allocate the buffers on `device_index` and queue their upload.
    ///
    /// The mesh may be drawn from frame `current + 1` on; drawing it earlier
    /// requires waiting on the uploader semaphore.
    pub fn upload(ctx: &DeviceContext, device_index: DeviceIndex, data: &MeshData) -> Result<Self, GpuError> {
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);
        let index_buffer = ctx.memory().create_buffer(
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(device_index),
        )?;
        ctx.uploader().memcpy_host_to_buffer(
            ctx.memory(),
            index_bytes,
            index_buffer.buffer(),
            0,
            vk::PipelineStageFlags2::INDEX_INPUT,
        )?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        let vertex_buffer = ctx.memory().create_buffer(
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Some(device_index),
        )?;
        ctx.uploader().memcpy_host_to_buffer(
            ctx.memory(),
            vertex_bytes,
            vertex_buffer.buffer(),
            0,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        )?;

        Ok(Self {
            device_index,
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
            available_frame_index: ctx.frame_index() + 1,
        })
    }

    pub fn device_index(&self) -> DeviceIndex {
        self.device_index
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer.buffer()
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.index_buffer.buffer()
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// First frame whose submissions see the uploaded data without waiting.
    pub fn available_frame_index(&self) -> FrameIndex {
        self.available_frame_index
    }

    /// Hand both buffers to the deallocation queue.
    pub fn retire(self, ctx: &DeviceContext) {
        ctx.schedule_for_deallocation(self.vertex_buffer);
        ctx.schedule_for_deallocation(self.index_buffer);
    }
}

/// Donut meshes keyed by `(device index, tessellation)`.
#[derive(Default)]
pub struct MeshCache {
    meshes: Mutex<HashMap<(DeviceIndex, u32), Arc<TriangleMesh>>>,
}

impl MeshCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The torus mesh with `(tessellation, 2 * tessellation)` samples,
    /// built and uploaded on first request.
    pub fn donut(
        &self,
        ctx: &DeviceContext,
        device_index: DeviceIndex,
        tessellation: u32,
    ) -> Result<Arc<TriangleMesh>, GpuError> {
        let key = (device_index, tessellation);
        if let Some(mesh) = self.meshes.lock().get(&key) {
            return Ok(mesh.clone());
        }

        // built without holding the cache lock: uploading takes the pool locks
        let data = MeshData::torus(tessellation, 2 * tessellation);
        let built = Arc::new(TriangleMesh::upload(ctx, device_index, &data)?);

        let mut meshes = self.meshes.lock();
        let mesh = meshes.entry(key).or_insert_with(|| built.clone()).clone();
        drop(meshes);
        if !Arc::ptr_eq(&mesh, &built) {
            // another thread won the race; its copy is the cached one
            if let Ok(loser) = Arc::try_unwrap(built) {
                loser.retire(ctx);
            }
        }
        Ok(mesh)
    }

    pub fn len(&self) -> usize {
        self.meshes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.lock().is_empty()
    }

    /// Drop every cached mesh through the deallocation queue.
    pub fn clear(&self, ctx: &DeviceContext) {
        let meshes = std::mem::take(&mut *self.meshes.lock());
        for (_, mesh) in meshes {
            if let Ok(mesh) = Arc::try_unwrap(mesh) {
                mesh.retire(ctx);
            }
        }
    }
}
