//! The synthetic stress-test scene.
//!
//! Two planes of tori in front of a fixed perspective camera: a dense grid at
//! z = 0 and a sparser back plane at z = -2. Render threads only read the
//! scene; the application advances it between frames.

use glam::{Mat4, Vec3};

/// Kind of geometry a node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Torus,
}

/// One scene object.
#[derive(Debug, Clone)]
pub struct Node {
    id: u32,
    node_type: NodeType,
    scaling: Vec3,
    roll: f32,
    pitch: f32,
    yaw: f32,
    translation: Vec3,
}

impl Node {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Object-to-world transform: scale, then roll, pitch and yaw, then translate.
    pub fn model(&self) -> Mat4 {
        Mat4::from_translation(self.translation)
            * Mat4::from_rotation_y(self.yaw)
            * Mat4::from_rotation_x(self.pitch)
            * Mat4::from_rotation_z(self.roll)
            * Mat4::from_scale(self.scaling)
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn scaling(&self) -> Vec3 {
        self.scaling
    }

    fn set_rotation(&mut self, roll: f32, pitch: f32, yaw: f32) {
        self.roll = roll;
        self.pitch = pitch;
        self.yaw = yaw;
    }
}

/// Camera with a horizontal field of view, looking down +z.
#[derive(Debug, Clone, Copy)]
pub struct PerspectiveCamera {
    pub position: Vec3,
    /// Horizontal field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub view: Mat4,
    pub proj: Mat4,
}

impl PerspectiveCamera {
    fn projection(fov: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let tan_x = (0.5 * fov).tan();
        let tan_y = tan_x / aspect;
        let depth = far / (far - near);
        // Vulkan clip space: y down, depth in [0, 1]
        Mat4::from_cols(
            glam::Vec4::new(1.0 / tan_x, 0.0, 0.0, 0.0),
            glam::Vec4::new(0.0, -1.0 / tan_y, 0.0, 0.0),
            glam::Vec4::new(0.0, 0.0, depth, 1.0),
            glam::Vec4::new(0.0, 0.0, -near * depth, 0.0),
        )
    }
}

/// Scene nodes, camera and runtime clock.
#[derive(Debug, Clone)]
pub struct Scene {
    nodes: Vec<Node>,
    camera: PerspectiveCamera,
    runtime_millis: f32,
    num_updates: u64,
    num_donuts: (u32, u32),
    next_node_id: u32,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// The default scene: 15 x 9 tori seen from (0, 0, -4).
    pub fn new() -> Self {
        let position = Vec3::new(0.0, 0.0, -4.0);
        let mut scene = Self {
            nodes: Vec::new(),
            camera: PerspectiveCamera {
                position,
                fov: 0.0,
                aspect: 1.0,
                near: 1.0,
                far: 2.0,
                view: Mat4::from_translation(position).inverse(),
                proj: Mat4::IDENTITY,
            },
            runtime_millis: 0.0,
            num_updates: 0,
            num_donuts: (15, 9),
            next_node_id: 0,
        };
        scene.set_perspective_camera(16.0 / 9.0, 90f32.to_radians(), 1e-2, 1e2);
        scene
    }

    pub fn camera(&self) -> &PerspectiveCamera {
        &self.camera
    }

    pub fn runtime_millis(&self) -> f32 {
        self.runtime_millis
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn num_donuts(&self) -> (u32, u32) {
        self.num_donuts
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Replace the projection and lay the tori out again for the new frustum.
    pub fn set_perspective_camera(&mut self, aspect: f32, fov: f32, near: f32, far: f32) {
        self.camera.aspect = aspect;
        self.camera.fov = fov;
        self.camera.near = near;
        self.camera.far = far;
        self.camera.proj = PerspectiveCamera::projection(fov, aspect, near, far);
        self.rebuild();
    }

    /// Set the front grid size. Both counts are clamped to at least 1.
    pub fn set_num_donuts(&mut self, x: u32, y: u32) {
        self.num_donuts = (x.max(1), y.max(1));
        self.rebuild();
    }

    /// Advance the clock by `millis` and spin every node.
    pub fn update(&mut self, millis: f32) {
        self.runtime_millis += millis;
        self.num_updates += 1;
        let t = self.runtime_millis * 1e-3;
        for (i, node) in self.nodes.iter_mut().enumerate() {
            let [r0, r1, r2] = rotation_rates(i as u32);
            node.set_rotation(r1 + t * r0, r2 + t * r1, r0 + t * r2);
        }
    }

    /// Call `visitor` for every node that may be visible.
    ///
    /// There is no culling: every node is visited.
    pub fn collect_visible_nodes<F: FnMut(&Node)>(&self, mut visitor: F) {
        for node in &self.nodes {
            visitor(node);
        }
    }

    fn rebuild(&mut self) {
        let (x, y) = self.num_donuts;
        self.nodes.clear();
        self.fill_donut_plane(0.0, x, y);
        self.fill_donut_plane(-2.0, 2 * (x / 4).max(1) - 1, 2 * (y / 4).max(1) - 1);
    }

    fn fill_donut_plane(&mut self, z: f32, count_x: u32, count_y: u32) {
        let plane_x = 2.0 * (z - self.camera.position.z).abs() * (0.5 * self.camera.fov).tan();
        let plane_y = plane_x / self.camera.aspect;
        let cell = Vec3::new(plane_x / count_x as f32, plane_y / count_y as f32, 1.0);
        let scaling = Vec3::splat(0.9 * cell.x.min(cell.y));

        for iy in 0..count_y {
            for ix in 0..count_x {
                let id = self.next_node_id;
                self.next_node_id += 1;
                let grid = Vec3::new(
                    ix as f32 - 0.5 * (count_x - 1) as f32,
                    iy as f32 - 0.5 * (count_y - 1) as f32,
                    z,
                );
                self.nodes.push(Node {
                    id,
                    node_type: NodeType::Torus,
                    scaling,
                    roll: 0.0,
                    pitch: 0.0,
                    yaw: 0.0,
                    translation: cell * grid,
                });
            }
        }
    }
}

/// Deterministic per-node rates in `[0.2, 1.0)`.
fn rotation_rates(seed: u32) -> [f32; 3] {
    let mut state = (seed as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        1e-2 * (20 + state % 80) as f32
    };
    [next(), next(), next()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let scene = Scene::new();
        // 15 x 9 front grid plus a 5 x 3 back plane
        assert_eq!(scene.nodes().len(), 15 * 9 + 5 * 3);
        assert_eq!(scene.nodes()[0].translation().z, 0.0);
        assert_eq!(scene.nodes().last().unwrap().translation().z, -2.0);
    }

    #[test]
    fn test_ids_come_from_scene_counter() {
        let mut scene = Scene::new();
        let first: Vec<u32> = scene.nodes().iter().map(Node::id).collect();
        assert_eq!(first, (0..first.len() as u32).collect::<Vec<_>>());

        scene.set_num_donuts(1, 1);
        // 1 x 1 front plus 1 x 1 back, numbered after the previous layout
        let ids: Vec<u32> = scene.nodes().iter().map(Node::id).collect();
        assert_eq!(ids, vec![first.len() as u32, first.len() as u32 + 1]);
    }

    #[test]
    fn test_set_num_donuts_clamps_to_one() {
        let mut scene = Scene::new();
        scene.set_num_donuts(0, 0);
        assert_eq!(scene.num_donuts(), (1, 1));
        assert_eq!(scene.nodes().len(), 2);
    }

    #[test]
    fn test_update_is_deterministic() {
        let mut a = Scene::new();
        let mut b = Scene::new();
        a.update(16.0);
        b.update(16.0);
        assert_eq!(a.runtime_millis(), 16.0);
        assert_eq!(a.num_updates(), 1);
        for (na, nb) in a.nodes().iter().zip(b.nodes()) {
            assert_eq!(na.model(), nb.model());
        }
    }

    #[test]
    fn test_visitor_sees_every_node() {
        let scene = Scene::new();
        let mut count = 0;
        scene.collect_visible_nodes(|node| {
            assert_eq!(node.node_type(), NodeType::Torus);
            count += 1;
        });
        assert_eq!(count, scene.nodes().len());
    }

    #[test]
    fn test_projection_maps_near_and_far() {
        let scene = Scene::new();
        let cam = scene.camera();
        let near = cam.proj * glam::Vec4::new(0.0, 0.0, cam.near, 1.0);
        let far = cam.proj * glam::Vec4::new(0.0, 0.0, cam.far, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-5);
    }
}
