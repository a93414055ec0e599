//! Integration tests for ddisplay.

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use ddisplay::diagnostics::{set_thread_sink, CollectingSink, DiagnosticSink};
use ddisplay::gpu::{DummyDevice, DummyDisplay, LiveObjects, RecordedCommand};
use ddisplay::render::MeshData;
use ddisplay::sync::RwLock;
use ddisplay::{CanvasRegion, DeviceMask, LogicalDevice, RenderConfig, RenderThreadStatus, Scene};

fn rect(x: i32, y: i32, width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x, y },
        extent: vk::Extent2D { width, height },
    }
}

fn handle(raw: u64) -> vk::DisplayKHR {
    vk::DisplayKHR::from_raw(raw)
}

fn small_scene() -> Arc<RwLock<Scene>> {
    let mut scene = Scene::new();
    scene.set_num_donuts(2, 2);
    Arc::new(RwLock::new(scene))
}

/// One device, one display, started.
fn single_display(config: RenderConfig) -> (Arc<DummyDevice>, LogicalDevice) {
    let (gpu, device, _) = single_display_with_scene(config);
    (gpu, device)
}

fn single_display_with_scene(config: RenderConfig) -> (Arc<DummyDevice>, LogicalDevice, Arc<RwLock<Scene>>) {
    let gpu = Arc::new(DummyDevice::new(1).with_display(DummyDisplay::new(1, "main", 640, 480)));
    let scene = small_scene();
    let mut device = LogicalDevice::new(gpu.clone(), config).unwrap();
    device
        .enable_display(handle(1), CanvasRegion::default(), scene.clone())
        .unwrap();
    device.start().unwrap();
    (gpu, device, scene)
}

#[test]
fn test_full_frames_single_display() {
    let (gpu, mut device) = single_display(RenderConfig::minimal());

    for _ in 0..6 {
        device.render();
    }

    assert_eq!(device.frame_index(), 6);
    let stats = device.stats();
    assert_eq!(stats.frames_rendered, 6);
    assert_eq!(stats.skipped_presents, 0);

    let presents = gpu.presents();
    assert_eq!(presents.len(), 6);
    // two swapchain images, acquired round robin
    let indices: Vec<u32> = presents.iter().map(|p| p[0].image_index).collect();
    assert_eq!(indices, vec![0, 1, 0, 1, 0, 1]);

    device.interrupt();
    device.join();
    assert!(device.displays()[0]
        .render_threads()
        .iter()
        .all(|t| t.status() == RenderThreadStatus::Interrupted));
    assert!(gpu.validation_errors().is_empty(), "{:?}", gpu.validation_errors());
}

#[test]
fn test_mesh_upload_reaches_device_memory() {
    let config = RenderConfig::minimal().with_torus_tessellation(6);
    let (gpu, mut device) = single_display(config);
    device.render();

    let mesh = device.context().donut_mesh(0, 6).unwrap();
    let expected = MeshData::torus(6, 12);
    let index_bytes: &[u8] = bytemuck::cast_slice(&expected.indices);
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&expected.vertices);

    assert_eq!(
        gpu.read_buffer(mesh.index_buffer(), 0, index_bytes.len()).unwrap(),
        index_bytes
    );
    assert_eq!(
        gpu.read_buffer(mesh.vertex_buffer(), 0, vertex_bytes.len()).unwrap(),
        vertex_bytes
    );
    // the uploader signals frame + 1 once the copies of a frame are done
    let uploader = device.context().uploader().sync_semaphore();
    assert_eq!(gpu.timeline_value(uploader), Some(1));
}

#[test]
fn test_multi_gpu_wall_splits_render_areas() {
    let display = DummyDisplay::new(5, "wall", 1920, 1080).with_present_rects(vec![
        (0, vec![rect(0, 0, 960, 1080)]),
        (1, vec![rect(960, 0, 960, 1080)]),
    ]);
    let gpu = Arc::new(DummyDevice::new(2).with_display(display));
    let mut device = LogicalDevice::new(gpu.clone(), RenderConfig::minimal()).unwrap();
    let scene = small_scene();
    device
        .enable_display(handle(5), CanvasRegion::default(), scene.clone())
        .unwrap();
    device.start().unwrap();
    assert_eq!(device.displays()[0].render_threads().len(), 2);

    scene.write().update(250.0);
    device.render();

    // both render threads reached Waiting before the frame was submitted
    assert!(device.displays()[0]
        .render_threads()
        .iter()
        .all(|t| t.status() == RenderThreadStatus::Waiting && t.recorded_count() == 1));

    let submissions = gpu.take_submissions();
    let graphics: Vec<_> = submissions
        .iter()
        .filter(|s| s.queue_family_index == 0)
        .flat_map(|s| s.batches.iter())
        .collect();
    for (device_index, x) in [(0u32, 0i32), (1, 960)] {
        let batch = graphics
            .iter()
            .find(|b| b.device_mask == DeviceMask::of_single_device(device_index))
            .expect("render thread batch");
        let commands = gpu.commands(batch.command_buffer);
        assert!(commands.contains(&RecordedCommand::SetScissor(x, 0, 960, 1080)));
        // the shared framebuffer spans the whole canvas on every device
        assert!(commands.contains(&RecordedCommand::SetViewport(0.0, 0.0, 1920.0, 1080.0)));
        // view and projection, then the scene clock
        let clock = commands.iter().find_map(|c| match c {
            RecordedCommand::PushConstants(bytes) => Some(bytes[128..132].to_vec()),
            _ => None,
        });
        assert_eq!(clock, Some(250.0f32.to_le_bytes().to_vec()));
        assert!(batch.waits.iter().all(|w| w.device_index == device_index));
    }

    // one acquire for the whole display, with the mask of both devices
    assert_eq!(gpu.acquire_count(), 1);
    device.interrupt();
    device.join();
}

#[test]
fn test_two_displays_share_one_present() {
    let gpu = Arc::new(
        DummyDevice::new(1)
            .with_display(DummyDisplay::new(1, "left", 640, 480))
            .with_display(DummyDisplay::new(2, "right", 640, 480)),
    );
    let mut device = LogicalDevice::new(gpu.clone(), RenderConfig::minimal()).unwrap();
    let scene = small_scene();
    device
        .enable_display(handle(1), CanvasRegion::new(0.0, 0.0, 2.0, 1.0), scene.clone())
        .unwrap();
    device
        .enable_display(handle(2), CanvasRegion::new(1.0, 0.0, 2.0, 1.0), scene)
        .unwrap();
    device.start().unwrap();

    device.render();
    device.render();

    let presents = gpu.presents();
    assert_eq!(presents.len(), 2);
    assert!(presents.iter().all(|p| p.len() == 2));
    assert_ne!(presents[0][0].swapchain, presents[0][1].swapchain);

    let right = device.displays()[1].render_targets()[0].1;
    assert_eq!(right.viewport.x, -320.0);
    assert_eq!(right.viewport.width, 320.0);
    device.interrupt();
    device.join();
}

#[test]
fn test_failed_acquire_skips_present_and_recovers() {
    let (gpu, mut device) = single_display(RenderConfig::minimal());
    let sink = Arc::new(CollectingSink::new());
    set_thread_sink(Some(sink.clone() as Arc<dyn DiagnosticSink>));

    device.render();
    gpu.set_fail_acquire(true);
    device.render();
    device.render();
    gpu.set_fail_acquire(false);
    device.render();

    set_thread_sink(None);
    assert_eq!(sink.codes(), vec!["DD201", "DD201"]);
    let stats = device.stats();
    assert_eq!(stats.frames_rendered, 4);
    assert_eq!(stats.skipped_presents, 2);
    assert_eq!(gpu.presents().len(), 2);
    assert_eq!(device.frame_index(), 4);
    device.interrupt();
    device.join();
}

#[test]
fn test_failed_present_is_counted() {
    let (gpu, mut device) = single_display(RenderConfig::minimal());
    gpu.set_fail_present(true);
    device.render();
    gpu.set_fail_present(false);
    device.render();

    let stats = device.stats();
    assert_eq!(stats.failed_presents, 1);
    assert_eq!(stats.frames_rendered, 2);
    device.interrupt();
    device.join();
}

#[test]
fn test_deallocation_queue_stays_bounded() {
    let (_gpu, mut device) = single_display(RenderConfig::minimal());
    for _ in 0..16 {
        device.render();
    }
    let settled = device.stats().deallocations_pending;
    for _ in 0..16 {
        device.render();
    }
    let stats = device.stats();
    // staging buffers are released as fast as they are scheduled
    assert_eq!(stats.deallocations_pending, settled);
    assert!(stats.deallocations_pending < 16, "{}", stats);
    assert!(stats.peak_deallocations_pending >= stats.deallocations_pending);

    device.interrupt();
    assert_eq!(device.context().deallocations().len(), 0);
    device.join();
}

#[test]
fn test_shutdown_releases_every_object() {
    let display = DummyDisplay::new(5, "wall", 1280, 720).with_present_rects(vec![
        (0, vec![rect(0, 0, 640, 720)]),
        (1, vec![rect(640, 0, 640, 720)]),
    ]);
    let gpu = Arc::new(DummyDevice::new(2).with_display(display));
    {
        let mut device = LogicalDevice::new(gpu.clone(), RenderConfig::default()).unwrap();
        device
            .enable_display(handle(5), CanvasRegion::default(), small_scene())
            .unwrap();
        device.start().unwrap();
        for _ in 0..5 {
            device.render();
        }
        device.interrupt();
        device.join();
    }
    assert_eq!(gpu.live_objects(), LiveObjects::default());
    assert!(gpu.validation_errors().is_empty(), "{:?}", gpu.validation_errors());
}

#[test]
fn test_scene_updates_between_frames_reach_push_constants() {
    let (gpu, mut device, scene) = single_display_with_scene(RenderConfig::default().with_fur_layers(4));

    // command buffers are reused once their slot comes around again, so read each frame right away
    let mut clocks = Vec::new();
    for frame in 0..8u64 {
        scene.write().update(16.0);
        device.render();
        assert_eq!(device.frame_index(), frame + 1);

        let clock = gpu
            .take_submissions()
            .iter()
            .flat_map(|s| s.batches.iter())
            .filter(|b| b.device_mask == DeviceMask::of_single_device(0))
            .flat_map(|b| gpu.commands(b.command_buffer))
            .find_map(|c| match c {
                RecordedCommand::PushConstants(bytes) => {
                    Some(f32::from_le_bytes([bytes[128], bytes[129], bytes[130], bytes[131]]))
                }
                _ => None,
            });
        clocks.push(clock.expect("push constants recorded"));
    }
    assert_eq!(device.stats().frames_rendered, 8);
    assert_eq!(gpu.presents().len(), 8);
    assert_eq!(clocks.last().copied(), Some(128.0));
    assert!(clocks.windows(2).all(|w| w[0] < w[1]));
    device.interrupt();
    device.join();
}
