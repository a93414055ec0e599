//! Worker threads recording command buffers on request.
//!
//! Each [`RenderThread`] owns one OS thread and a mailbox (mutex plus
//! condition variable). The main thread posts a [`RecordJob`] with
//! [`record_commands_async`](RenderThread::record_commands_async) and later
//! blocks in [`finish_command_recording`](RenderThread::finish_command_recording)
//! until the worker is idle again.
//!
//! ```text
//! Created -> Waiting <-> Recording
//!               \           |
//!                `-> Interrupted
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ash::vk;

use crate::command::CommandExecutionUnit;
use crate::dd_emit;
use crate::gpu::{DeviceIndex, FrameIndex, GpuDevice, GpuError, SemaphoreKind};
use crate::sync::{Condvar, Mutex};

/// Mailbox status of a render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderThreadStatus {
    Created,
    Recording,
    Waiting,
    Interrupted,
}

/// Everything a recorder needs for one frame.
#[derive(Clone)]
pub struct RecordJob {
    pub unit: Arc<CommandExecutionUnit>,
    pub framebuffer: vk::Framebuffer,
    pub frame: FrameIndex,
    /// Signaled by the display once the swapchain image is acquired.
    pub image_acquired: vk::Semaphore,
    /// To be signaled by the recorded work when rendering is done.
    pub render_done: vk::Semaphore,
}

/// What a render thread records. Runs on the worker thread.
pub trait RecordCommands: Send + 'static {
    fn record(&mut self, job: &RecordJob) -> Result<(), GpuError>;
}

impl<F> RecordCommands for F
where
    F: FnMut(&RecordJob) -> Result<(), GpuError> + Send + 'static,
{
    fn record(&mut self, job: &RecordJob) -> Result<(), GpuError> {
        self(job)
    }
}

struct Mailbox {
    status: RenderThreadStatus,
    job: Option<RecordJob>,
    /// The worker is inside `record` with the lock released.
    in_progress: bool,
    recorded: u64,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    cvar: Condvar,
}

/// One worker thread with its handoff semaphores.
pub struct RenderThread {
    gpu: Arc<dyn GpuDevice>,
    device_index: DeviceIndex,
    image_acquired: vk::Semaphore,
    render_done: vk::Semaphore,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Create the semaphores and spawn the worker running `recorder`.
    pub fn spawn(
        gpu: Arc<dyn GpuDevice>,
        device_index: DeviceIndex,
        name: String,
        recorder: impl RecordCommands,
    ) -> Result<Self, GpuError> {
        let image_acquired = gpu.create_semaphore(SemaphoreKind::Binary)?;
        let render_done = match gpu.create_semaphore(SemaphoreKind::Binary) {
            Ok(semaphore) => semaphore,
            Err(err) => {
                gpu.destroy_semaphore(image_acquired);
                return Err(err);
            }
        };

        let shared = Arc::new(Shared {
            mailbox: Mutex::new(Mailbox {
                status: RenderThreadStatus::Created,
                job: None,
                in_progress: false,
                recorded: 0,
            }),
            cvar: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&worker_shared, recorder));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                gpu.destroy_semaphore(image_acquired);
                gpu.destroy_semaphore(render_done);
                return Err(GpuError::Device(format!("failed to spawn render thread: {}", err)));
            }
        };

        Ok(Self {
            gpu,
            device_index,
            image_acquired,
            render_done,
            shared,
            handle: Some(handle),
        })
    }

    pub fn device_index(&self) -> DeviceIndex {
        self.device_index
    }

    pub fn image_acquired_semaphore(&self) -> vk::Semaphore {
        self.image_acquired
    }

    pub fn render_done_semaphore(&self) -> vk::Semaphore {
        self.render_done
    }

    pub fn status(&self) -> RenderThreadStatus {
        self.shared.mailbox.lock().status
    }

    /// Number of jobs recorded so far.
    pub fn recorded_count(&self) -> u64 {
        self.shared.mailbox.lock().recorded
    }

    /// Ask the worker to record a frame. Does not block.
    ///
    /// Ignored once the thread has been interrupted.
    pub fn record_commands_async(&self, unit: Arc<CommandExecutionUnit>, framebuffer: vk::Framebuffer, frame: FrameIndex) {
        let mut mailbox = self.shared.mailbox.lock();
        if mailbox.status == RenderThreadStatus::Interrupted {
            return;
        }
        mailbox.job = Some(RecordJob {
            unit,
            framebuffer,
            frame,
            image_acquired: self.image_acquired,
            render_done: self.render_done,
        });
        mailbox.status = RenderThreadStatus::Recording;
        self.shared.cvar.notify_all();
    }

    /// Block until no recording is requested or in progress.
    pub fn finish_command_recording(&self) {
        let mut mailbox = self.shared.mailbox.lock();
        while mailbox.status == RenderThreadStatus::Recording || mailbox.in_progress {
            self.shared.cvar.wait(&mut mailbox);
        }
    }

    /// Stop the worker once its current recording, if any, is done.
    pub fn interrupt(&self) {
        let mut mailbox = self.shared.mailbox.lock();
        mailbox.status = RenderThreadStatus::Interrupted;
        mailbox.job = None;
        self.shared.cvar.notify_all();
    }

    /// Wait for the worker thread to exit. Requires a prior [`interrupt`](Self::interrupt).
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                dd_emit!(DD901, "render thread of device {} terminated by a panic", self.device_index);
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.interrupt();
        self.join();
        self.gpu.destroy_semaphore(self.image_acquired);
        self.gpu.destroy_semaphore(self.render_done);
    }
}

fn worker_loop<R: RecordCommands>(shared: &Shared, mut recorder: R) {
    let mut mailbox = shared.mailbox.lock();
    loop {
        let status = mailbox.status;
        match status {
            RenderThreadStatus::Interrupted => break,
            RenderThreadStatus::Created => {
                mailbox.status = RenderThreadStatus::Waiting;
                shared.cvar.notify_all();
            }
            RenderThreadStatus::Waiting => shared.cvar.wait(&mut mailbox),
            RenderThreadStatus::Recording => {
                let Some(job) = mailbox.job.take() else {
                    mailbox.status = RenderThreadStatus::Waiting;
                    shared.cvar.notify_all();
                    continue;
                };
                mailbox.in_progress = true;
                drop(mailbox);

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| recorder.record(&job)));
                drop(job);

                mailbox = shared.mailbox.lock();
                mailbox.in_progress = false;
                mailbox.recorded += 1;
                // a new job or an interrupt posted meanwhile takes precedence
                if mailbox.status == RenderThreadStatus::Recording && mailbox.job.is_none() {
                    mailbox.status = RenderThreadStatus::Waiting;
                }
                shared.cvar.notify_all();

                if !matches!(outcome, Ok(Ok(()))) {
                    drop(mailbox);
                    report_failure(outcome);
                    mailbox = shared.mailbox.lock();
                }
            }
        }
    }
}

/// Report a failed recording with the mailbox unlocked.
fn report_failure(outcome: thread::Result<Result<(), GpuError>>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("command recording failed: {}", err),
        Err(_) => dd_emit!(DD901, "recorder panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::gpu::DummyDevice;

    fn spawn_counting(gpu: &Arc<DummyDevice>, counter: Arc<AtomicUsize>, delay: Duration) -> RenderThread {
        RenderThread::spawn(gpu.clone(), 0, "test-render".to_string(), move |_: &RecordJob| {
            thread::sleep(delay);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_finish_waits_for_every_thread() {
        let gpu = Arc::new(DummyDevice::new(1));
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        let counter = Arc::new(AtomicUsize::new(0));
        let threads: Vec<RenderThread> = (0..2)
            .map(|_| spawn_counting(&gpu, counter.clone(), Duration::from_millis(20)))
            .collect();

        for frame in 0..3 {
            for t in &threads {
                t.record_commands_async(unit.clone(), vk::Framebuffer::null(), frame);
            }
            for t in &threads {
                t.finish_command_recording();
                assert_eq!(t.status(), RenderThreadStatus::Waiting);
            }
            assert_eq!(counter.load(Ordering::SeqCst), 2 * (frame as usize + 1));
        }
    }

    #[test]
    fn test_interrupt_does_not_abort_running_recording() {
        let gpu = Arc::new(DummyDevice::new(1));
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (s, f) = (started.clone(), finished.clone());
        let mut t = RenderThread::spawn(gpu.clone(), 0, "test-render".to_string(), move |_: &RecordJob| {
            s.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            f.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        t.record_commands_async(unit.clone(), vk::Framebuffer::null(), 0);
        while !started.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        t.interrupt();
        t.finish_command_recording();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(t.status(), RenderThreadStatus::Interrupted);

        // new requests are ignored once interrupted
        t.record_commands_async(unit, vk::Framebuffer::null(), 1);
        assert_eq!(t.status(), RenderThreadStatus::Interrupted);
        t.join();
        assert_eq!(t.recorded_count(), 1);
    }

    #[test]
    fn test_job_carries_thread_semaphores() {
        let gpu = Arc::new(DummyDevice::new(1));
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let t = RenderThread::spawn(gpu.clone(), 0, "test-render".to_string(), move |job: &RecordJob| {
            *sink.lock() = Some((job.frame, job.image_acquired, job.render_done));
            Ok(())
        })
        .unwrap();

        t.record_commands_async(unit, vk::Framebuffer::null(), 9);
        t.finish_command_recording();
        assert_eq!(
            *seen.lock(),
            Some((9, t.image_acquired_semaphore(), t.render_done_semaphore()))
        );
    }

    #[test]
    fn test_drop_joins_and_releases_semaphores() {
        let gpu = Arc::new(DummyDevice::new(1));
        {
            let _t = spawn_counting(&gpu, Arc::new(AtomicUsize::new(0)), Duration::ZERO);
            assert_eq!(gpu.live_objects().semaphores, 2);
        }
        assert_eq!(gpu.live_objects().semaphores, 0);
    }

    #[test]
    fn test_failing_recorder_keeps_thread_alive() {
        let gpu = Arc::new(DummyDevice::new(1));
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        let t = RenderThread::spawn(gpu.clone(), 0, "test-render".to_string(), |_: &RecordJob| {
            Err(GpuError::OutOfMemory)
        })
        .unwrap();

        for frame in 0..2 {
            t.record_commands_async(unit.clone(), vk::Framebuffer::null(), frame);
            t.finish_command_recording();
        }
        assert_eq!(t.recorded_count(), 2);
        assert_eq!(t.status(), RenderThreadStatus::Waiting);
    }

    #[test]
    fn test_fatal_panic_report_releases_mailbox() {
        use crate::diagnostics::{set_thread_sink, PanickingSink};

        let gpu = Arc::new(DummyDevice::new(1));
        let unit = Arc::new(CommandExecutionUnit::new(gpu.clone()));
        let t = RenderThread::spawn(gpu.clone(), 0, "test-render".to_string(), |_: &RecordJob| -> Result<(), GpuError> {
            // the DD901 report of this panic is fatal on the worker
            set_thread_sink(Some(Arc::new(PanickingSink)));
            panic!("recorder failure");
        })
        .unwrap();

        t.record_commands_async(unit, vk::Framebuffer::null(), 0);
        t.finish_command_recording();
        assert_eq!(t.recorded_count(), 1);
        assert_eq!(t.status(), RenderThreadStatus::Waiting);
    }
}
