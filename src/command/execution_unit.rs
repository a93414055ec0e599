//! Per-frame command buffer lifecycle.
//!
//! A [`CommandExecutionUnit`] hands out command buffers from per-thread,
//! per-queue-family pools, collects the semaphores each buffer waits on and
//! signals, and submits everything recorded during a frame in one call per
//! queue family. The logical device keeps a ring of units so that a unit is
//! only reused once the fences of its previous submission have signaled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use ash::vk;

use crate::dd_emit;
use crate::gpu::{DeviceMask, GpuDevice, GpuError, SemaphoreSubmit, SubmitBatch};
use crate::sync::Mutex;

/// Pre-allocated command buffers of one thread for one queue family.
struct CommandBufferPool {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next_command_buffer_index: usize,
}

struct QueueFamilyData {
    fence: vk::Fence,
    /// A submission against `fence` has not been waited on yet.
    pending: bool,
    pools: HashMap<ThreadId, CommandBufferPool>,
}

struct CommandBufferInfo {
    device_mask: DeviceMask,
    waits: Vec<SemaphoreSubmit>,
    signals: Vec<SemaphoreSubmit>,
}

#[derive(Default)]
struct UnitState {
    families: BTreeMap<u32, QueueFamilyData>,
    infos: HashMap<vk::CommandBuffer, CommandBufferInfo>,
    submit_order: BTreeMap<u32, Vec<vk::CommandBuffer>>,
}

/// Command pools, per-buffer semaphore lists and one fence per queue family.
pub struct CommandExecutionUnit {
    gpu: Arc<dyn GpuDevice>,
    state: Mutex<UnitState>,
}

impl CommandExecutionUnit {
    pub fn new(gpu: Arc<dyn GpuDevice>) -> Self {
        Self {
            gpu,
            state: Mutex::new(UnitState::default()),
        }
    }

    /// Hand out a command buffer of `queue_family_index` for the calling thread.
    ///
    /// The buffer is submitted with `device_mask` at the next [`submit`](Self::submit),
    /// after every buffer of the same family requested before it.
    pub fn request_command_buffer(
        &self,
        queue_family_index: u32,
        device_mask: DeviceMask,
    ) -> Result<vk::CommandBuffer, GpuError> {
        let thread = thread::current().id();
        let mut state = self.state.lock();
        self.request_locked(&mut state, queue_family_index, device_mask, thread)
    }

    /// Same as [`request_command_buffer`](Self::request_command_buffer) for
    /// several families under one lock. Buffers are returned in argument order.
    pub fn request_command_buffers(
        &self,
        queue_family_indices: &[u32],
        device_mask: DeviceMask,
    ) -> Result<Vec<vk::CommandBuffer>, GpuError> {
        let thread = thread::current().id();
        let mut state = self.state.lock();
        queue_family_indices
            .iter()
            .map(|family| self.request_locked(&mut state, *family, device_mask, thread))
            .collect()
    }

    fn request_locked(
        &self,
        state: &mut UnitState,
        queue_family_index: u32,
        device_mask: DeviceMask,
        thread: ThreadId,
    ) -> Result<vk::CommandBuffer, GpuError> {
        if !state.families.contains_key(&queue_family_index) {
            let fence = self.gpu.create_fence()?;
            state.families.insert(
                queue_family_index,
                QueueFamilyData {
                    fence,
                    pending: false,
                    pools: HashMap::new(),
                },
            );
        }
        let family = state
            .families
            .get_mut(&queue_family_index)
            .ok_or(GpuError::NoQueueFamily)?;

        if !family.pools.contains_key(&thread) {
            let pool = self.gpu.create_command_pool(queue_family_index)?;
            family.pools.insert(
                thread,
                CommandBufferPool {
                    pool,
                    buffers: Vec::new(),
                    next_command_buffer_index: 0,
                },
            );
        }
        let pool = family
            .pools
            .get_mut(&thread)
            .ok_or(GpuError::NoQueueFamily)?;

        if pool.next_command_buffer_index == pool.buffers.len() {
            let command_buffer = self.gpu.allocate_command_buffer(pool.pool)?;
            pool.buffers.push(command_buffer);
        }
        let command_buffer = pool.buffers[pool.next_command_buffer_index];
        pool.next_command_buffer_index += 1;

        state
            .submit_order
            .entry(queue_family_index)
            .or_default()
            .push(command_buffer);
        state.infos.insert(
            command_buffer,
            CommandBufferInfo {
                device_mask,
                waits: Vec::new(),
                signals: Vec::new(),
            },
        );
        Ok(command_buffer)
    }

    /// Make `command_buffer` wait on `wait` when submitted.
    pub fn push_wait(&self, command_buffer: vk::CommandBuffer, wait: SemaphoreSubmit) {
        self.push_waits(command_buffer, &[wait]);
    }

    pub fn push_waits(&self, command_buffer: vk::CommandBuffer, waits: &[SemaphoreSubmit]) {
        let known = match self.state.lock().infos.get_mut(&command_buffer) {
            Some(info) => {
                info.waits.extend_from_slice(waits);
                true
            }
            None => false,
        };
        if !known {
            dd_emit!(DD101, "push_wait on {:?}", command_buffer);
        }
    }

    /// Make `command_buffer` signal `signal` when it completes.
    pub fn push_signal(&self, command_buffer: vk::CommandBuffer, signal: SemaphoreSubmit) {
        self.push_signals(command_buffer, &[signal]);
    }

    pub fn push_signals(&self, command_buffer: vk::CommandBuffer, signals: &[SemaphoreSubmit]) {
        let known = match self.state.lock().infos.get_mut(&command_buffer) {
            Some(info) => {
                info.signals.extend_from_slice(signals);
                true
            }
            None => false,
        };
        if !known {
            dd_emit!(DD101, "push_signal on {:?}", command_buffer);
        }
    }

    /// Block until the last submission of every queue family has completed.
    pub fn wait_for_idle(&self) -> Result<(), GpuError> {
        let waited = {
            let mut state = self.state.lock();
            self.wait_locked(&mut state)
        };
        waited.map_err(wait_failed)
    }

    fn wait_locked(&self, state: &mut UnitState) -> Result<(), GpuError> {
        let fences: Vec<vk::Fence> = state
            .families
            .values()
            .filter(|f| f.pending)
            .map(|f| f.fence)
            .collect();
        if fences.is_empty() {
            return Ok(());
        }

        self.gpu.wait_for_fences(&fences)?;
        self.gpu.reset_fences(&fences)?;
        for family in state.families.values_mut() {
            family.pending = false;
        }
        Ok(())
    }

    /// [`wait_for_idle`](Self::wait_for_idle), then reset every command pool
    /// so its buffers are handed out again from the start.
    pub fn wait_for_idle_and_reset(&self) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        if let Err(err) = self.wait_locked(&mut state) {
            drop(state);
            return Err(wait_failed(err));
        }

        for family in state.families.values_mut() {
            for pool in family.pools.values_mut() {
                self.gpu.reset_command_pool(pool.pool)?;
                pool.next_command_buffer_index = 0;
            }
        }
        state.infos.clear();
        state.submit_order.clear();
        Ok(())
    }

    /// Submit every buffer requested since the last reset.
    ///
    /// One submission per queue family in ascending family order, buffers in
    /// request order. A failing family does not stop the others; the first
    /// error is returned.
    pub fn submit(&self) -> Result<(), GpuError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let order = std::mem::take(&mut state.submit_order);
        let mut infos = std::mem::take(&mut state.infos);
        let mut failures = Vec::new();
        let mut result = Ok(());

        for (queue_family_index, command_buffers) in order {
            let batches: Vec<SubmitBatch> = command_buffers
                .into_iter()
                .map(|command_buffer| {
                    let info = infos.remove(&command_buffer);
                    let (device_mask, waits, signals) = match info {
                        Some(info) => (info.device_mask, info.waits, info.signals),
                        None => (DeviceMask::none(), Vec::new(), Vec::new()),
                    };
                    SubmitBatch {
                        command_buffer,
                        device_mask,
                        waits,
                        signals,
                    }
                })
                .collect();

            let Some(family) = state.families.get_mut(&queue_family_index) else {
                continue;
            };
            match self.gpu.queue_submit(queue_family_index, &batches, family.fence) {
                Ok(()) => family.pending = true,
                Err(err) => {
                    failures.push(format!("queue family {}: {}", queue_family_index, err));
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        drop(guard);
        for failure in failures {
            dd_emit!(DD103, "{}", failure);
        }
        result
    }

    /// Buffers of `queue_family_index` queued for the next submit, in order.
    pub fn pending_command_buffers(&self, queue_family_index: u32) -> Vec<vk::CommandBuffer> {
        self.state
            .lock()
            .submit_order
            .get(&queue_family_index)
            .cloned()
            .unwrap_or_default()
    }
}

/// Report a failed wait. Called with the unit state unlocked.
fn wait_failed(err: GpuError) -> GpuError {
    dd_emit!(DD102, "{}", err);
    err
}

impl Drop for CommandExecutionUnit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(err) = self.wait_locked(&mut state) {
            log::error!("dropping command execution unit with unfinished work: {}", err);
        }
        for (_, family) in std::mem::take(&mut state.families) {
            for (_, pool) in family.pools {
                self.gpu.destroy_command_pool(pool.pool);
            }
            self.gpu.destroy_fence(family.fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{set_thread_sink, CollectingSink};
    use crate::gpu::DummyDevice;

    fn unit() -> (Arc<DummyDevice>, CommandExecutionUnit) {
        let gpu = Arc::new(DummyDevice::new(2));
        let unit = CommandExecutionUnit::new(gpu.clone());
        (gpu, unit)
    }

    #[test]
    fn test_submission_follows_request_order_and_reuses_buffers() {
        let (gpu, unit) = unit();

        let a = unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        let b = unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        let c = unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        unit.submit().unwrap();

        let submissions = gpu.take_submissions();
        assert_eq!(submissions.len(), 1);
        let order: Vec<_> = submissions[0].batches.iter().map(|b| b.command_buffer).collect();
        assert_eq!(order, vec![a, b, c]);

        unit.wait_for_idle_and_reset().unwrap();
        let again = unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn test_families_submitted_in_ascending_order() {
        let (gpu, unit) = unit();

        let transfer = unit.request_command_buffer(1, DeviceMask::none()).unwrap();
        let graphics = unit.request_command_buffers(&[0, 0], DeviceMask::none()).unwrap();
        assert_eq!(unit.pending_command_buffers(0), graphics);
        unit.submit().unwrap();

        let submissions = gpu.take_submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].queue_family_index, 0);
        assert_eq!(submissions[0].batches.len(), 2);
        assert_eq!(submissions[1].queue_family_index, 1);
        assert_eq!(submissions[1].batches[0].command_buffer, transfer);
        assert!(unit.pending_command_buffers(0).is_empty());
    }

    #[test]
    fn test_semaphores_and_mask_attached_to_batch() {
        let (gpu, unit) = unit();
        let sem = vk::Semaphore::null();

        let cb = unit.request_command_buffer(0, DeviceMask::of_single_device(1)).unwrap();
        unit.push_wait(cb, SemaphoreSubmit::binary(sem, vk::PipelineStageFlags2::TRANSFER));
        unit.push_signals(
            cb,
            &[
                SemaphoreSubmit::timeline(sem, 1, vk::PipelineStageFlags2::COPY),
                SemaphoreSubmit::timeline(sem, 2, vk::PipelineStageFlags2::COPY),
            ],
        );
        unit.submit().unwrap();

        let batch = &gpu.submissions()[0].batches[0];
        assert_eq!(batch.device_mask, DeviceMask::of_single_device(1));
        assert_eq!(batch.waits.len(), 1);
        assert_eq!(batch.signals.iter().map(|s| s.value).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_unknown_command_buffer_is_reported() {
        use ash::vk::Handle;

        let (_gpu, unit) = unit();
        let sink = Arc::new(CollectingSink::new());
        let previous = set_thread_sink(Some(sink.clone()));

        let bogus = vk::CommandBuffer::from_raw(0xdead);
        unit.push_wait(bogus, SemaphoreSubmit::binary(vk::Semaphore::null(), vk::PipelineStageFlags2::NONE));
        unit.push_signal(bogus, SemaphoreSubmit::binary(vk::Semaphore::null(), vk::PipelineStageFlags2::NONE));

        set_thread_sink(previous);
        assert_eq!(sink.codes(), vec!["DD101", "DD101"]);
    }

    #[test]
    fn test_fatal_diagnostic_leaves_unit_usable() {
        use std::panic::{self, AssertUnwindSafe};

        use ash::vk::Handle;

        use crate::diagnostics::PanickingSink;

        let (gpu, unit) = unit();
        let bogus = vk::CommandBuffer::from_raw(0xdead);
        let previous = set_thread_sink(Some(Arc::new(PanickingSink)));
        let wait = panic::catch_unwind(AssertUnwindSafe(|| {
            unit.push_wait(bogus, SemaphoreSubmit::binary(vk::Semaphore::null(), vk::PipelineStageFlags2::NONE))
        }));
        let signal = panic::catch_unwind(AssertUnwindSafe(|| {
            unit.push_signal(bogus, SemaphoreSubmit::binary(vk::Semaphore::null(), vk::PipelineStageFlags2::NONE))
        }));
        set_thread_sink(previous);
        assert!(wait.is_err() && signal.is_err());

        let cb = unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        unit.push_wait(cb, SemaphoreSubmit::binary(vk::Semaphore::null(), vk::PipelineStageFlags2::NONE));
        gpu.begin_command_buffer(cb, DeviceMask::none()).unwrap();
        gpu.end_command_buffer(cb).unwrap();
        unit.submit().unwrap();
        unit.wait_for_idle_and_reset().unwrap();
        assert!(gpu.validation_errors().is_empty());
    }

    #[test]
    fn test_each_thread_gets_its_own_pool() {
        let (gpu, unit) = unit();
        let unit = Arc::new(unit);

        let main = unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        let worker = {
            let unit = unit.clone();
            std::thread::spawn(move || unit.request_command_buffer(0, DeviceMask::none()).unwrap())
                .join()
                .unwrap()
        };
        assert_ne!(main, worker);
        assert_eq!(gpu.live_objects().command_pools, 2);
        assert_eq!(unit.pending_command_buffers(0), vec![main, worker]);
    }

    #[test]
    fn test_fence_waited_only_after_submission() {
        let (gpu, unit) = unit();

        // nothing submitted yet: no fence to wait for
        unit.wait_for_idle().unwrap();

        unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        unit.submit().unwrap();
        unit.wait_for_idle_and_reset().unwrap();
        unit.request_command_buffer(0, DeviceMask::none()).unwrap();
        unit.submit().unwrap();

        assert_eq!(gpu.live_objects().fences, 1);
        assert!(gpu.validation_errors().is_empty());
    }

    #[test]
    fn test_drop_destroys_pools_and_fences() {
        let (gpu, unit) = unit();
        unit.request_command_buffers(&[0, 1, 2], DeviceMask::none()).unwrap();
        unit.submit().unwrap();
        drop(unit);

        let live = gpu.live_objects();
        assert_eq!(live.command_pools, 0);
        assert_eq!(live.fences, 0);
        assert!(gpu.validation_errors().is_empty());
    }
}
