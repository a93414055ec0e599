//! Frame-delayed destruction of GPU resources.
//!
//! Buffers, images and raw allocations may still be referenced by command
//! buffers in flight. Instead of destroying them directly they are
//! scheduled here with a target frame and released once the logical
//! device's frame counter has moved past it.

use super::pool::Allocation;
use super::resource::{BufferAllocation, ImageAllocation};
use crate::gpu::FrameIndex;
use crate::sync::Mutex;

/// A resource waiting for destruction.
#[derive(Debug)]
pub enum Deallocation {
    Memory(Allocation),
    Buffer(BufferAllocation),
    Image(ImageAllocation),
}

impl From<Allocation> for Deallocation {
    fn from(allocation: Allocation) -> Self {
        Deallocation::Memory(allocation)
    }
}

impl From<BufferAllocation> for Deallocation {
    fn from(buffer: BufferAllocation) -> Self {
        Deallocation::Buffer(buffer)
    }
}

impl From<ImageAllocation> for Deallocation {
    fn from(image: ImageAllocation) -> Self {
        Deallocation::Image(image)
    }
}

/// Frame-sorted queue of pending deallocations.
pub struct DeallocationQueue {
    entries: Mutex<Vec<(FrameIndex, Deallocation)>>,
}

impl DeallocationQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Schedule `resource` for destruction at `current_frame + frames_to_keep`.
    ///
    /// Entries with equal target keep their scheduling order.
    pub fn schedule(&self, resource: impl Into<Deallocation>, current_frame: FrameIndex, frames_to_keep: u64) {
        let target = current_frame + frames_to_keep;
        let mut entries = self.entries.lock();
        let pos = entries.partition_point(|(frame, _)| *frame <= target);
        entries.insert(pos, (target, resource.into()));
    }

    /// Destroy every entry whose target frame is strictly below `current_frame`.
    ///
    /// Returns the number of destroyed entries.
    pub fn collect(&self, current_frame: FrameIndex) -> usize {
        let expired: Vec<(FrameIndex, Deallocation)> = {
            let mut entries = self.entries.lock();
            let end = entries.partition_point(|(frame, _)| *frame < current_frame);
            entries.drain(..end).collect()
        };
        // dropped outside the lock: pools take their own lock on free
        expired.len()
    }

    /// Destroy everything regardless of target frame.
    ///
    /// Only valid once the device is known to be idle.
    pub fn clear(&self) -> usize {
        let all = std::mem::take(&mut *self.entries.lock());
        all.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Target frames in queue order.
    pub fn target_frames(&self) -> Vec<FrameIndex> {
        self.entries.lock().iter().map(|(frame, _)| *frame).collect()
    }
}

impl Default for DeallocationQueue {
    fn default() -> Self {
        Self::new()
    }
}
