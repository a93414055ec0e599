//! Frame loop statistics.

use crate::sync::atomics::{AtomicCounter, HighWaterGauge};

/// Snapshot of a logical device's frame loop counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderStats {
    /// Frames whose submission went through.
    pub frames_rendered: u64,

    /// Display presents dropped after a failed acquire.
    pub skipped_presents: u64,

    /// Batched presents the presentation engine rejected.
    pub failed_presents: u64,

    /// Resources waiting in the deallocation queue.
    pub deallocations_pending: usize,

    /// Largest deallocation queue seen so far.
    pub peak_deallocations_pending: usize,

    /// Memory pools created so far, staging pool included.
    pub memory_pools: usize,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of display frames that reached the screen.
    pub fn present_ratio(&self, num_displays: usize) -> f64 {
        let expected = self.frames_rendered * num_displays as u64;
        if expected == 0 {
            return 0.0;
        }
        expected.saturating_sub(self.skipped_presents) as f64 / expected as f64
    }
}

impl std::fmt::Display for RenderStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Render Statistics:")?;
        writeln!(f, "  Frames rendered:   {}", self.frames_rendered)?;
        writeln!(f, "  Skipped presents:  {}", self.skipped_presents)?;
        writeln!(f, "  Failed presents:   {}", self.failed_presents)?;
        writeln!(
            f,
            "  Pending frees:     {} (peak {})",
            self.deallocations_pending, self.peak_deallocations_pending
        )?;
        writeln!(f, "  Memory pools:      {}", self.memory_pools)?;
        Ok(())
    }
}

/// Live counters updated by the frame loop.
#[derive(Debug, Default)]
pub(crate) struct FrameCounters {
    pub frames_rendered: AtomicCounter,
    pub skipped_presents: AtomicCounter,
    pub failed_presents: AtomicCounter,
    pub deallocations: HighWaterGauge,
}

impl FrameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, memory_pools: usize) -> RenderStats {
        RenderStats {
            frames_rendered: self.frames_rendered.get(),
            skipped_presents: self.skipped_presents.get(),
            failed_presents: self.failed_presents.get(),
            deallocations_pending: self.deallocations.current(),
            peak_deallocations_pending: self.deallocations.peak(),
            memory_pools,
        }
    }
}
