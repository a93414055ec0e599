//! Atomic counters for frame-loop statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Monotonic event counter (frames rendered, skipped presents, ...).
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Count one event.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Current value plus the highest value ever observed.
#[derive(Debug, Default)]
pub struct HighWaterGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl HighWaterGauge {
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Record a new current value, raising the peak if needed.
    pub fn set(&self, value: usize) {
        self.current.store(value, Ordering::Relaxed);
        self.peak.fetch_max(value, Ordering::Relaxed);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = AtomicCounter::new(0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_high_water_gauge() {
        let gauge = HighWaterGauge::new();
        gauge.set(5);
        gauge.set(2);
        assert_eq!(gauge.current(), 2);
        assert_eq!(gauge.peak(), 5);
    }
}
