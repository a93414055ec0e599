//! Synchronization primitives.
//!
//! Provides thin wrappers over std or parking_lot locks and condition
//! variables, plus atomic counters for frame statistics.

pub mod atomics;
pub mod mutex;

pub use atomics::{AtomicCounter, HighWaterGauge};
pub use mutex::{Condvar, Mutex, MutexGuard, RwLock};
