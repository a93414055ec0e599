//! Page-based device memory pool.
//!
//! A pool allocates device memory in pages of at least `min_page_size`
//! bytes and sub-allocates from them with an [`IntervalAllocator`] per page.
//! Pages are never released before the pool itself is dropped.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

use super::interval::{Interval, IntervalAllocator};
use crate::dd_emit;
use crate::gpu::{DeviceMask, GpuDevice, GpuError};
use crate::sync::Mutex;
use crate::util::size::format_bytes;

/// One block of device memory and its free list.
struct PageAllocation {
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
    intervals: IntervalAllocator,
}

// SAFETY: the mapped pointer is owned by the page and only dereferenced
// through allocations carved out of disjoint ranges.
unsafe impl Send for PageAllocation {}

/// A memory pool for one memory type and device mask.
pub struct MemoryPool {
    gpu: Arc<dyn GpuDevice>,
    memory_type_index: u32,
    device_mask: DeviceMask,
    keep_mapped: bool,
    min_page_size: vk::DeviceSize,
    pages: Mutex<Vec<PageAllocation>>,
}

impl MemoryPool {
    /// Create an empty pool. Pages are allocated lazily.
    ///
    /// `keep_mapped` pools persistently map every page; the memory type
    /// must then be host visible.
    pub fn new(
        gpu: Arc<dyn GpuDevice>,
        memory_type_index: u32,
        device_mask: DeviceMask,
        keep_mapped: bool,
        min_page_size: vk::DeviceSize,
    ) -> Arc<Self> {
        Arc::new(Self {
            gpu,
            memory_type_index,
            device_mask,
            keep_mapped,
            min_page_size,
            pages: Mutex::new(Vec::new()),
        })
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn device_mask(&self) -> DeviceMask {
        self.device_mask
    }

    /// Number of pages allocated so far.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Sizes of all pages, in creation order.
    pub fn page_sizes(&self) -> Vec<vk::DeviceSize> {
        self.pages.lock().iter().map(|p| p.intervals.capacity()).collect()
    }

    /// Sub-allocate `size` bytes aligned to `alignment`.
    ///
    /// Scans pages in creation order and allocates a new page of
    /// `max(size, min_page_size)` bytes when none fits.
    pub fn alloc(self: &Arc<Self>, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Result<Allocation, GpuError> {
        let mut pages = self.pages.lock();

        for page in pages.iter_mut() {
            if let Some(offset) = page.intervals.request_interval(size, alignment) {
                return Ok(self.make_allocation(page, offset, size));
            }
        }

        let page_size = size.max(self.min_page_size);
        let memory = self
            .gpu
            .allocate_memory(page_size, self.memory_type_index, self.device_mask)?;
        let mapped = if self.keep_mapped {
            match self.gpu.map_memory(memory, page_size) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    self.gpu.free_memory(memory);
                    return Err(err);
                }
            }
        } else {
            None
        };
        log::info!(
            "New {} memory allocation: {}",
            if self.keep_mapped { "host" } else { "device" },
            format_bytes(page_size)
        );

        pages.push(PageAllocation {
            memory,
            mapped,
            intervals: IntervalAllocator::new(page_size),
        });
        let page = pages.last_mut().ok_or(GpuError::OutOfMemory)?;
        let offset = page
            .intervals
            .request_interval(size, alignment)
            .ok_or(GpuError::OutOfMemory)?;
        Ok(self.make_allocation(page, offset, size))
    }

    fn make_allocation(self: &Arc<Self>, page: &PageAllocation, offset: vk::DeviceSize, size: vk::DeviceSize) -> Allocation {
        // SAFETY: offset + size lies within the mapped page
        let mapped = page
            .mapped
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) });
        Allocation {
            pool: Some(Arc::clone(self)),
            memory: page.memory,
            offset,
            size,
            mapped,
        }
    }

    fn free_range(&self, memory: vk::DeviceMemory, offset: vk::DeviceSize, size: vk::DeviceSize) {
        let returned = {
            let mut pages = self.pages.lock();
            match pages.iter_mut().find(|p| p.memory == memory) {
                Some(page) => {
                    page.intervals.return_interval(Interval::new(offset, offset + size));
                    true
                }
                None => false,
            }
        };
        // emitted unlocked: a fatal diagnostic must not poison the page list
        if !returned {
            dd_emit!(DD003, "memory {:?}", memory);
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let pages = std::mem::take(&mut *self.pages.lock());
        for page in pages {
            // live allocations hold the pool, so only lost bookkeeping leaves ranges taken
            if cfg!(debug_assertions) && !page.intervals.is_fully_free() {
                dd_emit!(
                    DD002,
                    "{} of {} still allocated",
                    format_bytes(page.intervals.capacity() - page.intervals.free_bytes()),
                    format_bytes(page.intervals.capacity())
                );
            }
            if page.mapped.is_some() {
                self.gpu.unmap_memory(page.memory);
            }
            self.gpu.free_memory(page.memory);
        }
    }
}

/// A sub-allocation of a [`MemoryPool`].
///
/// Returned to its pool exactly once, by [`free`](Allocation::free) or on
/// drop. A freed allocation is empty.
pub struct Allocation {
    pool: Option<Arc<MemoryPool>>,
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped range is exclusively owned by this allocation.
unsafe impl Send for Allocation {}

// SAFETY: shared access only reads the pointer value. Writing through it
// takes `&mut self`.
unsafe impl Sync for Allocation {}

impl Allocation {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_none()
    }

    /// Host pointer to the start of this allocation, for mapped pools.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Copy `data` to the start of a mapped allocation.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), GpuError> {
        let ptr = self
            .mapped
            .ok_or_else(|| GpuError::Device("allocation is not host mapped".to_string()))?;
        if data.len() as vk::DeviceSize > self.size {
            return Err(GpuError::Device(format!(
                "write of {} bytes into allocation of {}",
                data.len(),
                self.size
            )));
        }
        // SAFETY: mapped range of `size` bytes owned by this allocation
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
        Ok(())
    }

    /// Return the range to its pool. Idempotent.
    pub fn free(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.free_range(self.memory, self.offset, self.size);
            self.memory = vk::DeviceMemory::null();
            self.offset = 0;
            self.size = 0;
            self.mapped = None;
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DummyDevice;
    use crate::util::size::{kb, mb};

    fn host_pool(gpu: &Arc<DummyDevice>, page: vk::DeviceSize) -> Arc<MemoryPool> {
        MemoryPool::new(gpu.clone(), 1, DeviceMask::none(), true, page)
    }

    #[test]
    fn test_second_page_when_first_is_full() {
        let gpu = Arc::new(DummyDevice::new(1));
        let pool = host_pool(&gpu, mb(1));

        let a = pool.alloc(kb(600), 1).unwrap();
        assert_eq!(pool.page_count(), 1);
        let b = pool.alloc(kb(600), 1).unwrap();
        assert_eq!(pool.page_count(), 2);
        assert_ne!(a.memory(), b.memory());
        assert_eq!(pool.page_sizes(), vec![mb(1), mb(1)]);
    }

    #[test]
    fn test_oversized_request_gets_exact_page() {
        let gpu = Arc::new(DummyDevice::new(1));
        let pool = host_pool(&gpu, mb(1));

        let big = pool.alloc(mb(3) + 5, 1).unwrap();
        assert_eq!(gpu.memory_size(big.memory()), Some(mb(3) + 5));
        assert_eq!(pool.page_sizes(), vec![mb(3) + 5]);
    }

    #[test]
    fn test_freed_space_is_reused_without_new_page() {
        let gpu = Arc::new(DummyDevice::new(1));
        let pool = host_pool(&gpu, mb(1));

        let mut a = pool.alloc(kb(600), 256).unwrap();
        a.free();
        assert!(a.is_empty());
        a.free();

        let b = pool.alloc(kb(900), 256).unwrap();
        assert_eq!(pool.page_count(), 1);
        assert_eq!(b.offset(), 0);
    }

    #[test]
    fn test_allocations_are_aligned_and_mapped() {
        let gpu = Arc::new(DummyDevice::new(1));
        let pool = host_pool(&gpu, kb(64));

        let _a = pool.alloc(3, 1).unwrap();
        let mut b = pool.alloc(16, 256).unwrap();
        assert_eq!(b.offset(), 256);
        b.write_bytes(&[7u8; 16]).unwrap();
        assert!(b.write_bytes(&[0u8; 17]).is_err());

        let base = b.mapped_ptr().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(base.as_ptr(), 16) };
        assert_eq!(bytes, &[7u8; 16]);
    }

    #[test]
    fn test_device_pool_is_not_mapped_and_uses_mask() {
        let gpu = Arc::new(DummyDevice::new(2));
        let pool = MemoryPool::new(gpu.clone(), 0, DeviceMask::of_single_device(1), false, kb(64));

        let mut a = pool.alloc(128, 16).unwrap();
        assert!(a.mapped_ptr().is_none());
        assert!(a.write_bytes(&[1]).is_err());
        assert_eq!(gpu.memory_info(a.memory()), Some((0, DeviceMask::of_single_device(1))));
    }

    #[test]
    fn test_pool_drop_releases_pages() {
        let gpu = Arc::new(DummyDevice::new(1));
        {
            let pool = host_pool(&gpu, kb(64));
            let a = pool.alloc(100, 1).unwrap();
            drop(a);
            assert_eq!(gpu.live_objects().memory, 1);
        }
        assert_eq!(gpu.live_objects().memory, 0);
        assert!(gpu.validation_errors().is_empty());
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_allocation_is_send_and_sync() {
        assert_send_sync::<Allocation>();
        assert_send_sync::<MemoryPool>();
    }

    #[test]
    fn test_unknown_page_does_not_poison_pool() {
        use std::panic::{self, AssertUnwindSafe};

        use ash::vk::Handle;

        use crate::diagnostics::{set_thread_sink, PanickingSink};

        let gpu = Arc::new(DummyDevice::new(1));
        let pool = host_pool(&gpu, kb(64));
        let _live = pool.alloc(64, 1).unwrap();
        let foreign = Allocation {
            pool: Some(pool.clone()),
            memory: vk::DeviceMemory::from_raw(0xdead),
            offset: 0,
            size: 64,
            mapped: None,
        };

        let previous = set_thread_sink(Some(Arc::new(PanickingSink)));
        let fatal = panic::catch_unwind(AssertUnwindSafe(move || drop(foreign)));
        set_thread_sink(previous);
        assert!(fatal.is_err());

        // the page list is still usable after the fatal diagnostic
        let next = pool.alloc(64, 1).unwrap();
        assert_eq!(next.offset(), 64);
        assert_eq!(pool.page_count(), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_lost_range_reported_on_drop() {
        use crate::diagnostics::{set_thread_sink, CollectingSink};

        let gpu = Arc::new(DummyDevice::new(1));
        let pool = host_pool(&gpu, kb(64));
        drop(pool.alloc(64, 1).unwrap());
        // a range taken behind the back of every allocation
        pool.pages.lock()[0].intervals.request_interval(128, 1).unwrap();

        let sink = Arc::new(CollectingSink::new());
        let previous = set_thread_sink(Some(sink.clone()));
        drop(pool);
        set_thread_sink(previous);

        assert_eq!(sink.codes(), vec!["DD002"]);
        assert_eq!(gpu.live_objects().memory, 0);
    }
}
