//! Bucketed DMA buffer pool (spec §3 "Bucket / Pool", §4.1 "Buffer Pool").
//!
//! Grounded on `original_source/media_library/include/media_library/buffer_pool.hpp`
//! (`MediaLibraryBufferPool`): one [`Bucket`] per plane kind, a pool-wide
//! buffer-index counter for tracing, and a condvar used by
//! [`BufferPool::wait_for_used_buffers`].

use crate::alloc::DmaAllocator;
use crate::bucket::Bucket;
use crate::error::{Error, Result};
use crate::frame::{Frame, Plane};
use frame_formats::{MemoryKind, PixFmt, PlaneKind, Resolution};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct PlaneLayout {
    kind: PlaneKind,
    bytes_per_line: usize,
    bytes_used: usize,
}

/// A pool of DMA-backed buffers of one fixed shape (spec §4.1).
///
/// One [`Bucket`] is held per plane kind the pool's [`PixFmt`] needs (e.g.
/// NV12 gets a Y bucket and a UV bucket), so acquiring a frame draws one
/// slot from each bucket atomically from the pool's point of view: if a
/// later bucket is exhausted, slots already drawn from earlier buckets are
/// rolled back before returning failure (spec §4.1).
pub struct BufferPool {
    name: String,
    format: PixFmt,
    resolution: Mutex<Resolution>,
    bytes_per_line: usize,
    capacity: usize,
    memory_kind: MemoryKind,
    allocator: Arc<dyn DmaAllocator>,
    buckets: Vec<Bucket>,
    plane_layouts: Vec<PlaneLayout>,
    buffer_index: AtomicU64,
    next_slot_id: Mutex<u64>,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
}

impl BufferPool {
    /// Construct a pool. Call [`BufferPool::init`] before first use; no
    /// buffers are allocated until then (spec §4.1).
    pub fn new(
        name: impl Into<String>,
        resolution: Resolution,
        format: PixFmt,
        capacity: usize,
        memory_kind: MemoryKind,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Arc<Self> {
        let bytes_per_line = resolution.width as usize;
        let plane_layouts: Vec<PlaneLayout> = format
            .planes()
            .iter()
            .map(|&kind| {
                let (bpl, used) = match kind {
                    PlaneKind::Luma | PlaneKind::Bayer => {
                        (bytes_per_line, bytes_per_line * resolution.height as usize)
                    }
                    PlaneKind::Chroma => (
                        bytes_per_line,
                        bytes_per_line * (resolution.height as usize / 2),
                    ),
                };
                PlaneLayout {
                    kind,
                    bytes_per_line: bpl,
                    bytes_used: used,
                }
            })
            .collect();

        let buckets = plane_layouts
            .iter()
            .map(|layout| Bucket::new(layout.bytes_used, capacity))
            .collect();

        Arc::new(BufferPool {
            name: name.into(),
            format,
            resolution: Mutex::new(resolution),
            bytes_per_line,
            capacity,
            memory_kind,
            allocator,
            buckets,
            plane_layouts,
            buffer_index: AtomicU64::new(0),
            next_slot_id: Mutex::new(0),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolution(&self) -> Resolution {
        *self.resolution.lock()
    }

    /// Pre-allocate every bucket up front (spec §4.1).
    pub fn init(&self) -> Result<()> {
        let mut next_id = self.next_slot_id.lock();
        for bucket in &self.buckets {
            bucket.allocate_all(self.allocator.as_ref(), &mut next_id)?;
        }
        Ok(())
    }

    /// Acquire one frame's worth of planes. Never blocks: fails with
    /// [`Error::BufferAllocationError`] the instant any bucket is empty,
    /// rolling back plane slots already drawn from earlier buckets in this
    /// same acquire (spec §4.1 NV12 atomicity contract).
    pub fn acquire(self: &Arc<Self>) -> Result<Frame> {
        let mut index = self.buffer_index.fetch_add(1, Ordering::Relaxed) + 1;
        if index > self.capacity as u64 {
            // Wrap the tracing index, not the actual bucket capacity.
            index = ((index - 1) % self.capacity as u64) + 1;
            self.buffer_index.store(index, Ordering::Relaxed);
        }

        let mut drawn = Vec::with_capacity(self.buckets.len());
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            match bucket.acquire() {
                Ok(slot) => drawn.push((bucket_index, slot)),
                Err(e) => {
                    for (idx, slot) in drawn {
                        self.buckets[idx].rollback(slot);
                    }
                    return Err(e);
                }
            }
        }

        let planes: Vec<Plane> = drawn
            .into_iter()
            .map(|(bucket_index, slot)| {
                let layout = &self.plane_layouts[bucket_index];
                Plane::new_pool_owned(
                    slot,
                    bucket_index,
                    Arc::downgrade(self),
                    layout.bytes_per_line,
                    layout.bytes_used,
                )
            })
            .collect();

        let resolution = self.resolution();
        Ok(Frame::new(
            resolution.width,
            resolution.height,
            self.format,
            self.memory_kind,
            index,
            planes,
        ))
    }

    pub(crate) fn release_slot(&self, bucket_index: usize, slot: crate::bucket::Slot) {
        if let Some(bucket) = self.buckets.get(bucket_index) {
            bucket.release(slot);
        }
        self.drain_cv.notify_all();
    }

    /// Block until every bucket has drained to zero in-use buffers, or the
    /// timeout elapses (spec §4.1, §4.4.3 "bounded wait").
    pub fn wait_for_used_buffers(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.drain_lock.lock();
        loop {
            if self.buckets.iter().all(|b| b.used_count() == 0) {
                return Ok(());
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::MediaLibraryError(format!(
                    "{}: timeout waiting for used buffers to drain",
                    self.name
                )));
            }
            let remaining = deadline - now;
            let timed_out = self.drain_cv.wait_for(&mut guard, remaining).timed_out();
            if timed_out && !self.buckets.iter().all(|b| b.used_count() == 0) {
                return Err(Error::MediaLibraryError(format!(
                    "{}: timeout waiting for used buffers to drain",
                    self.name
                )));
            }
        }
    }

    /// Total in-use plane slots across all buckets, for diagnostics/tests.
    pub fn used_count(&self) -> usize {
        self.buckets.iter().map(|b| b.used_count()).sum()
    }

    pub fn available_count(&self) -> usize {
        self.buckets.iter().map(|b| b.available_count()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_per_line(&self) -> usize {
        self.bytes_per_line
    }

    /// Deallocate every bucket. Fails (without reclaiming) if
    /// `fail_if_used` is set and buffers are still in use; otherwise
    /// reclaims unconditionally (spec §4.1).
    pub fn free(&self, fail_if_used: bool) -> Result<()> {
        for bucket in &self.buckets {
            bucket.free(self.allocator.as_ref(), fail_if_used)?;
        }
        Ok(())
    }
}

/// Weak handle to a pool, for callers that need to check liveness without
/// keeping it allocated (e.g. denoise loopback bookkeeping).
pub type WeakBufferPool = Weak<BufferPool>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapDmaAllocator;

    fn nv12_pool(capacity: usize) -> Arc<BufferPool> {
        let allocator = Arc::new(HeapDmaAllocator::new("/dev/dma_heap/linux,cma"));
        let pool = BufferPool::new(
            "test-nv12",
            Resolution::new(64, 32),
            PixFmt::Nv12,
            capacity,
            MemoryKind::DmaBuf,
            allocator,
        );
        pool.init().unwrap();
        pool
    }

    #[test]
    fn exhaustion_fails_immediately_without_blocking() {
        let pool = nv12_pool(4);
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.acquire().unwrap());
        }
        assert!(matches!(pool.acquire(), Err(Error::BufferAllocationError(_))));
        drop(held.pop());
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn pool_capacity_invariant_holds_under_churn() {
        let pool = nv12_pool(4);
        for _ in 0..20 {
            let frame = pool.acquire().unwrap();
            assert_eq!(pool.used_count() + pool.available_count(), 8); // 2 planes * capacity 4
            drop(frame);
        }
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn releasing_a_frame_drains_the_pool() {
        let pool = nv12_pool(2);
        let frame = pool.acquire().unwrap();
        assert_eq!(pool.used_count(), 2);
        drop(frame);
        pool.wait_for_used_buffers(Duration::from_millis(200)).unwrap();
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn buffer_index_wraps_modulo_capacity() {
        let pool = nv12_pool(2);
        let mut seen = Vec::new();
        for _ in 0..5 {
            let f = pool.acquire().unwrap();
            seen.push(f.buffer_index);
        }
        assert!(seen.iter().all(|&i| i >= 1 && i <= 2));
    }
}
