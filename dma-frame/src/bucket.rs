//! A single-plane-kind allocation bucket (spec §3 "Bucket / Pool", §4.1).
//!
//! Grounded on `original_source/media_library/src/buffer_pool/buffer_pool.cpp`'s
//! `HailoBucket`: a deque of available slots, a set of in-use ids, one mutex.

use crate::alloc::{DmaAllocator, RawFd};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// One allocated plane slot, identified by a pool-unique id for tracing.
#[derive(Clone)]
pub(crate) struct Slot {
    pub id: u64,
    pub fd: RawFd,
    pub bytes: Arc<Mutex<Box<[u8]>>>,
}

struct BucketInner {
    buffer_size: usize,
    capacity: usize,
    available: VecDeque<Slot>,
    used: HashSet<u64>,
}

/// Bucketed allocator for one plane kind (e.g. NV12's Y plane, or NV12's UV
/// plane) within a [`crate::pool::BufferPool`].
///
/// Invariant (spec §8.1): `available.len() + used.len() == capacity` at
/// every instant once the bucket has been initialized.
pub struct Bucket {
    inner: Mutex<BucketInner>,
}

impl Bucket {
    pub(crate) fn new(buffer_size: usize, capacity: usize) -> Self {
        Bucket {
            inner: Mutex::new(BucketInner {
                buffer_size,
                capacity,
                available: VecDeque::with_capacity(capacity),
                used: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Pre-allocate every slot up front (spec §4.1: "`init()` pre-allocates
    /// all buckets").
    pub(crate) fn allocate_all(&self, allocator: &dyn DmaAllocator, next_id: &mut u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let to_allocate = inner.capacity.saturating_sub(inner.available.len() + inner.used.len());
        for _ in 0..to_allocate {
            let alloc = allocator.allocate(inner.buffer_size)?;
            let id = *next_id;
            *next_id += 1;
            inner.available.push_back(Slot {
                id,
                fd: alloc.fd,
                bytes: alloc.bytes,
            });
        }
        Ok(())
    }

    /// Acquire one slot. Fails immediately (never blocks) when empty, per
    /// spec §4.1: callers choose whether to wait or drop.
    pub(crate) fn acquire(&self) -> Result<Slot> {
        let mut inner = self.inner.lock();
        match inner.available.pop_front() {
            Some(slot) => {
                inner.used.insert(slot.id);
                Ok(slot)
            }
            None => Err(Error::BufferAllocationError(format!(
                "bucket exhausted: capacity={}, used={}",
                inner.capacity,
                inner.used.len()
            ))),
        }
    }

    /// Return a slot acquired earlier back to `available`.
    pub(crate) fn release(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        if inner.used.remove(&slot.id) {
            inner.available.push_front(slot);
        } else {
            tracing::warn!(slot_id = slot.id, "release of slot not marked used");
        }
    }

    /// Undo a partially-completed multi-bucket acquire (spec §4.1 NV12
    /// rollback contract): put a slot straight back as if it had never left
    /// `available`, without requiring it to have been marked `used` first.
    pub(crate) fn rollback(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        inner.used.remove(&slot.id);
        inner.available.push_front(slot);
    }

    pub(crate) fn used_count(&self) -> usize {
        self.inner.lock().used.len()
    }

    pub(crate) fn available_count(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Free all allocated slots. Fails if buffers are still in use and
    /// `fail_if_used` is set; otherwise reclaims them anyway (spec §4.1:
    /// "destruction fails (or, if forced, reclaims) when `used` is
    /// non-empty").
    pub(crate) fn free(&self, allocator: &dyn DmaAllocator, fail_if_used: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.used.is_empty() {
            if fail_if_used {
                return Err(Error::BufferAllocationError(format!(
                    "{} buffers still in use",
                    inner.used.len()
                )));
            }
            tracing::warn!(used = inner.used.len(), "freeing bucket with buffers still in use");
            inner.used.clear();
        }
        while let Some(slot) = inner.available.pop_front() {
            let _ = allocator.free(&crate::alloc::DmaAlloc {
                fd: slot.fd,
                bytes: slot.bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapDmaAllocator;

    #[test]
    fn acquire_fails_immediately_when_empty() {
        let bucket = Bucket::new(16, 1);
        let allocator = HeapDmaAllocator::new("/tmp");
        let mut next_id = 0;
        bucket.allocate_all(&allocator, &mut next_id).unwrap();
        let slot = bucket.acquire().unwrap();
        assert!(bucket.acquire().is_err());
        bucket.release(slot);
        assert!(bucket.acquire().is_ok());
    }

    #[test]
    fn capacity_invariant_holds() {
        let bucket = Bucket::new(16, 4);
        let allocator = HeapDmaAllocator::new("/tmp");
        let mut next_id = 0;
        bucket.allocate_all(&allocator, &mut next_id).unwrap();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(bucket.acquire().unwrap());
        }
        assert_eq!(bucket.used_count() + bucket.available_count(), 4);
        for slot in held {
            bucket.release(slot);
        }
        assert_eq!(bucket.used_count() + bucket.available_count(), 4);
        assert_eq!(bucket.available_count(), 4);
    }
}
