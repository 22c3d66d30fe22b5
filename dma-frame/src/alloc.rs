//! DMA heap allocator abstraction (spec §6: "DMA heap: a path string
//! (platform-specific); allocator opens it and allocates contiguous
//! DMA-FD-backed buffers.")
//!
//! Real hardware backends implement [`DmaAllocator`] against a platform DMA
//! heap (e.g. `/dev/dma_heap/linux,cma`); [`HeapDmaAllocator`] here is the
//! in-process reference implementation used by tests and by the reference
//! `video-pipelined` binary when no platform heap is wired up.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// A file descriptor naming a DMA-backed memory region (spec glossary: "DMA-FD").
pub type RawFd = i32;

/// One allocation: a DMA-FD handle plus the CPU-visible backing storage.
pub struct DmaAlloc {
    pub fd: RawFd,
    pub bytes: Arc<Mutex<Box<[u8]>>>,
}

/// Opens a DMA heap and allocates contiguous, DMA-FD-backed buffers from it.
pub trait DmaAllocator: Send + Sync {
    /// Allocate one contiguous buffer of `size` bytes.
    fn allocate(&self, size: usize) -> Result<DmaAlloc>;

    /// Release a previously allocated buffer. Implementations that rely on
    /// `Drop`/refcounting for the underlying OS resource may no-op here.
    fn free(&self, _alloc: &DmaAlloc) -> Result<()> {
        Ok(())
    }
}

/// Reference [`DmaAllocator`] backed by process heap memory, identified by a
/// monotonically increasing synthetic fd. Suitable for tests and for
/// platforms without a real DMA heap; production backends should implement
/// [`DmaAllocator`] against `/dev/dma_heap/*` (or the platform equivalent)
/// named by `heap_path`.
pub struct HeapDmaAllocator {
    heap_path: String,
    next_fd: AtomicI32,
}

impl HeapDmaAllocator {
    pub fn new(heap_path: impl Into<String>) -> Self {
        HeapDmaAllocator {
            heap_path: heap_path.into(),
            // Start above stdio fds so synthetic values look plausible in logs.
            next_fd: AtomicI32::new(64),
        }
    }

    pub fn heap_path(&self) -> &str {
        &self.heap_path
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate(&self, size: usize) -> Result<DmaAlloc> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized DMA allocation".into()));
        }
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let bytes = vec![0u8; size].into_boxed_slice();
        Ok(DmaAlloc {
            fd,
            bytes: Arc::new(Mutex::new(bytes)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_get_distinct_fds() {
        let alloc = HeapDmaAllocator::new("/dev/dma_heap/linux,cma");
        let a = alloc.allocate(16).unwrap();
        let b = alloc.allocate(16).unwrap();
        assert_ne!(a.fd, b.fd);
    }

    #[test]
    fn zero_size_is_rejected() {
        let alloc = HeapDmaAllocator::new("/dev/dma_heap/linux,cma");
        assert!(alloc.allocate(0).is_err());
    }
}
