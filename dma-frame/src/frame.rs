//! Reference-counted DMA frame (spec §3 "Frame buffer").
//!
//! Each plane's lifetime is tracked by an `Arc<PlaneGuard>`: cloning a
//! [`Plane`] (which happens whenever a [`Frame`] is cloned, fanned out to a
//! subscriber, or captured inside a metadata link) increments the plane's
//! logical refcount exactly the way spec §3 describes ("incremented on each
//! downstream subscription / each stored reference"); the plane's storage
//! returns to its owner pool (or its free-callback fires) the instant the
//! last clone drops. This realizes spec §9's note on cyclic ownership: "do
//! not model as bidirectional ownership — model it as a lifetime extension
//! via refcount" using `Drop` instead of manual increment/decrement calls.

use crate::bucket::Slot;
use crate::pool::BufferPool;
use frame_formats::{MemoryKind, PixFmt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// What happens when a plane's last reference drops.
enum PlaneRelease {
    /// Return the slot to the owning pool's bucket.
    Pool { pool: Weak<BufferPool>, bucket_index: usize },
    /// Invoke an opaque free callback (spec §4.4.5 / §9: "a free-callback
    /// closure to requeue on final decrement"), e.g. to requeue a raw V4L2
    /// capture buffer.
    Callback(Arc<dyn Fn() + Send + Sync>),
    /// No release action (standalone/test planes not owned by anything).
    None,
}

struct PlaneGuard {
    slot: Mutex<Option<Slot>>,
    release: PlaneRelease,
}

impl Drop for PlaneGuard {
    fn drop(&mut self) {
        let slot = match self.slot.lock().take() {
            Some(slot) => slot,
            None => return,
        };
        match &self.release {
            PlaneRelease::Pool { pool, bucket_index } => {
                if let Some(pool) = pool.upgrade() {
                    pool.release_slot(*bucket_index, slot);
                }
                // If the pool is already gone, the storage is simply dropped.
            }
            PlaneRelease::Callback(cb) => cb(),
            PlaneRelease::None => {}
        }
    }
}

/// One DMA-backed plane of a [`Frame`], reference counted independently of
/// its siblings.
#[derive(Clone)]
pub struct Plane {
    guard: Arc<PlaneGuard>,
    fd: i32,
    pub bytes_per_line: usize,
    pub bytes_used: usize,
}

impl Plane {
    pub(crate) fn new_pool_owned(
        slot: Slot,
        bucket_index: usize,
        pool: Weak<BufferPool>,
        bytes_per_line: usize,
        bytes_used: usize,
    ) -> Self {
        Plane {
            fd: slot.fd,
            guard: Arc::new(PlaneGuard {
                slot: Mutex::new(Some(slot)),
                release: PlaneRelease::Pool { pool, bucket_index },
            }),
            bytes_per_line,
            bytes_used,
        }
    }

    pub fn new_external(
        slot: Slot,
        bytes_per_line: usize,
        bytes_used: usize,
        on_free: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Plane {
            fd: slot.fd,
            guard: Arc::new(PlaneGuard {
                slot: Mutex::new(Some(slot)),
                release: PlaneRelease::Callback(on_free),
            }),
            bytes_per_line,
            bytes_used,
        }
    }

    /// DMA-FD naming this plane's backing memory.
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Current logical refcount: the number of live [`Plane`] handles
    /// (including this one) that keep the plane's storage alive.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.guard)
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.guard.slot.lock();
        let slot = guard.as_ref().expect("plane used after release");
        let bytes = slot.bytes.lock();
        f(&bytes)
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let guard = self.guard.slot.lock();
        let slot = guard.as_ref().expect("plane used after release");
        let mut bytes = slot.bytes.lock();
        f(&mut bytes)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AeInfo {
    pub fps: f64,
    pub luma: f64,
    pub integration_time_us: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct BBox {
    pub rect: Rect,
    pub score: f32,
    pub class_id: u32,
}

#[derive(Clone, Debug)]
pub struct TensorMeta {
    pub name: String,
    pub shape: Vec<u32>,
}

/// Tagged union of metadata a frame can carry (spec §3 "Metadata").
///
/// `ParentFrame` is how a metadata entry extends a source frame's lifetime
/// without owning it outright: it simply holds a [`Frame`] clone, whose
/// `Plane` guards keep the parent's storage alive until this metadata entry
/// (and every other holder) is gone.
#[derive(Clone)]
pub enum MetadataValue {
    BBoxList(Vec<BBox>),
    CropRegion(Rect),
    ExpectedCrops(u32),
    Tensor(TensorMeta),
    Batch(Vec<Frame>),
    ParentFrame(Frame),
}

#[derive(Default)]
struct MetadataMap(HashMap<&'static str, MetadataValue>);

/// A frame: one or more DMA-backed planes plus a metadata bag (spec §3).
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixFmt,
    pub memory_kind: MemoryKind,
    /// Buffer index counter stamped by the owning pool, mod its capacity,
    /// for tracing (spec §4.1).
    pub buffer_index: u64,
    pub isp_timestamp_ns: u64,
    pub ae: AeInfo,
    planes: Vec<Plane>,
    metadata: Arc<Mutex<MetadataMap>>,
}

impl Frame {
    pub(crate) fn new(
        width: u32,
        height: u32,
        format: PixFmt,
        memory_kind: MemoryKind,
        buffer_index: u64,
        planes: Vec<Plane>,
    ) -> Self {
        Frame {
            width,
            height,
            format,
            memory_kind,
            buffer_index,
            isp_timestamp_ns: 0,
            ae: AeInfo::default(),
            planes,
            metadata: Arc::new(Mutex::new(MetadataMap::default())),
        }
    }

    /// Construct a frame wrapping an externally-owned (e.g. V4L2 mmap)
    /// buffer rather than a pool allocation (spec §3 "zero-copy wrapper").
    pub fn from_external(
        width: u32,
        height: u32,
        format: PixFmt,
        memory_kind: MemoryKind,
        plane: Plane,
    ) -> Self {
        Frame::new(width, height, format, memory_kind, 0, vec![plane])
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    pub fn plane_refcount(&self, index: usize) -> usize {
        self.planes.get(index).map(|p| p.refcount()).unwrap_or(0)
    }

    /// True once every plane's refcount has dropped to zero, i.e. once this
    /// is the sole remaining handle and it is about to be dropped (spec §3
    /// invariant: "A frame is destroyed when *every* plane's refcount is
    /// zero.").
    pub fn is_sole_owner(&self) -> bool {
        self.planes.iter().all(|p| p.refcount() == 1)
    }

    pub fn attach_metadata(&self, key: &'static str, value: MetadataValue) {
        self.metadata.lock().0.insert(key, value);
    }

    pub fn metadata(&self, key: &str) -> Option<MetadataValue> {
        self.metadata.lock().0.get(key).cloned()
    }

    pub fn remove_metadata(&self, key: &str) -> Option<MetadataValue> {
        self.metadata.lock().0.remove(key)
    }

    pub fn metadata_keys(&self) -> Vec<&'static str> {
        self.metadata.lock().0.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapDmaAllocator;
    use crate::bucket::Slot;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dummy_slot(id: u64) -> Slot {
        let alloc = HeapDmaAllocator::new("/tmp").allocate(16).unwrap();
        Slot {
            id,
            fd: alloc.fd,
            bytes: alloc.bytes,
        }
    }

    #[test]
    fn cloning_a_plane_increments_refcount() {
        let plane = Plane::new_external(dummy_slot(1), 16, 16, Arc::new(|| {}));
        assert_eq!(plane.refcount(), 1);
        let plane2 = plane.clone();
        assert_eq!(plane.refcount(), 2);
        drop(plane2);
        assert_eq!(plane.refcount(), 1);
    }

    #[test]
    fn final_drop_invokes_free_callback_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let plane = Plane::new_external(dummy_slot(2), 16, 16, Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        let plane2 = plane.clone();
        drop(plane);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "callback must not fire while a clone is alive");
        drop(plane2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metadata_parent_link_extends_lifetime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let plane = Plane::new_external(dummy_slot(3), 16, 16, Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        }));
        let frame = Frame::new(64, 64, PixFmt::Gray8, MemoryKind::DmaBuf, 0, vec![plane]);

        let other = Frame::new(1, 1, PixFmt::Gray8, MemoryKind::DmaBuf, 0, vec![]);
        other.attach_metadata("parent", MetadataValue::ParentFrame(frame.clone()));
        drop(frame);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "metadata link must keep parent planes alive");
        drop(other);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
