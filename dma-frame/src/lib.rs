//! Reference-counted DMA-backed frame buffers and bucketed buffer pools
//! (spec §3 "Data Model", §4.1 "Buffer Pool").

mod alloc;
mod bucket;
mod error;
mod frame;
mod pool;

pub use alloc::{DmaAlloc, DmaAllocator, HeapDmaAllocator, RawFd};
pub use error::{Error, Result};
pub use frame::{AeInfo, BBox, Frame, MetadataValue, Plane, Rect, TensorMeta};
pub use pool::{BufferPool, WeakBufferPool};

pub use frame_formats::{BayerPacking, CfaChannel, CfaPattern, MemoryKind, PixFmt, PlaneKind, Resolution};
