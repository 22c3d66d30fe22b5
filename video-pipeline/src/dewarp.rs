//! Dewarp stage (spec §4.6): one NV12 frame plus an optional VSM
//! (video-stabilization-motion) vector goes through a DSP kernel and comes
//! out as one NV12 frame; passthrough when disabled.
//!
//! Grounded on `pipeline::Stage` (the `ci2-async::ThreadedAsyncCamera`
//! single-thread-per-stage shape) for the stage itself, with the kernel call
//! left as an opaque boundary the way the accelerator runtime is opaque
//! behind `AcceleratorBackend`.

use crate::error::{Error, Result};
use dma_frame::{BufferPool, Frame};
use pipeline::Stage;
use std::sync::Arc;

/// Video-stabilization motion vector applied by the dewarp kernel for one
/// frame (spec §4.6).
#[derive(Clone, Copy, Debug, Default)]
pub struct VsmVector {
    pub dx: f32,
    pub dy: f32,
}

/// Opaque DSP kernel invocation boundary (spec §2 component "the DSP
/// kernel"; out of scope per Non-goals beyond this call shape).
pub trait DspKernel: Send + Sync + 'static {
    fn dewarp(&self, input: &Frame, vsm: Option<VsmVector>, output: &Frame) -> Result<()>;
}

/// Copies planes byte-for-byte; stands in for a real kernel in tests and
/// wherever no hardware dewarp path is wired.
pub struct IdentityDspKernel;

impl DspKernel for IdentityDspKernel {
    fn dewarp(&self, input: &Frame, _vsm: Option<VsmVector>, output: &Frame) -> Result<()> {
        copy_planes(input, output)
    }
}

/// Shared by [`DspKernel`]'s identity impl and `resize`'s identity kernel.
pub(crate) fn copy_planes(input: &Frame, output: &Frame) -> Result<()> {
    if input.planes().len() != output.planes().len() {
        return Err(Error::InvalidArgument("plane count mismatch between kernel input and output".into()));
    }
    for (src, dst) in input.planes().iter().zip(output.planes().iter()) {
        src.with_bytes(|src_bytes| {
            dst.with_bytes_mut(|dst_bytes| {
                let n = src_bytes.len().min(dst_bytes.len());
                dst_bytes[..n].copy_from_slice(&src_bytes[..n]);
            });
        });
    }
    Ok(())
}

pub struct DewarpStage {
    enabled: bool,
    kernel: Arc<dyn DspKernel>,
    output_pool: Arc<BufferPool>,
    next_vsm: parking_lot::Mutex<Option<VsmVector>>,
}

impl DewarpStage {
    pub fn new(enabled: bool, kernel: Arc<dyn DspKernel>, output_pool: Arc<BufferPool>) -> Self {
        DewarpStage {
            enabled,
            kernel,
            output_pool,
            next_vsm: parking_lot::Mutex::new(None),
        }
    }

    /// Sets the VSM vector applied to the *next* processed frame (spec
    /// §4.6). Consumed (not re-used) by the following `process` call.
    pub fn set_vsm(&self, vsm: VsmVector) {
        *self.next_vsm.lock() = Some(vsm);
    }
}

impl Stage for DewarpStage {
    type Input = Frame;
    type Output = Frame;

    fn process(&mut self, input: Self::Input) -> Option<Self::Output> {
        if !self.enabled {
            return Some(input);
        }
        let vsm = self.next_vsm.lock().take();
        let output = match self.output_pool.acquire() {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(error = %e, "dewarp output pool exhausted, dropping frame");
                return None;
            }
        };
        if let Err(e) = self.kernel.dewarp(&input, vsm, &output) {
            tracing::error!(error = %e, "dewarp kernel invocation failed");
            return None;
        }
        Some(output)
    }

    fn name(&self) -> &str {
        "dewarp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_frame::{HeapDmaAllocator, MemoryKind, PixFmt, Resolution};

    fn nv12_pool() -> Arc<BufferPool> {
        let pool = BufferPool::new(
            "dewarp-test",
            Resolution::new(32, 16),
            PixFmt::Nv12,
            2,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        pool
    }

    #[test]
    fn disabled_stage_passes_the_same_frame_through() {
        let pool = nv12_pool();
        let mut stage = DewarpStage::new(false, Arc::new(IdentityDspKernel), pool.clone());
        let input = pool.acquire().unwrap();
        let input_fd = input.plane(0).unwrap().fd();
        let output = stage.process(input).unwrap();
        assert_eq!(output.plane(0).unwrap().fd(), input_fd);
    }

    #[test]
    fn enabled_stage_copies_bytes_into_a_fresh_buffer() {
        let pool = nv12_pool();
        let mut stage = DewarpStage::new(true, Arc::new(IdentityDspKernel), pool.clone());
        let input = pool.acquire().unwrap();
        input.plane(0).unwrap().with_bytes_mut(|b| b[0] = 0xAB);
        let input_fd = input.plane(0).unwrap().fd();

        let output = stage.process(input).unwrap();
        assert_ne!(output.plane(0).unwrap().fd(), input_fd);
        output.plane(0).unwrap().with_bytes(|b| assert_eq!(b[0], 0xAB));
    }
}
