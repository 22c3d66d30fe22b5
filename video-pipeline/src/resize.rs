//! Multi-resize stage (spec §4.6): fans one NV12 input into N configured
//! NV12 outputs, each with its own resolution and framerate, honoring
//! per-output framerate thinning (never emits faster than configured, skips
//! frames when the target fps is lower than source).

use crate::config::Resolution as OutputResolution;
use crate::dewarp::copy_planes;
use crate::error::Result;
use dma_frame::{BufferPool, Frame, HeapDmaAllocator, MemoryKind, PixFmt};
use pipeline::Stage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait ResizeKernel: Send + Sync + 'static {
    fn resize(&self, input: &Frame, output: &Frame) -> Result<()>;
}

/// Stands in for a real DSP resize kernel: copies planes unchanged (tests
/// only exercise framerate thinning and pool plumbing, not actual scaling).
pub struct IdentityResizeKernel;

impl ResizeKernel for IdentityResizeKernel {
    fn resize(&self, input: &Frame, output: &Frame) -> Result<()> {
        copy_planes(input, output)
    }
}

/// One configured output: its own buffer pool and a framerate-thinning
/// counter (spec §4.6).
pub struct ResizeOutput {
    name: String,
    pool: Arc<BufferPool>,
    source_framerate: u32,
    target_framerate: u32,
    due: AtomicU64,
    seen: AtomicU64,
}

impl ResizeOutput {
    pub fn new(name: impl Into<String>, resolution: OutputResolution, source_framerate: u32, dma_heap_path: &str) -> Self {
        let name = name.into();
        let allocator = Arc::new(HeapDmaAllocator::new(dma_heap_path));
        let pool = BufferPool::new(
            name.clone(),
            dma_frame::Resolution::new(resolution.width, resolution.height),
            PixFmt::Nv12,
            4,
            MemoryKind::DmaBuf,
            allocator,
        );
        ResizeOutput {
            name,
            pool,
            source_framerate: source_framerate.max(1),
            target_framerate: resolution.framerate.max(1),
            due: AtomicU64::new(0),
            seen: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self) -> Result<()> {
        self.pool.init().map_err(Into::into)
    }

    /// True if this output's thinning ratio wants the current source frame
    /// emitted. Tracks a running Bresenham-style "owed" count so thinning
    /// stays evenly spaced rather than bursty.
    fn wants_frame(&self) -> bool {
        if self.target_framerate >= self.source_framerate {
            return true;
        }
        let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        let owed = (seen * self.target_framerate as u64) / self.source_framerate as u64;
        let emitted_so_far = self.due.load(Ordering::SeqCst);
        if owed > emitted_so_far {
            self.due.store(owed, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

/// One resized frame destined for one named output, emitted by
/// [`MultiResizeStage`] and demultiplexed by whatever wires its subscriber
/// up to each output's downstream consumer.
#[derive(Clone)]
pub struct ResizedFrame {
    pub output_name: String,
    pub frame: Frame,
}

pub struct MultiResizeStage {
    kernel: Arc<dyn ResizeKernel>,
    outputs: Vec<ResizeOutput>,
}

impl MultiResizeStage {
    pub fn new(kernel: Arc<dyn ResizeKernel>, outputs: Vec<ResizeOutput>) -> Self {
        MultiResizeStage { kernel, outputs }
    }
}

impl Stage for MultiResizeStage {
    type Input = Frame;
    type Output = Vec<ResizedFrame>;

    fn process(&mut self, input: Self::Input) -> Option<Self::Output> {
        let mut results = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            if !output.wants_frame() {
                continue;
            }
            let frame = match output.pool.acquire() {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(output = %output.name, error = %e, "resize output pool exhausted, dropping frame");
                    continue;
                }
            };
            if let Err(e) = self.kernel.resize(&input, &frame) {
                tracing::error!(output = %output.name, error = %e, "resize kernel invocation failed");
                continue;
            }
            results.push(ResizedFrame { output_name: output.name.clone(), frame });
        }
        if results.is_empty() {
            None
        } else {
            Some(results)
        }
    }

    fn name(&self) -> &str {
        "multi-resize"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(name: &str, framerate: u32, source_framerate: u32) -> ResizeOutput {
        let out = ResizeOutput::new(
            name,
            OutputResolution { width: 1280, height: 720, framerate },
            source_framerate,
            "/tmp",
        );
        out.init().unwrap();
        out
    }

    fn input_frame() -> Frame {
        let pool = BufferPool::new(
            "resize-test-src",
            dma_frame::Resolution::new(3840, 2160),
            PixFmt::Nv12,
            2,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        pool.acquire().unwrap()
    }

    #[test]
    fn fans_out_to_every_output_at_matching_framerate() {
        let mut stage = MultiResizeStage::new(
            Arc::new(IdentityResizeKernel),
            vec![output("main", 30, 30), output("sub", 30, 30)],
        );
        let results = stage.process(input_frame()).unwrap();
        let names: Vec<_> = results.iter().map(|r| r.output_name.clone()).collect();
        assert_eq!(names, vec!["main", "sub"]);
    }

    #[test]
    fn thins_output_running_at_half_the_source_framerate() {
        let mut stage = MultiResizeStage::new(Arc::new(IdentityResizeKernel), vec![output("half", 15, 30)]);
        let mut emitted = 0;
        for _ in 0..30 {
            if stage.process(input_frame()).is_some() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 15);
    }
}
