//! Shared loopback state machine and engine scaffolding for both denoise
//! variants (spec §4.4.3 "Loopback state machine", §9 "tagged variants of an
//! inference-binding builder interface").

use crate::error::{Error, Result};
use accel_rt::{AcceleratorBackend, AsyncInferenceBinding, NetworkBindings};
use dma_frame::{BufferPool, Frame};
use pipeline::{Queue, QueuePolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Depth bound `Q` for the loopback/callback/timestamp queues (spec §4.4.3,
/// §8 invariant 5: "Queue length invariant... must stay <= Q").
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Side-channel values (DG gain, BLS) a pre-ISP network may declare tensors
/// for (spec §4.4.1, §4.4.5). Post-ISP NV12 never populates these.
#[derive(Clone, Debug, Default)]
pub struct SideInputs {
    pub dgain: Option<u16>,
    pub bls: Option<[u16; 4]>,
    /// The DMA-backed tensor frames themselves, bound into the inference
    /// call by [`DenoiseVariant::bind_side_inputs`]; `dgain`/`bls` above are
    /// plain copies kept for diagnostics/tests.
    pub dgain_frame: Option<Frame>,
    pub bls_frame: Option<Frame>,
}

/// Tagged-variant binding builder (spec §9): the only thing that differs
/// between post-ISP NV12, pre-ISP VD, and pre-ISP HDM is how tensors are
/// named and wired, not the loopback/ordering machinery itself.
pub trait DenoiseVariant: Send + Sync + 'static {
    fn create_bindings(&self, input: &Frame, output: &Frame) -> NetworkBindings;
    fn bind_loopback(&self, bindings: &mut NetworkBindings, loopback: &Frame);
    fn bind_side_inputs(&self, bindings: &mut NetworkBindings, side: &SideInputs);
    fn variant_name(&self) -> &'static str;

    /// Called once a submission's output frame is known-complete, so a
    /// variant that needs to remember state across submissions (HDM's
    /// fusion-skip carry-forward) can do so. No-op for variants that don't.
    fn on_output_ready(&self, _output: &Frame) {}
}

/// Rotates the feedback frame every `loopback_count` submissions, bootstrap
/// via a same-round self-reference the first time and every time the queue
/// has drained (spec §9 open question "bootstrap loopback identity": the
/// race is accepted, not engineered around).
///
/// This matches spec §8 scenario 2 ("loopback bootstrap") exactly: pushing
/// `loopback_count` copies of the rotating frame and popping one per
/// submission reproduces "submissions 0..L-1 share frame 0's output,
/// L..2L-1 share frame L's output, ..." without a separate bootstrap-only
/// code path.
pub(crate) struct LoopbackGate {
    queue: Queue<Frame>,
    loopback_count: usize,
}

impl LoopbackGate {
    pub fn new(loopback_count: usize, queue_depth: usize) -> Self {
        LoopbackGate {
            queue: Queue::new("denoise-loopback", queue_depth.max(1), QueuePolicy::Blocking),
            loopback_count,
        }
    }

    /// `Ok(None)` means: flushing and the queue legitimately drained, drop
    /// this frame (spec §4.4.6 "Loopback queue empty & flushing -> success").
    pub fn next(&self, fresh_output: &Frame, flushing: bool) -> Result<Option<Frame>> {
        if let Some(f) = self.queue.pop_timeout(Duration::from_millis(0)) {
            return Ok(Some(f));
        }
        if flushing {
            return Ok(None);
        }
        if self.loopback_count == 0 {
            return Err(Error::ConfigurationError(
                "denoise.loopback_count must be at least 1".into(),
            ));
        }
        for _ in 0..self.loopback_count {
            self.queue
                .push(fresh_output.clone())
                .map_err(|_| Error::PipelineError("loopback queue disconnected".into()))?;
        }
        self.queue
            .pop_timeout(Duration::from_millis(0))
            .map(Some)
            .ok_or_else(|| Error::PipelineError("loopback queue empty immediately after rotation".into()))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&self) {
        while self.queue.pop_timeout(Duration::from_millis(0)).is_some() {}
    }
}

/// Generic temporal-loopback denoise engine (spec §4.4). Parameterized over
/// the accelerator backend and the tagged topology variant; owns the output
/// pool, the loopback gate, and the dedicated callback thread that delivers
/// `on_buffer_ready` in submission order (spec §4.4.3, §4.4.4).
pub struct DenoiseEngine<V: DenoiseVariant, B: AcceleratorBackend> {
    variant: V,
    accel: Arc<AsyncInferenceBinding<B>>,
    output_pool: Arc<BufferPool>,
    loopback: LoopbackGate,
    callback_queue: Arc<Queue<Frame>>,
    flushing: AtomicBool,
    enabled: AtomicBool,
    on_buffer_ready: Box<dyn Fn(Frame) + Send + Sync>,
    on_enable_changed: Box<dyn Fn(bool) + Send + Sync>,
    callback_thread: parking_lot::Mutex<Option<(thread_control::Control, std::thread::JoinHandle<()>)>>,
}

impl<V: DenoiseVariant, B: AcceleratorBackend + 'static> DenoiseEngine<V, B> {
    pub fn new(
        variant: V,
        accel: Arc<AsyncInferenceBinding<B>>,
        output_pool: Arc<BufferPool>,
        loopback_count: usize,
        on_buffer_ready: impl Fn(Frame) + Send + Sync + 'static,
        on_enable_changed: impl Fn(bool) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(DenoiseEngine {
            variant,
            accel,
            output_pool,
            loopback: LoopbackGate::new(loopback_count, DEFAULT_QUEUE_DEPTH),
            callback_queue: Arc::new(Queue::new("denoise-callback", DEFAULT_QUEUE_DEPTH, QueuePolicy::Blocking)),
            flushing: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            on_buffer_ready: Box::new(on_buffer_ready),
            on_enable_changed: Box::new(on_enable_changed),
            callback_thread: parking_lot::Mutex::new(None),
        })
    }

    pub fn variant_name(&self) -> &'static str {
        self.variant.variant_name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Idempotent: no `on_enable_changed` fire if the value is unchanged
    /// (spec §8 invariant 7).
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous == enabled {
            return;
        }
        if enabled {
            self.flushing.store(false, Ordering::SeqCst);
            self.start_callback_thread();
        } else {
            self.begin_flush();
        }
        (self.on_enable_changed)(enabled);
    }

    fn start_callback_thread(self: &Arc<Self>) {
        let mut slot = self.callback_thread.lock();
        if slot.is_some() {
            return;
        }
        let (flag, control) = thread_control::make_pair();
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("denoise-callback-{}", this.variant.variant_name()))
            .spawn(move || {
                while flag.is_alive() {
                    if let Some(frame) = this.callback_queue.pop_timeout(Duration::from_millis(20)) {
                        (this.on_buffer_ready)(frame);
                        continue;
                    }
                    if this.flushing.load(Ordering::SeqCst)
                        && !this.accel.has_pending_jobs()
                        && this.callback_queue.is_empty()
                    {
                        break;
                    }
                }
            })
            .expect("failed to spawn denoise callback thread");
        *slot = Some((control, handle));
    }

    /// Set `flushing`, wait briefly for in-flight jobs to drain, then clear
    /// queues (spec §4.4.3 "Flushing").
    fn begin_flush(self: &Arc<Self>) {
        self.flushing.store(true, Ordering::SeqCst);
        let deadline = std::time::Instant::now() + DRAIN_TIMEOUT;
        while self.accel.has_pending_jobs() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if let Some((mut control, handle)) = self.callback_thread.lock().take() {
            control.stop();
            let _ = handle.join();
        }
        self.loopback.clear();
        while self.callback_queue.pop_timeout(Duration::from_millis(0)).is_some() {}
    }

    pub fn loopback_queue_len(&self) -> usize {
        self.loopback.len()
    }

    /// One submission through the loopback state machine (spec §4.4.3
    /// steps 1-6).
    pub fn handle_frame(self: &Arc<Self>, input: Frame, side: SideInputs) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let output = self
            .output_pool
            .acquire()
            .map_err(|e| Error::BufferAllocationError(e.to_string()))?;

        let feedback = match self.loopback.next(&output, self.flushing.load(Ordering::SeqCst))? {
            Some(f) => f,
            None => return Ok(()), // graceful flush drop
        };

        let mut bindings = self.variant.create_bindings(&input, &output);
        self.variant.bind_loopback(&mut bindings, &feedback);
        self.variant.bind_side_inputs(&mut bindings, &side);

        let callback_queue = self.callback_queue.clone();
        let output_for_callback = output.clone();
        let engine_for_callback = self.clone();
        // `input`/`feedback`/`side` are moved into the closure purely to keep
        // their planes' DMA-FDs alive until the job completes (spec §5
        // "zero-copy discipline") even though the callback never reads them.
        self.accel
            .process(bindings, input.isp_timestamp_ns, move |result| {
                let _keep_alive = (&input, &feedback, &side);
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "denoise inference reported failure");
                }
                engine_for_callback.variant.on_output_ready(&output_for_callback);
                // Still enqueue so the callback thread keeps draining (spec §4.4.6).
                if callback_queue.push(output_for_callback.clone()).is_err() {
                    tracing::warn!("denoise callback queue disconnected");
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_frame::{HeapDmaAllocator, MemoryKind, PixFmt, Resolution};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn fd_hash(frame: &Frame) -> u64 {
        let mut hasher = DefaultHasher::new();
        for plane in frame.planes() {
            plane.fd().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn pool(capacity: usize) -> Arc<BufferPool> {
        let pool = BufferPool::new(
            "test-loopback",
            Resolution::new(16, 16),
            PixFmt::Gray8,
            capacity,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        pool
    }

    #[test]
    fn loopback_rotates_every_l_submissions() {
        let gate = LoopbackGate::new(3, 4);
        let pool = pool(16);
        let outputs: Vec<Frame> = (0..9).map(|_| pool.acquire().unwrap()).collect();

        let mut feedback_hashes = Vec::new();
        for output in &outputs {
            let f = gate.next(output, false).unwrap().unwrap();
            feedback_hashes.push(fd_hash(&f));
        }

        assert_eq!(feedback_hashes[0], feedback_hashes[1]);
        assert_eq!(feedback_hashes[1], feedback_hashes[2]);
        assert_eq!(feedback_hashes[3], feedback_hashes[4]);
        assert_eq!(feedback_hashes[4], feedback_hashes[5]);
        assert_eq!(feedback_hashes[6], feedback_hashes[7]);
        assert_eq!(feedback_hashes[7], feedback_hashes[8]);

        assert_ne!(feedback_hashes[0], feedback_hashes[3]);
        assert_ne!(feedback_hashes[3], feedback_hashes[6]);

        // bootstrap: submission 0's feedback is its own output.
        assert_eq!(feedback_hashes[0], fd_hash(&outputs[0]));
        assert_eq!(feedback_hashes[3], fd_hash(&outputs[3]));
        assert_eq!(feedback_hashes[6], fd_hash(&outputs[6]));
    }

    #[test]
    fn loopback_queue_length_never_exceeds_q() {
        let gate = LoopbackGate::new(3, 4);
        let pool = pool(16);
        for _ in 0..12 {
            let output = pool.acquire().unwrap();
            gate.next(&output, false).unwrap();
            assert!(gate.len() <= 4);
        }
    }

    #[test]
    fn empty_and_flushing_drops_gracefully() {
        let gate = LoopbackGate::new(3, 4);
        let pool = pool(4);
        let output = pool.acquire().unwrap();
        assert!(gate.next(&output, true).unwrap().is_none());
    }
}
