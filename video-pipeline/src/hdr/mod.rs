//! HDR stitcher (spec §4.5): raw multi-exposure capture, per-exposure
//! white-balance gain derivation, accelerator fusion, ISP-input hand-off.
//!
//! Grounded on the pre-ISP denoise background thread
//! (`denoise::preisp::PreIspIspThread`) for the dedicated-thread/stream-on/
//! dequeue/submit/inject shape, and on
//! `original_source/media_library/src/hdr/impl/nncore/hdr_manager_impl.cpp`'s
//! `HdrManager::Impl` (DOL/resolution validation, stitcher init/on-infer
//! hookup) for the configure/submit shape.

use crate::config::{HdrConfig, HdrNetworkConfig};
use crate::error::{Error, Result};
use accel_rt::{AcceleratorBackend, AsyncInferenceBinding, NetworkBindings, TensorBinding};
use dma_frame::{BufferPool, Frame, HeapDmaAllocator, MemoryKind, PixFmt, Resolution};
use frame_formats::CfaChannel;
use isp_ctl::{ControlValue, Device, IspControl, IspMode, VideoDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Quantization factor applied to a raw WB gain (typically in `[1.0, 4.0]`)
/// before it is packed into the network's single-byte-per-channel gain
/// tensor; chosen so the common gain range lands well under the 127 clip
/// ceiling (spec §4.5.3 step e: "quantized by the known AWB compensation
/// factor... clip to 127" — the exact factor is unspecified upstream, same
/// kind of open question as `denoise::preisp::DG_GAIN_SCALE`).
pub const WB_QUANTIZE_SCALE: f64 = 32.0;

const GAIN_CLIP: u8 = 127;
const WAIT_FOR_STREAM_START_TIMEOUT: Duration = Duration::from_secs(5);
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(50);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One exposure's ratio relative to the reference (longest) exposure, used
/// to scale that exposure's WB gains before quantization (spec §4.5.2
/// "Ratios (LS, VS) are programmed via `HDR_RATIOS`" — applied here to the
/// per-exposure gain computation rather than only the V4L2 control, since
/// the fusion network needs the same ratio to weigh each exposure's input).
fn exposure_ratio(cfg: &HdrConfig, exposure_index: usize) -> f64 {
    match exposure_index {
        0 => 1.0,
        1 => cfg.ls_ratio,
        2 => cfg.vs_ratio,
        _ => 1.0,
    }
}

/// A preallocated (stitched-output, WB-gain) buffer pair for one in-flight
/// fusion submission (spec glossary "Stitch context").
struct StitchContext {
    stitched: Frame,
    gain: Frame,
}

struct StitchContextPool {
    stitched_pool: Arc<BufferPool>,
    gain_pool: Arc<BufferPool>,
}

impl StitchContextPool {
    fn new(contexts: usize, resolution: Resolution, dol: u8, dma_heap_path: &str) -> Self {
        let allocator = Arc::new(HeapDmaAllocator::new(dma_heap_path));
        let stitched_pool = BufferPool::new(
            "hdr-stitched-output",
            resolution,
            PixFmt::Gray16,
            contexts,
            MemoryKind::DmaBuf,
            allocator.clone(),
        );
        let gain_pool = BufferPool::new(
            "hdr-wb-gain",
            Resolution::new(dol as u32 * CfaChannel::ALL.len() as u32, 1),
            PixFmt::Gray8,
            contexts,
            MemoryKind::DmaBuf,
            allocator,
        );
        StitchContextPool { stitched_pool, gain_pool }
    }

    fn init(&self) -> Result<()> {
        self.stitched_pool.init()?;
        self.gain_pool.init()?;
        Ok(())
    }

    fn acquire(&self) -> Result<StitchContext> {
        let stitched = self
            .stitched_pool
            .acquire()
            .map_err(|e| Error::BufferAllocationError(e.to_string()))?;
        let gain = self
            .gain_pool
            .acquire()
            .map_err(|e| Error::BufferAllocationError(e.to_string()))?;
        Ok(StitchContext { stitched, gain })
    }
}

/// Dedicated HDR stitching thread (spec §4.5.3).
pub struct HdrStitcher<B: AcceleratorBackend + 'static> {
    accel: Arc<AsyncInferenceBinding<B>>,
    isp: IspControl,
    raw_capture: Arc<dyn VideoDevice>,
    isp_input: Arc<dyn VideoDevice>,
    contexts: StitchContextPool,
    network: HdrNetworkConfig,
    cfg: HdrConfig,
    warned_clip: AtomicBool,
    running: AtomicBool,
    control: parking_lot::Mutex<Option<(thread_control::Control, std::thread::JoinHandle<()>)>>,
}

impl<B: AcceleratorBackend + 'static> HdrStitcher<B> {
    /// Places the sensor in HDR mode, switches MCM to stitching, loads the
    /// HDR HEF for `{dol, resolution}`, and programs the LS/VS ratios (spec
    /// §4.5.2). `raw_caps`/`isp_in_caps` are the raw-capture and ISP-input
    /// devices' own buffer-ring depths; `contexts = min(raw_caps, isp_in_caps) + 1`
    /// (spec §4.5.3 step 3a).
    pub fn configure(
        accel: Arc<AsyncInferenceBinding<B>>,
        isp: IspControl,
        raw_capture: Arc<dyn VideoDevice>,
        isp_input: Arc<dyn VideoDevice>,
        cfg: HdrConfig,
        resolution: Resolution,
        raw_caps: usize,
        isp_in_caps: usize,
        batch_size: u16,
        scheduler_threshold: u32,
        scheduler_timeout: Duration,
        dma_heap_path: &str,
    ) -> Result<Arc<Self>> {
        if !(2..=3).contains(&cfg.dol) {
            return Err(Error::ConfigurationError(format!("hdr.dol must be 2 or 3, got {}", cfg.dol)));
        }
        if cfg.network.exposure_channels.len() != cfg.dol as usize {
            return Err(Error::ConfigurationError(format!(
                "hdr.network.exposure_channels has {} entries, expected dol={}",
                cfg.network.exposure_channels.len(),
                cfg.dol
            )));
        }

        isp.set_mode(IspMode::Hdr { dol: cfg.dol })?;
        isp.set_mode(IspMode::McmStitching)?;
        isp.set(Device::Video0, "isp_hdr_ratio_ls", ControlValue::Float(cfg.ls_ratio))?;
        isp.set(Device::Video0, "isp_hdr_ratio_vs", ControlValue::Float(cfg.vs_ratio))?;

        accel.set_config(&cfg.network.network_path, batch_size, scheduler_threshold, scheduler_timeout)?;

        let contexts = StitchContextPool::new(raw_caps.min(isp_in_caps) + 1, resolution, cfg.dol, dma_heap_path);
        contexts.init()?;

        Ok(Arc::new(HdrStitcher {
            accel,
            isp,
            raw_capture,
            isp_input,
            contexts,
            network: cfg.network.clone(),
            cfg,
            warned_clip: AtomicBool::new(false),
            running: AtomicBool::new(false),
            control: parking_lot::Mutex::new(None),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// `wait_for_yuv_stream_start`, stream both devices on, and start the
    /// stitch loop (spec §4.5.3 steps 1-3). Buffers that feed `raw_capture`
    /// are queued by whatever upstream component drives the sensor; this
    /// thread only dequeues and requeues them.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.control.lock();
        if slot.is_some() {
            return Err(Error::PipelineError("HDR stitcher already running".into()));
        }
        self.isp.wait_for_yuv_stream_start(WAIT_FOR_STREAM_START_TIMEOUT)?;
        self.raw_capture.stream_on()?;
        self.isp_input.stream_on()?;

        let (flag, control) = thread_control::make_pair();
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("hdr-stitcher".into())
            .spawn(move || {
                this.running.store(true, Ordering::SeqCst);
                while flag.is_alive() {
                    if let Err(e) = this.stitch_one() {
                        tracing::error!(error = %e, "HDR stitch submission failed");
                    }
                }
                this.running.store(false, Ordering::SeqCst);
            })
            .expect("failed to spawn HDR stitcher thread");
        *slot = Some((control, handle));
        Ok(())
    }

    /// One pass of spec §4.5.3 step 3: acquire a stitch context, pull one
    /// multi-exposure raw buffer, compute the WB-gain tensor, and submit the
    /// fusion job.
    fn stitch_one(self: &Arc<Self>) -> Result<()> {
        let ctx = match self.contexts.acquire() {
            Ok(ctx) => ctx,
            Err(_) => {
                std::thread::sleep(DEQUEUE_TIMEOUT);
                return Ok(());
            }
        };
        let raw = match self.raw_capture.dequeue_buffer(DEQUEUE_TIMEOUT) {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };
        if raw.planes().len() != self.cfg.dol as usize {
            return Err(Error::InvalidArgument(format!(
                "raw capture buffer has {} planes, expected dol={}",
                raw.planes().len(),
                self.cfg.dol
            )));
        }

        let mut stitched = ctx.stitched;
        stitched.isp_timestamp_ns = raw.isp_timestamp_ns;
        self.populate_gain_buffer(&ctx.gain)?;

        let mut bindings = NetworkBindings::new();
        for (i, name) in self.network.exposure_channels.iter().enumerate() {
            if let Some(b) = TensorBinding::from_plane(&raw, i, name.clone()) {
                bindings = bindings.with_input(b);
            }
        }
        if let Some(b) = TensorBinding::from_plane(&ctx.gain, 0, self.network.gain_channel.clone()) {
            bindings = bindings.with_gain_input(b);
        }
        if let Some(b) = TensorBinding::from_plane(&stitched, 0, self.network.output_channel.clone()) {
            bindings = bindings.with_output(b);
        }

        let raw_capture = self.raw_capture.clone();
        let isp_input = self.isp_input.clone();
        let raw_for_callback = raw.clone();
        let stitched_for_callback = stitched.clone();
        let gain_for_callback = ctx.gain.clone();
        let timestamp = stitched.isp_timestamp_ns;
        self.accel.process(bindings, timestamp, move |result| {
            let _keep_gain_alive = &gain_for_callback;
            if let Err(ref e) = result {
                tracing::error!(error = %e, "HDR fusion inference reported failure");
                return;
            }
            if let Err(e) = raw_capture.queue_buffer(raw_for_callback.clone()) {
                tracing::error!(error = %e, "failed to requeue raw HDR capture buffer");
            }
            if let Err(e) = isp_input.queue_buffer(stitched_for_callback.clone()) {
                tracing::error!(error = %e, "failed to inject stitched HDR frame into ISP input");
            }
        })?;

        Ok(())
    }

    /// Populate the per-exposure, per-CFA-channel WB-gain tensor (spec
    /// §4.5.3 step e).
    fn populate_gain_buffer(&self, gain: &Frame) -> Result<()> {
        let wb_gains = self.isp.wb_gains()?;
        let plane = gain.plane(0).ok_or_else(|| Error::InvalidArgument("HDR gain buffer has no plane 0".into()))?;
        let mut clipped = false;
        plane.with_bytes_mut(|bytes| {
            for exposure in 0..self.cfg.dol as usize {
                let ratio = exposure_ratio(&self.cfg, exposure);
                for (channel, gain_value) in CfaChannel::ALL.iter().zip(wb_gains.iter()) {
                    let quantized = (gain_value * ratio * WB_QUANTIZE_SCALE).round();
                    let byte = if quantized > GAIN_CLIP as f64 {
                        clipped = true;
                        GAIN_CLIP
                    } else if quantized < 0.0 {
                        0
                    } else {
                        quantized as u8
                    };
                    let offset = exposure * CfaChannel::ALL.len() + channel_index(*channel);
                    bytes[offset] = byte;
                }
            }
        });
        if clipped && !self.warned_clip.swap(true, Ordering::SeqCst) {
            tracing::warn!("HDR WB gain quantized value clipped to {GAIN_CLIP}");
        }
        Ok(())
    }

    /// Drops the HDR-forward-timestamp control and joins the thread (spec
    /// §4.5.3 step 4).
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        if let Some((mut control, handle)) = self.control.lock().take() {
            control.stop();
            let deadline = std::time::Instant::now() + DRAIN_TIMEOUT;
            while self.accel.has_pending_jobs() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = handle.join();
            let _ = self.raw_capture.stream_off();
            let _ = self.isp_input.stream_off();
            let _ = self.isp.set(Device::Video0, "timestamp_mode", ControlValue::Bool(false));
        }
        Ok(())
    }
}

fn channel_index(channel: CfaChannel) -> usize {
    CfaChannel::ALL.iter().position(|c| *c == channel).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HdrNetworkConfig;
    use accel_rt::FakeBackend;
    use isp_ctl::{DeviceDirection, FakeIspBackend, FakeVideoDevice};

    fn hdr_cfg(dol: u8) -> HdrConfig {
        HdrConfig {
            dol,
            ls_ratio: 4.0,
            vs_ratio: 16.0,
            network: HdrNetworkConfig {
                network_path: "hdr_stitch_dol2.hef".into(),
                exposure_channels: (0..dol).map(|i| format!("exposure_{i}")).collect(),
                gain_channel: "wb_gain".into(),
                output_channel: "stitched_output".into(),
            },
        }
    }

    fn isp_with_wb_gains() -> IspControl {
        let backend = Arc::new(FakeIspBackend::new());
        backend.preset(Device::Video0, "isp_wb_r_gain", ControlValue::Float(1.5));
        backend.preset(Device::Video0, "isp_wb_gr_gain", ControlValue::Float(1.0));
        backend.preset(Device::Video0, "isp_wb_gb_gain", ControlValue::Float(1.0));
        backend.preset(Device::Video0, "isp_wb_b_gain", ControlValue::Float(2.0));
        IspControl::new(backend)
    }

    fn stitcher(dol: u8) -> Arc<HdrStitcher<FakeBackend>> {
        let accel = Arc::new(AsyncInferenceBinding::new(Arc::new(FakeBackend::new())));
        let isp = isp_with_wb_gains();
        let raw_capture: Arc<dyn VideoDevice> = Arc::new(FakeVideoDevice::new(DeviceDirection::Capture));
        let isp_input: Arc<dyn VideoDevice> = Arc::new(FakeVideoDevice::new(DeviceDirection::Output));
        HdrStitcher::configure(
            accel,
            isp,
            raw_capture,
            isp_input,
            hdr_cfg(dol),
            Resolution::new(64, 32),
            4,
            4,
            1,
            1,
            Duration::from_millis(100),
            "/tmp",
        )
        .unwrap()
    }

    #[test]
    fn configure_rejects_unsupported_dol() {
        let accel = Arc::new(AsyncInferenceBinding::new(Arc::new(FakeBackend::new())));
        let isp = isp_with_wb_gains();
        let raw_capture: Arc<dyn VideoDevice> = Arc::new(FakeVideoDevice::new(DeviceDirection::Capture));
        let isp_input: Arc<dyn VideoDevice> = Arc::new(FakeVideoDevice::new(DeviceDirection::Output));
        let result = HdrStitcher::configure(
            accel,
            isp,
            raw_capture,
            isp_input,
            hdr_cfg(4),
            Resolution::new(64, 32),
            4,
            4,
            1,
            1,
            Duration::from_millis(100),
            "/tmp",
        );
        assert!(result.is_err());
    }

    #[test]
    fn stitch_context_pool_sizes_gain_buffer_per_dol_and_cfa_channel() {
        let s = stitcher(2);
        let ctx = s.contexts.acquire().unwrap();
        assert_eq!(ctx.gain.plane(0).unwrap().bytes_used, 2 * 4);
    }

    #[test]
    fn gain_buffer_quantizes_and_clips_without_panicking() {
        let s = stitcher(3);
        let ctx = s.contexts.acquire().unwrap();
        s.populate_gain_buffer(&ctx.gain).unwrap();
        ctx.gain.plane(0).unwrap().with_bytes(|bytes| {
            assert_eq!(bytes.len(), 12);
            // exposure 2 uses vs_ratio=16.0, so R gain 1.5*16*32 clips to 127.
            assert_eq!(bytes[2 * 4], GAIN_CLIP);
        });
        assert!(s.warned_clip.load(Ordering::SeqCst));
    }

    #[test]
    fn end_to_end_stitch_requeues_raw_and_injects_isp_input() {
        let s = stitcher(2);
        s.raw_capture.stream_on().unwrap();
        let raw_pool = BufferPool::new(
            "test-raw-dol2",
            Resolution::new(64, 32),
            PixFmt::BayerDol2,
            4,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        raw_pool.init().unwrap();
        s.raw_capture.queue_buffer(raw_pool.acquire().unwrap()).unwrap();

        s.start().unwrap();
        let injected = s.isp_input.dequeue_buffer(Duration::from_secs(2)).unwrap();
        assert_eq!(injected.width, 64);
        s.stop().unwrap();
    }
}
