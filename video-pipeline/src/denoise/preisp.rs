//! Pre-ISP Bayer denoise variants (spec §4.4.1 VD/HDM topologies) and the
//! background ISP thread that drives them (spec §4.4.5).

use crate::config::BayerNetworkConfig;
use crate::denoise::common::{DenoiseEngine, DenoiseVariant, SideInputs};
use crate::error::{Error, Result};
use accel_rt::{AcceleratorBackend, NetworkBindings, TensorBinding};
use dma_frame::{BufferPool, Frame, HeapDmaAllocator, MemoryKind, PixFmt, Resolution};
use isp_ctl::{Device, IspControl, VideoDevice};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Gain applied when converting the raw `isp_dg_gain` control (a Q8.8
/// fixed-point factor, 256 == 1.0x) into the compact per-tensor
/// representation the network expects (spec §4.4.5 "adjusted by a fixed
/// factor" — the exact factor is unspecified upstream; documented as an Open
/// Question resolution in DESIGN.md).
pub const DG_GAIN_SCALE: f64 = 1.0 / 256.0;

fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    let bytes = value.to_le_bytes();
    buf[offset] = bytes[0];
    buf[offset + 1] = bytes[1];
}

/// Tiny DMA-backed buffers for the dgain (1 u16) and bls (4 u16) scalar side
/// tensors, refreshed from live ISP controls at acquire time (spec §4.4.5,
/// §9 "denoise side-queue pairing" open question: accepted as read-at-use
/// rather than paired-at-capture).
pub struct SideInputPools {
    dgain_pool: Option<Arc<BufferPool>>,
    bls_pool: Option<Arc<BufferPool>>,
}

impl SideInputPools {
    pub fn new(cfg: &BayerNetworkConfig, capacity: usize, dma_heap_path: &str) -> Self {
        let allocator = Arc::new(HeapDmaAllocator::new(dma_heap_path));
        let dgain_pool = cfg.dgain_channel.as_ref().map(|_| {
            BufferPool::new("dgain", Resolution::new(2, 1), PixFmt::Gray8, capacity, MemoryKind::DmaBuf, allocator.clone())
        });
        let bls_pool = cfg.bls_channel.as_ref().map(|_| {
            BufferPool::new("bls", Resolution::new(8, 1), PixFmt::Gray8, capacity, MemoryKind::DmaBuf, allocator)
        });
        SideInputPools { dgain_pool, bls_pool }
    }

    pub fn init(&self) -> Result<()> {
        if let Some(p) = &self.dgain_pool {
            p.init()?;
        }
        if let Some(p) = &self.bls_pool {
            p.init()?;
        }
        Ok(())
    }

    /// Read current ISP controls and populate the side-input frames (spec
    /// §4.4.5 "White-balance tie-in").
    pub fn acquire(&self, isp: &IspControl) -> Result<SideInputs> {
        let mut side = SideInputs::default();

        if let Some(pool) = &self.dgain_pool {
            let raw = isp.get_i64(Device::Video0, "isp_dg_gain")?;
            let scaled = (raw as f64 * DG_GAIN_SCALE).round().clamp(0.0, u16::MAX as f64) as u16;
            let frame = pool.acquire().map_err(|e| Error::BufferAllocationError(e.to_string()))?;
            frame.plane(0).unwrap().with_bytes_mut(|b| write_u16_le(b, 0, scaled));
            side.dgain = Some(scaled);
            side.dgain_frame = Some(frame);
        }

        if let Some(pool) = &self.bls_pool {
            let values = isp.bls_values()?;
            let frame = pool.acquire().map_err(|e| Error::BufferAllocationError(e.to_string()))?;
            frame.plane(0).unwrap().with_bytes_mut(|b| {
                for (i, v) in values.iter().enumerate() {
                    write_u16_le(b, i * 2, *v as u16);
                }
            });
            let bls_u16 = [values[0] as u16, values[1] as u16, values[2] as u16, values[3] as u16];
            side.bls = Some(bls_u16);
            side.bls_frame = Some(frame);
        }

        Ok(side)
    }
}

/// VD topology: 2 inputs (bayer, loopback-bayer), 1 output (spec §4.4.1).
pub struct PreIspVdVariant {
    cfg: BayerNetworkConfig,
}

impl PreIspVdVariant {
    pub fn new(cfg: BayerNetworkConfig) -> Self {
        assert!(!cfg.is_hdm(), "PreIspVdVariant requires a non-HDM bayer_network_config");
        PreIspVdVariant { cfg }
    }
}

impl DenoiseVariant for PreIspVdVariant {
    fn create_bindings(&self, input: &Frame, output: &Frame) -> NetworkBindings {
        let mut bindings = NetworkBindings::new();
        if let Some(b) = TensorBinding::from_plane(input, 0, self.cfg.bayer_channel.clone()) {
            bindings = bindings.with_input(b);
        }
        if let Some(b) = TensorBinding::from_plane(output, 0, self.cfg.output_bayer_channel.clone()) {
            bindings = bindings.with_output(b);
        }
        bindings
    }

    fn bind_loopback(&self, bindings: &mut NetworkBindings, loopback: &Frame) {
        if let Some(b) = TensorBinding::from_plane(loopback, 0, self.cfg.feedback_bayer_channel.clone()) {
            bindings.inputs.push(b);
        }
    }

    fn bind_side_inputs(&self, bindings: &mut NetworkBindings, side: &SideInputs) {
        bind_dgain_bls(&self.cfg, bindings, side);
    }

    fn variant_name(&self) -> &'static str {
        "pre-isp-vd"
    }
}

/// HDM topology: 3 inputs (bayer, fusion-feedback, gamma-feedback), 3
/// outputs (bayer, fusion, gamma), with optional fusion-skip side inputs
/// that re-use the current frame's fusion output as the next frame's skip
/// input (spec §4.4.1).
pub struct PreIspHdmVariant {
    cfg: BayerNetworkConfig,
    last_fusion_output: parking_lot::Mutex<Option<Frame>>,
}

impl PreIspHdmVariant {
    pub fn new(cfg: BayerNetworkConfig) -> Self {
        assert!(cfg.is_hdm(), "PreIspHdmVariant requires an HDM bayer_network_config");
        PreIspHdmVariant {
            cfg,
            last_fusion_output: parking_lot::Mutex::new(None),
        }
    }

}

impl DenoiseVariant for PreIspHdmVariant {
    fn create_bindings(&self, input: &Frame, output: &Frame) -> NetworkBindings {
        let mut bindings = NetworkBindings::new();
        if let Some(b) = TensorBinding::from_plane(input, 0, self.cfg.bayer_channel.clone()) {
            bindings = bindings.with_input(b);
        }
        if let (Some(gamma_in), true) = (&self.cfg.input_gamma_feedback, input.planes().len() > 1) {
            if let Some(b) = TensorBinding::from_plane(input, 1, gamma_in.clone()) {
                bindings = bindings.with_input(b);
            }
        }
        if let Some(b) = TensorBinding::from_plane(output, 0, self.cfg.output_bayer_channel.clone()) {
            bindings = bindings.with_output(b);
        }
        if let Some(name) = &self.cfg.output_fusion_feedback {
            if let Some(b) = TensorBinding::from_plane(output, 1, name.clone()) {
                bindings = bindings.with_output(b);
            }
        }
        if let Some(name) = &self.cfg.output_gamma_feedback {
            if let Some(b) = TensorBinding::from_plane(output, 2, name.clone()) {
                bindings = bindings.with_output(b);
            }
        }

        if let Some(name) = &self.cfg.input_fusion_feedback {
            if let Some(skip_src) = self.last_fusion_output.lock().clone() {
                // plane 1 of the stored frame is its fusion output (plane 0
                // is the primary bayer output, plane 2 the gamma output).
                if let Some(b) = TensorBinding::from_plane(&skip_src, 1, name.clone()) {
                    bindings = bindings.with_skip_input(b);
                }
            }
        }
        bindings
    }

    fn bind_loopback(&self, bindings: &mut NetworkBindings, loopback: &Frame) {
        if let Some(b) = TensorBinding::from_plane(loopback, 0, self.cfg.feedback_bayer_channel.clone()) {
            bindings.inputs.push(b);
        }
    }

    fn bind_side_inputs(&self, bindings: &mut NetworkBindings, side: &SideInputs) {
        bind_dgain_bls(&self.cfg, bindings, side);
    }

    fn variant_name(&self) -> &'static str {
        "pre-isp-hdm"
    }

    /// The fusion tensor (output plane 1) becomes the *next* submission's
    /// skip input (spec §4.4.1 HDM fusion-skip carry-forward).
    fn on_output_ready(&self, output: &Frame) {
        if output.planes().len() > 1 {
            *self.last_fusion_output.lock() = Some(output.clone());
        }
    }
}

fn bind_dgain_bls(cfg: &BayerNetworkConfig, bindings: &mut NetworkBindings, side: &SideInputs) {
    if let (Some(name), Some(frame)) = (&cfg.dgain_channel, &side.dgain_frame) {
        if let Some(b) = TensorBinding::from_plane(frame, 0, name.clone()) {
            bindings.gain_inputs.push(b);
        }
    }
    if let (Some(name), Some(frame)) = (&cfg.bls_channel, &side.bls_frame) {
        if let Some(b) = TensorBinding::from_plane(frame, 0, name.clone()) {
            bindings.gain_inputs.push(b);
        }
    }
}

/// Background thread driving the pre-ISP raw-capture -> denoise ->
/// ISP-input-injection loop (spec §4.4.5).
pub struct PreIspIspThread<V: DenoiseVariant, B: AcceleratorBackend + 'static> {
    engine: Arc<DenoiseEngine<V, B>>,
    isp: IspControl,
    raw_capture: Arc<dyn VideoDevice>,
    isp_input: Arc<dyn VideoDevice>,
    side_pools: Arc<SideInputPools>,
    running: AtomicBool,
    control: parking_lot::Mutex<Option<(thread_control::Control, std::thread::JoinHandle<()>)>>,
}

impl<V: DenoiseVariant, B: AcceleratorBackend + 'static> PreIspIspThread<V, B> {
    pub fn new(
        engine: Arc<DenoiseEngine<V, B>>,
        isp: IspControl,
        raw_capture: Arc<dyn VideoDevice>,
        isp_input: Arc<dyn VideoDevice>,
        side_pools: Arc<SideInputPools>,
    ) -> Arc<Self> {
        Arc::new(PreIspIspThread {
            engine,
            isp,
            raw_capture,
            isp_input,
            side_pools,
            running: AtomicBool::new(false),
            control: parking_lot::Mutex::new(None),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Opens the capture/output devices, queues initial buffers, and starts
    /// the dequeue/handle/inject loop (spec §4.4.5 steps 1-3).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.control.lock();
        if slot.is_some() {
            return Err(Error::PipelineError("pre-ISP ISP thread already running".into()));
        }
        self.raw_capture.stream_on()?;
        self.isp_input.stream_on()?;

        let (flag, control) = thread_control::make_pair();
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("denoise-preisp-isp".into())
            .spawn(move || {
                this.running.store(true, Ordering::SeqCst);
                while flag.is_alive() {
                    let raw = match this.raw_capture.dequeue_buffer(Duration::from_millis(50)) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    let side = match this.side_pools.acquire(&this.isp) {
                        Ok(side) => side,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to acquire denoise side inputs");
                            SideInputs::default()
                        }
                    };
                    if let Err(e) = this.engine.handle_frame(raw, side) {
                        tracing::error!(error = %e, "pre-ISP denoise submission failed");
                    }
                }
                this.running.store(false, Ordering::SeqCst);
            })
            .expect("failed to spawn pre-ISP ISP thread");
        *slot = Some((control, handle));
        Ok(())
    }

    /// Waits (bounded) for pending jobs, then stops the loop (spec §4.4.5
    /// step 4).
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        if let Some((mut control, handle)) = self.control.lock().take() {
            control.stop();
            let _ = handle.join();
            let _ = self.raw_capture.stream_off();
            let _ = self.isp_input.stream_off();
        }
        Ok(())
    }

    /// Injects a completed denoised frame into the ISP input device, called
    /// from the denoise engine's `on_buffer_ready` observer.
    pub fn inject(&self, frame: Frame) {
        if let Err(e) = self.isp_input.queue_buffer(frame) {
            tracing::error!(error = %e, "failed to inject denoised frame into ISP input");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vd_cfg() -> BayerNetworkConfig {
        BayerNetworkConfig {
            network_path: "denoise_pre_isp_vd.hef".into(),
            bayer_channel: "bayer_input".into(),
            feedback_bayer_channel: "bayer_feedback".into(),
            output_bayer_channel: "bayer_output".into(),
            dgain_channel: Some("dgain_input".into()),
            bls_channel: Some("bls_input".into()),
            input_fusion_feedback: None,
            output_fusion_feedback: None,
            input_gamma_feedback: None,
            output_gamma_feedback: None,
        }
    }

    fn bayer_frame() -> Frame {
        let pool = BufferPool::new(
            "preisp-test",
            Resolution::new(64, 32),
            PixFmt::Gray16,
            2,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        pool.acquire().unwrap()
    }

    #[test]
    fn vd_binds_two_inputs_and_one_output() {
        let variant = PreIspVdVariant::new(vd_cfg());
        let input = bayer_frame();
        let output = bayer_frame();
        let loopback = bayer_frame();
        let mut bindings = variant.create_bindings(&input, &output);
        assert_eq!(bindings.inputs.len(), 1);
        assert_eq!(bindings.outputs.len(), 1);
        variant.bind_loopback(&mut bindings, &loopback);
        assert_eq!(bindings.inputs.len(), 2);
    }

    #[test]
    fn dgain_tensor_carries_scaled_value() {
        use isp_ctl::{ControlValue, FakeIspBackend};

        let backend = Arc::new(FakeIspBackend::new());
        backend.preset(Device::Video0, "isp_dg_gain", ControlValue::Int(256));
        backend.preset(Device::Video0, "isp_bls_red", ControlValue::Int(1024));
        backend.preset(Device::Video0, "isp_bls_green_red", ControlValue::Int(1024));
        backend.preset(Device::Video0, "isp_bls_green_blue", ControlValue::Int(1024));
        backend.preset(Device::Video0, "isp_bls_blue", ControlValue::Int(1024));
        let isp = IspControl::new(backend);

        let pools = SideInputPools::new(&vd_cfg(), 2, "/tmp");
        pools.init().unwrap();
        let side = pools.acquire(&isp).unwrap();

        assert_eq!(side.dgain, Some(1));
        let dgain_frame = side.dgain_frame.as_ref().unwrap();
        dgain_frame.plane(0).unwrap().with_bytes(|b| assert_eq!(b[0], 1));

        let bls_frame = side.bls_frame.as_ref().unwrap();
        bls_frame.plane(0).unwrap().with_bytes(|b| {
            for i in 0..4 {
                let v = u16::from_le_bytes([b[i * 2], b[i * 2 + 1]]);
                assert_eq!(v, 1024);
            }
        });
    }
}
