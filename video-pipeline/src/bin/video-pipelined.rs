//! `video-pipelined`: loads a config file, wires up the denoise/HDR engines
//! and the dewarp/multi-resize stages, and runs until interrupted.
//!
//! Defaults to [`accel_rt::FakeBackend`] and an in-process [`isp_ctl`]
//! backend so the whole graph runs without attached hardware, matching how
//! those types document themselves as the no-hardware reference path.

use accel_rt::{AsyncInferenceBinding, FakeBackend};
use anyhow::{Context, Result};
use clap::Parser;
use dma_frame::Frame;
use isp_ctl::{ControlValue, Device, FakeIspBackend, FakeVideoDevice, IspControl};
use pipeline::{Pipeline, QueuePolicy, ThreadedStage};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use video_pipeline::config::Config;
use video_pipeline::denoise::{DenoiseController, PreIspDevices};
use video_pipeline::dewarp::{DewarpStage, IdentityDspKernel};
use video_pipeline::hdr::HdrStitcher;
use video_pipeline::resize::{IdentityResizeKernel, MultiResizeStage, ResizeOutput};

#[derive(Parser, Debug)]
#[command(name = "video-pipelined", about = "Embedded camera denoise/HDR/dewarp/resize pipeline daemon")]
struct Cli {
    /// Path to a YAML or JSON config file (format inferred from extension).
    #[arg(short, long)]
    config: PathBuf,

    /// One or more `name:width:height:framerate` multi-resize outputs.
    /// Defaults to a single 1920x1080@30 "main" output when omitted.
    #[arg(long = "output", value_name = "NAME:W:H:FPS")]
    outputs: Vec<String>,
}

fn init_logging(cfg: &video_pipeline::config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&cfg.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match cfg.format {
        video_pipeline::config::LogFormat::Json => {
            let _ = subscriber.json().try_init();
        }
        video_pipeline::config::LogFormat::Pretty => {
            let _ = subscriber.try_init();
        }
    }
}

/// Presets the fake ISP controls the denoise side-inputs and HDR gain buffer
/// read at runtime, so the no-hardware path doesn't immediately error on a
/// missing control (spec §9 "Global ISP control surface").
fn seed_fake_isp_controls(backend: &FakeIspBackend) {
    backend.preset(Device::Video0, "isp_dg_gain", ControlValue::Int(256));
    backend.preset(Device::Video0, "isp_bls_red", ControlValue::Int(0));
    backend.preset(Device::Video0, "isp_bls_green_red", ControlValue::Int(0));
    backend.preset(Device::Video0, "isp_bls_green_blue", ControlValue::Int(0));
    backend.preset(Device::Video0, "isp_bls_blue", ControlValue::Int(0));
    backend.preset(Device::Video0, "isp_wb_r_gain", ControlValue::Float(1.0));
    backend.preset(Device::Video0, "isp_wb_gr_gain", ControlValue::Float(1.0));
    backend.preset(Device::Video0, "isp_wb_gb_gain", ControlValue::Float(1.0));
    backend.preset(Device::Video0, "isp_wb_b_gain", ControlValue::Float(1.0));
}

fn parse_output(spec: &str, dma_heap_path: &str) -> Result<ResizeOutput> {
    let parts: Vec<_> = spec.split(':').collect();
    anyhow::ensure!(parts.len() == 4, "output spec '{spec}' must be NAME:W:H:FPS");
    let width: u32 = parts[1].parse().context("output width")?;
    let height: u32 = parts[2].parse().context("output height")?;
    let framerate: u32 = parts[3].parse().context("output framerate")?;
    Ok(ResizeOutput::new(
        parts[0],
        video_pipeline::config::Resolution { width, height, framerate },
        framerate,
        dma_heap_path,
    ))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config = if cli.config.extension().and_then(|e| e.to_str()) == Some("json") {
        Config::from_json(&text).context("parsing JSON config")?
    } else {
        Config::from_yaml(&text).context("parsing YAML config")?
    };

    init_logging(&config.logging);
    tracing::info!(config = ?cli.config, "starting video-pipelined");

    let accel = Arc::new(AsyncInferenceBinding::new(Arc::new(FakeBackend::new())));

    let isp_backend = Arc::new(FakeIspBackend::new());
    seed_fake_isp_controls(&isp_backend);
    let isp = IspControl::new(isp_backend);

    let resize_outputs: Vec<ResizeOutput> = if cli.outputs.is_empty() {
        vec![ResizeOutput::new(
            "main",
            video_pipeline::config::Resolution {
                width: config.input.resolution.width,
                height: config.input.resolution.height,
                framerate: config.input.resolution.framerate,
            },
            config.input.resolution.framerate,
            &config.dma_heap_path,
        )]
    } else {
        cli.outputs
            .iter()
            .map(|s| parse_output(s, &config.dma_heap_path))
            .collect::<Result<_>>()?
    };
    for output in &resize_outputs {
        output.init()?;
    }

    let dewarp_pool = dma_frame::BufferPool::new(
        "dewarp-output",
        dma_frame::Resolution::new(config.input.resolution.width, config.input.resolution.height),
        dma_frame::PixFmt::Nv12,
        4,
        dma_frame::MemoryKind::DmaBuf,
        Arc::new(dma_frame::HeapDmaAllocator::new(&config.dma_heap_path)),
    );
    dewarp_pool.init()?;
    let dewarp_stage = ThreadedStage::new(
        DewarpStage::new(false, Arc::new(IdentityDspKernel), dewarp_pool),
        8,
        QueuePolicy::Blocking,
    );
    let dewarp_input = dewarp_stage.add_input("denoise");

    let resize_stage = ThreadedStage::new(
        MultiResizeStage::new(Arc::new(IdentityResizeKernel), resize_outputs),
        8,
        QueuePolicy::Leaky,
    );
    let (resize_tx, resize_rx) = channellib::bounded::<Vec<video_pipeline::resize::ResizedFrame>>(8);
    resize_stage.add_subscriber("sink", resize_tx);
    dewarp_stage.add_subscriber("resize", {
        let resize_input = resize_stage.add_input("dewarp");
        // `add_subscriber` wants a `channellib::Sender<Frame>`; bridge it to
        // the resize stage's registered input queue via a forwarding thread
        // so the dewarp stage doesn't need to know about queues at all.
        let (tx, rx) = channellib::bounded::<Frame>(8);
        std::thread::Builder::new()
            .name("dewarp-to-resize".into())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    if resize_input.push(frame).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn dewarp->resize bridge thread");
        tx
    });

    std::thread::Builder::new()
        .name("resize-output-drain".into())
        .spawn(move || {
            while let Ok(frames) = resize_rx.recv() {
                tracing::debug!(count = frames.len(), "resized frames ready");
            }
        })
        .expect("failed to spawn resize output drain thread");

    let mut pipeline = Pipeline::new("video-pipeline");
    pipeline.add_node(dewarp_stage.clone());
    pipeline.add_node(resize_stage.clone());
    pipeline.start().context("starting pipeline stages")?;

    // A real ISP driver calls `denoise.submit(frame)` from its YUV-ready
    // callback for the post-ISP topology; there's no such callback in the
    // no-hardware fake path, so post-ISP denoise stays wired but idle unless
    // something external calls `submit`.
    let dewarp_input_for_denoise = dewarp_input.clone();
    let denoise = Arc::new(DenoiseController::new(
        accel.clone(),
        isp.clone(),
        config.dma_heap_path.clone(),
        move |frame| {
            if dewarp_input_for_denoise.push(frame).is_err() {
                tracing::warn!("dewarp input queue disconnected, dropping denoised frame");
            }
        },
        |enabled| tracing::info!(enabled, "denoise engine enable state changed"),
    ));

    let pre_isp_devices = if config.denoise.bayer {
        let raw_capture = Arc::new(FakeVideoDevice::new(isp_ctl::DeviceDirection::Capture));
        let isp_input = Arc::new(FakeVideoDevice::new(isp_ctl::DeviceDirection::Output));
        Some(PreIspDevices { raw_capture, isp_input })
    } else {
        None
    };
    denoise
        .configure(&config.denoise, &config.hailort, &config.input, pre_isp_devices)
        .context("configuring denoise engine")?;

    let hdr_stitcher = if let Some(hdr_cfg) = &config.hdr {
        let raw_capture = Arc::new(FakeVideoDevice::new(isp_ctl::DeviceDirection::Capture));
        let isp_input = Arc::new(FakeVideoDevice::new(isp_ctl::DeviceDirection::Output));
        let resolution = dma_frame::Resolution::new(config.input.resolution.width, config.input.resolution.height);
        let stitcher = HdrStitcher::configure(
            accel.clone(),
            isp.clone(),
            raw_capture,
            isp_input,
            hdr_cfg.clone(),
            resolution,
            4,
            4,
            config.hailort.batch_size,
            config.hailort.scheduler_threshold,
            config.hailort.scheduler_timeout(),
            &config.dma_heap_path,
        )
        .context("configuring HDR stitcher")?;
        stitcher.start().context("starting HDR stitcher")?;
        Some(stitcher)
    } else {
        None
    };

    tracing::info!("video-pipelined running, press Ctrl-C to stop");
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc_handler(move || shutdown.store(true, Ordering::SeqCst))?;
    }
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutting down");
    if let Some(stitcher) = &hdr_stitcher {
        stitcher.stop().context("stopping HDR stitcher")?;
    }
    denoise.stop();
    pipeline.stop().context("stopping pipeline stages")?;
    Ok(())
}

/// Thin wrapper so the rest of `main` doesn't need to know which crate
/// provides Ctrl-C handling; falls back to SIGTERM-only behavior (process
/// exit) if registration fails, since that's still a safe default for a
/// daemon with no in-flight state to flush beyond what `stop()` already
/// drains.
fn ctrlc_handler(f: impl Fn() + Send + 'static) -> Result<()> {
    ctrlc::set_handler(f).context("registering Ctrl-C handler")
}
