//! Denoise engine, HDR stitcher, and dewarp/resize stages for an embedded
//! camera pipeline driving an on-device AI accelerator (spec §1-§6).
//!
//! Module layout mirrors the component table: `denoise` owns the post-ISP
//! and pre-ISP temporal-loopback engines, `hdr` the multi-exposure stitcher,
//! `dewarp`/`resize` the DSP-kernel passthrough stages downstream of the
//! ISP. `config`/`error` are the ambient serde schema and unified error type
//! every other module returns.

pub mod config;
pub mod denoise;
pub mod dewarp;
pub mod error;
pub mod hdr;
pub mod resize;

pub use error::{Error, Result};
