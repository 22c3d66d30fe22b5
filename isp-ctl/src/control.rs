//! Named ISP/V4L2 control abstraction (spec §4.6, §6 "V4L2 devices",
//! §9 "Global ISP control surface").
//!
//! Grounded on `original_source/media_library/src/isp/v4l2_ctrl.cpp`: every
//! control is addressed by a stable name (`isp_ae_gain`, `isp_wb_r_gain`,
//! `mcm_mode_sel`, sensor-subdev names like `"Wide Dynamic Range"`, …) rather
//! than a hand-maintained numeric id table, matching the spec's explicit
//! instruction to model this as "a named control manager passed into
//! denoise/HDR constructors" with no hidden global state.

use crate::error::{Error, Result};
use std::sync::Arc;

/// The physical/virtual device a control lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    /// `/dev/videoN`, the ISP's primary control node.
    Video0,
    /// Sensor subdevice (`find_subdevice_path("imx")` in the original).
    Imx,
    /// CSI receiver subdevice.
    Csi,
    /// The ISP subdevice itself (`find_subdevice_path("hailo-isp")`).
    Isp,
}

/// Sensor/ISP operating mode switched at configure time (spec glossary
/// "MCM"; spec §4.4.5, §4.5.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IspMode {
    /// Live sensor feed, standard dynamic range.
    Sdr,
    /// Live sensor feed, DOL-2 or DOL-3 high dynamic range.
    Hdr { dol: u8 },
    /// Memory-coupling mode: the ISP consumes externally injected frames
    /// (pre-ISP denoise loopback) instead of the sensor.
    Mcm { packed: bool },
    /// Memory-coupling mode switched to HDR stitching: the ISP consumes the
    /// stitcher's fused-Bayer output instead of raw sensor exposures.
    McmStitching,
}

/// A named control's value. V4L2 controls are numerically typed even when
/// semantically boolean or enum-like; callers convert at the edges the way
/// the original's per-field accessors do.
#[derive(Clone, Copy, Debug)]
pub enum ControlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ControlValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(v) => Some(*v),
            ControlValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ControlValue::Int(v) => Some(*v),
            ControlValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ControlValue::Float(v) => Some(*v),
            ControlValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Backend for named control get/set and mode switching, fakeable for tests
/// (spec §9: pass a control manager into constructors, no global state).
pub trait IspControlBackend: Send + Sync {
    fn get(&self, device: Device, name: &str) -> Result<ControlValue>;
    fn set(&self, device: Device, name: &str, value: ControlValue) -> Result<()>;
    fn set_mode(&self, mode: IspMode) -> Result<()>;
    /// Blocks until the YUV-stream device reports stream start (spec §4.5.3
    /// step 1, `wait_for_yuv_stream_start`).
    fn wait_for_yuv_stream_start(&self, timeout: std::time::Duration) -> Result<()>;
}

/// Convenience handle wrapping an [`IspControlBackend`], passed by value into
/// denoise/HDR engine constructors (spec §9).
#[derive(Clone)]
pub struct IspControl {
    backend: Arc<dyn IspControlBackend>,
}

impl IspControl {
    pub fn new(backend: Arc<dyn IspControlBackend>) -> Self {
        IspControl { backend }
    }

    pub fn get(&self, device: Device, name: &str) -> Result<ControlValue> {
        self.backend.get(device, name)
    }

    pub fn set(&self, device: Device, name: &str, value: ControlValue) -> Result<()> {
        self.backend.set(device, name, value)
    }

    pub fn get_i64(&self, device: Device, name: &str) -> Result<i64> {
        self.get(device, name)?
            .as_i64()
            .ok_or_else(|| Error::InvalidArgument(format!("control '{name}' is not numeric")))
    }

    pub fn set_mode(&self, mode: IspMode) -> Result<()> {
        self.backend.set_mode(mode)
    }

    pub fn wait_for_yuv_stream_start(&self, timeout: std::time::Duration) -> Result<()> {
        self.backend.wait_for_yuv_stream_start(timeout)
    }

    /// Read the four white-balance gains used to fill a denoise network's DG
    /// side tensor (spec §4.4.5 "White-balance tie-in").
    pub fn wb_gains(&self) -> Result<[f64; 4]> {
        Ok([
            self.get(Device::Video0, "isp_wb_r_gain")?.as_f64().unwrap_or(0.0),
            self.get(Device::Video0, "isp_wb_gr_gain")?.as_f64().unwrap_or(0.0),
            self.get(Device::Video0, "isp_wb_gb_gain")?.as_f64().unwrap_or(0.0),
            self.get(Device::Video0, "isp_wb_b_gain")?.as_f64().unwrap_or(0.0),
        ])
    }

    /// Read the four BLS (black level subtraction) values, in CFA channel
    /// order R, Gr, Gb, B (spec §4.4.5).
    pub fn bls_values(&self) -> Result<[i64; 4]> {
        Ok([
            self.get_i64(Device::Video0, "isp_bls_red")?,
            self.get_i64(Device::Video0, "isp_bls_green_red")?,
            self.get_i64(Device::Video0, "isp_bls_green_blue")?,
            self.get_i64(Device::Video0, "isp_bls_blue")?,
        ])
    }
}

/// In-process fake backend holding controls in a map, for tests and for
/// `video-pipelined` when no real ISP is attached.
pub struct FakeIspBackend {
    values: parking_lot::Mutex<std::collections::HashMap<(Device, String), ControlValue>>,
    mode: parking_lot::Mutex<Option<IspMode>>,
}

impl Default for FakeIspBackend {
    fn default() -> Self {
        FakeIspBackend {
            values: parking_lot::Mutex::new(std::collections::HashMap::new()),
            mode: parking_lot::Mutex::new(None),
        }
    }
}

impl FakeIspBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(&self, device: Device, name: &str, value: ControlValue) {
        self.values.lock().insert((device, name.to_string()), value);
    }

    pub fn current_mode(&self) -> Option<IspMode> {
        *self.mode.lock()
    }
}

impl IspControlBackend for FakeIspBackend {
    fn get(&self, device: Device, name: &str) -> Result<ControlValue> {
        self.values
            .lock()
            .get(&(device, name.to_string()))
            .copied()
            .ok_or_else(|| Error::ControlNotPresent(name.to_string()))
    }

    fn set(&self, device: Device, name: &str, value: ControlValue) -> Result<()> {
        self.values.lock().insert((device, name.to_string()), value);
        Ok(())
    }

    fn set_mode(&self, mode: IspMode) -> Result<()> {
        *self.mode.lock() = Some(mode);
        Ok(())
    }

    fn wait_for_yuv_stream_start(&self, _timeout: std::time::Duration) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wb_gains_reads_all_four_channels() {
        let backend = Arc::new(FakeIspBackend::new());
        backend.preset(Device::Video0, "isp_wb_r_gain", ControlValue::Float(1.5));
        backend.preset(Device::Video0, "isp_wb_gr_gain", ControlValue::Float(1.0));
        backend.preset(Device::Video0, "isp_wb_gb_gain", ControlValue::Float(1.0));
        backend.preset(Device::Video0, "isp_wb_b_gain", ControlValue::Float(2.0));
        let ctrl = IspControl::new(backend);
        assert_eq!(ctrl.wb_gains().unwrap(), [1.5, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn missing_control_errors() {
        let ctrl = IspControl::new(Arc::new(FakeIspBackend::new()));
        assert!(ctrl.get(Device::Video0, "isp_ae_gain").is_err());
    }

    #[test]
    fn set_mode_is_observable() {
        let backend = Arc::new(FakeIspBackend::new());
        let ctrl = IspControl::new(backend.clone());
        ctrl.set_mode(IspMode::Hdr { dol: 2 }).unwrap();
        assert_eq!(backend.current_mode(), Some(IspMode::Hdr { dol: 2 }));
    }
}
