//! Named ISP/V4L2 control abstraction and capture/output device I/O
//! (spec §4.6, §6 "V4L2 devices", §9 "Global ISP control surface").

mod control;
mod device;
mod error;

pub use control::{ControlValue, Device, FakeIspBackend, IspControl, IspControlBackend, IspMode};
pub use device::{DeviceDirection, FakeVideoDevice, VideoDevice};
pub use error::{Error, Result};
