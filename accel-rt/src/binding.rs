//! DMA-FD tensor bindings for one accelerator inference call (spec §4.5
//! "Accelerator binding").
//!
//! Grounded on `original_source/media_library/include/media_library/hailort_denoise.hpp`'s
//! `TensorBinding`/`NetworkInferenceBindings`.

use dma_frame::Frame;

/// One tensor bound to a plane's DMA-FD.
#[derive(Clone, Debug)]
pub struct TensorBinding {
    pub fd: i32,
    pub tensor_name: String,
    pub frame_size: usize,
}

impl TensorBinding {
    pub fn from_plane(frame: &Frame, plane_index: usize, tensor_name: impl Into<String>) -> Option<Self> {
        let plane = frame.plane(plane_index)?;
        Some(TensorBinding {
            fd: plane.fd(),
            tensor_name: tensor_name.into(),
            frame_size: plane.bytes_used,
        })
    }
}

/// The full set of tensors bound for one network invocation: primary
/// inputs/outputs plus the denoise engine's side channels (loopback gain,
/// HDM fusion-skip) (spec §4.4.2-4.4.4).
#[derive(Clone, Debug, Default)]
pub struct NetworkBindings {
    pub inputs: Vec<TensorBinding>,
    pub outputs: Vec<TensorBinding>,
    pub gain_inputs: Vec<TensorBinding>,
    pub skip_inputs: Vec<TensorBinding>,
}

impl NetworkBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, binding: TensorBinding) -> Self {
        self.inputs.push(binding);
        self
    }

    pub fn with_output(mut self, binding: TensorBinding) -> Self {
        self.outputs.push(binding);
        self
    }

    pub fn with_gain_input(mut self, binding: TensorBinding) -> Self {
        self.gain_inputs.push(binding);
        self
    }

    pub fn with_skip_input(mut self, binding: TensorBinding) -> Self {
        self.skip_inputs.push(binding);
        self
    }
}
