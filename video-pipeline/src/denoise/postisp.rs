//! Post-ISP NV12 denoise variant (spec §4.4.1): four input tensors (Y, UV,
//! loopback-Y, loopback-UV), two output tensors (Y, UV). Delivered downstream
//! purely via `on_buffer_ready`; no physical device injection.

use crate::config::NetworkConfig;
use crate::denoise::common::{DenoiseVariant, SideInputs};
use accel_rt::{NetworkBindings, TensorBinding};
use dma_frame::Frame;

pub struct PostIspVariant {
    cfg: NetworkConfig,
}

impl PostIspVariant {
    pub fn new(cfg: NetworkConfig) -> Self {
        PostIspVariant { cfg }
    }

    pub fn network_path(&self) -> &str {
        &self.cfg.network_path
    }
}

impl DenoiseVariant for PostIspVariant {
    fn create_bindings(&self, input: &Frame, output: &Frame) -> NetworkBindings {
        let mut bindings = NetworkBindings::new();
        if let Some(b) = TensorBinding::from_plane(input, 0, self.cfg.y_channel.clone()) {
            bindings = bindings.with_input(b);
        }
        if let Some(b) = TensorBinding::from_plane(input, 1, self.cfg.uv_channel.clone()) {
            bindings = bindings.with_input(b);
        }
        if let Some(b) = TensorBinding::from_plane(output, 0, self.cfg.output_y_channel.clone()) {
            bindings = bindings.with_output(b);
        }
        if let Some(b) = TensorBinding::from_plane(output, 1, self.cfg.output_uv_channel.clone()) {
            bindings = bindings.with_output(b);
        }
        bindings
    }

    fn bind_loopback(&self, bindings: &mut NetworkBindings, loopback: &Frame) {
        if let Some(b) = TensorBinding::from_plane(loopback, 0, self.cfg.feedback_y_channel.clone()) {
            bindings.inputs.push(b);
        }
        if let Some(b) = TensorBinding::from_plane(loopback, 1, self.cfg.feedback_uv_channel.clone()) {
            bindings.inputs.push(b);
        }
    }

    fn bind_side_inputs(&self, _bindings: &mut NetworkBindings, _side: &SideInputs) {
        // Post-ISP NV12 never declares dgain/bls tensors (spec §4.4.1).
    }

    fn variant_name(&self) -> &'static str {
        "post-isp-nv12"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dma_frame::{BufferPool, HeapDmaAllocator, MemoryKind, PixFmt, Resolution};
    use std::sync::Arc;

    fn nv12_frame() -> Frame {
        let pool = BufferPool::new(
            "postisp-test",
            Resolution::new(64, 32),
            PixFmt::Nv12,
            2,
            MemoryKind::DmaBuf,
            Arc::new(HeapDmaAllocator::new("/tmp")),
        );
        pool.init().unwrap();
        pool.acquire().unwrap()
    }

    fn cfg() -> NetworkConfig {
        NetworkConfig {
            network_path: "denoise_post_isp.hef".into(),
            y_channel: "y_input".into(),
            uv_channel: "uv_input".into(),
            feedback_y_channel: "y_feedback".into(),
            feedback_uv_channel: "uv_feedback".into(),
            output_y_channel: "y_output".into(),
            output_uv_channel: "uv_output".into(),
        }
    }

    #[test]
    fn binds_four_inputs_and_two_outputs() {
        let variant = PostIspVariant::new(cfg());
        let input = nv12_frame();
        let output = nv12_frame();
        let loopback = nv12_frame();

        let mut bindings = variant.create_bindings(&input, &output);
        assert_eq!(bindings.inputs.len(), 2);
        assert_eq!(bindings.outputs.len(), 2);
        variant.bind_loopback(&mut bindings, &loopback);
        assert_eq!(bindings.inputs.len(), 4);
        assert!(bindings.gain_inputs.is_empty());
    }
}
