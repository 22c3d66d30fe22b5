//! Serde-driven configuration tree (spec §6 "Config schema").

use serde::{Deserialize, Serialize};

fn default_loopback_count() -> usize {
    3
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// `denoise.network_config.*`: the post-ISP NV12 network's tensor names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_path: String,
    pub y_channel: String,
    pub uv_channel: String,
    pub feedback_y_channel: String,
    pub feedback_uv_channel: String,
    pub output_y_channel: String,
    pub output_uv_channel: String,
}

/// `denoise.bayer_network_config.*`: the pre-ISP Bayer network's tensor
/// names. The optional fields select which topology and side-channels are
/// active (spec §4.4.1): both fusion fields present → HDM, absent → VD.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BayerNetworkConfig {
    pub network_path: String,
    pub bayer_channel: String,
    pub feedback_bayer_channel: String,
    pub output_bayer_channel: String,
    #[serde(default)]
    pub dgain_channel: Option<String>,
    #[serde(default)]
    pub bls_channel: Option<String>,
    #[serde(default)]
    pub input_fusion_feedback: Option<String>,
    #[serde(default)]
    pub output_fusion_feedback: Option<String>,
    #[serde(default)]
    pub input_gamma_feedback: Option<String>,
    #[serde(default)]
    pub output_gamma_feedback: Option<String>,
}

impl BayerNetworkConfig {
    /// HDM topology needs the fusion and gamma feedback channels; VD has
    /// neither (spec §4.4.1).
    pub fn is_hdm(&self) -> bool {
        self.input_fusion_feedback.is_some() && self.output_fusion_feedback.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenoiseConfig {
    pub enabled: bool,
    #[serde(default)]
    pub bayer: bool,
    #[serde(default = "default_loopback_count")]
    pub loopback_count: usize,
    #[serde(default)]
    pub network_config: Option<NetworkConfig>,
    #[serde(default)]
    pub bayer_network_config: Option<BayerNetworkConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HailortConfig {
    pub device_id: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u16,
    #[serde(default = "default_scheduler_threshold")]
    pub scheduler_threshold: u32,
    #[serde(default = "default_scheduler_timeout_ms")]
    pub scheduler_timeout_ms: u64,
}

fn default_batch_size() -> u16 {
    1
}

fn default_scheduler_threshold() -> u32 {
    1
}

fn default_scheduler_timeout_ms() -> u64 {
    1000
}

impl HailortConfig {
    pub fn scheduler_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.scheduler_timeout_ms)
    }
}

/// `hdr.network.*`: the fusion network's tensor names. Not named explicitly
/// in the config schema excerpt, but required to bind the fusion job the
/// same way `network_config`/`bayer_network_config` do for denoise.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HdrNetworkConfig {
    pub network_path: String,
    /// One tensor name per DOL exposure plane, in capture order.
    pub exposure_channels: Vec<String>,
    pub gain_channel: String,
    pub output_channel: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HdrConfig {
    pub dol: u8,
    pub ls_ratio: f64,
    pub vs_ratio: f64,
    pub network: HdrNetworkConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    pub resolution: Resolution,
}

fn default_dma_heap_path() -> String {
    "/dev/dma_heap/linux,cma".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub denoise: DenoiseConfig,
    #[serde(default)]
    pub hdr: Option<HdrConfig>,
    pub hailort: HailortConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_dma_heap_path")]
    pub dma_heap_path: String,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_post_isp_config_from_yaml() {
        let yaml = r#"
denoise:
  enabled: true
  bayer: false
  loopback_count: 3
  network_config:
    network_path: "denoise_post_isp.hef"
    y_channel: "y_input"
    uv_channel: "uv_input"
    feedback_y_channel: "y_feedback"
    feedback_uv_channel: "uv_feedback"
    output_y_channel: "y_output"
    output_uv_channel: "uv_output"
hailort:
  device_id: "0000:01:00.0"
input:
  resolution:
    width: 3840
    height: 2160
    framerate: 30
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert!(cfg.denoise.enabled);
        assert!(!cfg.denoise.bayer);
        assert_eq!(cfg.denoise.loopback_count, 3);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.input.resolution.width, 3840);
    }

    #[test]
    fn bayer_network_config_detects_hdm_topology() {
        let vd = BayerNetworkConfig {
            network_path: "a".into(),
            bayer_channel: "b".into(),
            feedback_bayer_channel: "c".into(),
            output_bayer_channel: "d".into(),
            dgain_channel: None,
            bls_channel: None,
            input_fusion_feedback: None,
            output_fusion_feedback: None,
            input_gamma_feedback: None,
            output_gamma_feedback: None,
        };
        assert!(!vd.is_hdm());

        let hdm = BayerNetworkConfig {
            input_fusion_feedback: Some("fusion_in".into()),
            output_fusion_feedback: Some("fusion_out".into()),
            ..vd
        };
        assert!(hdm.is_hdm());
    }
}
