use serde::{Deserialize, Serialize};

use crate::encoder::format::PixelFormat;

/// Synthetic session run by the binary against the loopback codec.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DemoConfig {
    pub frames: u32,
    pub width: u32,
    pub height: u32,
    pub fps_n: u32,
    pub fps_d: u32,
    pub pixel_format: PixelFormat,
    /// `h264`, `h265` or anything else for the generic output variant.
    pub codec: String,
    pub keyframe_interval: u32,
    pub emit_codec_config: bool,
    pub settings_change_after: Option<usize>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 60,
            width: 320,
            height: 240,
            fps_n: 30,
            fps_d: 1,
            pixel_format: PixelFormat::I420,
            codec: "h264".to_string(),
            keyframe_interval: 30,
            emit_codec_config: true,
            settings_change_after: None,
        }
    }
}
