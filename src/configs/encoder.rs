use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{common::errors::AnyResult, omx::ControlRate};

/// How input frames reach the component's input buffers.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InputMode {
    /// Copy into port-allocated buffers.
    #[default]
    Default,
    /// Hand caller memory to the component without copying.
    ZeroCopy,
    /// Bind externally owned buffers by handle.
    Import,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct EncoderConfig {
    pub input_mode: InputMode,
    /// Row alignment for the input port; derived from the width when unset.
    pub stride_alignment: Option<u32>,
    pub slice_height_alignment: Option<u32>,
    /// Overrides the reported latency in frames.
    pub latency_frames: Option<u32>,
    pub params: CodecParamsConfig,
    pub quirks: QuirksConfig,
    pub timeouts: TimeoutConfig,
}

impl EncoderConfig {
    pub fn validate(&self) -> AnyResult<()> {
        for (name, align) in [
            ("stride_alignment", self.stride_alignment),
            ("slice_height_alignment", self.slice_height_alignment),
        ] {
            if align == Some(0) {
                return Err(format!("encoder.{name} must be positive").into());
            }
        }
        if self.latency_frames == Some(0) {
            return Err("encoder.latency_frames must be positive".into());
        }
        Ok(())
    }
}

/// Bitrate and quantization applied once at open time. Unset fields leave
/// the component defaults alone.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct CodecParamsConfig {
    pub control_rate: Option<ControlRate>,
    pub target_bitrate: Option<u32>,
    pub quant_i_frames: Option<u32>,
    pub quant_p_frames: Option<u32>,
    pub quant_b_frames: Option<u32>,
}

impl CodecParamsConfig {
    pub fn has_bitrate(&self) -> bool {
        self.control_rate.is_some() || self.target_bitrate.is_some()
    }

    pub fn has_quantization(&self) -> bool {
        self.quant_i_frames.is_some() || self.quant_p_frames.is_some() || self.quant_b_frames.is_some()
    }
}

/// Workarounds for known component misbehaviour.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct QuirksConfig {
    /// Keep the output port enabled across input format changes.
    pub no_disable_output_port: bool,
    /// The component cannot take an empty EOS buffer, skip draining.
    pub no_empty_eos_buffer: bool,
    /// The component never sets the sync frame flag, treat every frame as one.
    pub syncframe_flag_not_used: bool,
    /// The component wants an integer frame rate instead of Q16.
    pub video_framerate_integer: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TimeoutConfig {
    pub state_change_ms: u64,
    pub port_enable_ms: u64,
    pub port_disable_ms: u64,
    pub buffers_released_ms: u64,
    pub flush_ms: u64,
    pub drain_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        use crate::omx::constants::*;
        Self {
            state_change_ms: STATE_CHANGE_TIMEOUT.as_millis() as u64,
            port_enable_ms: PORT_ENABLE_TIMEOUT.as_millis() as u64,
            port_disable_ms: PORT_DISABLE_TIMEOUT.as_millis() as u64,
            buffers_released_ms: BUFFERS_RELEASED_TIMEOUT.as_millis() as u64,
            flush_ms: FLUSH_TIMEOUT.as_millis() as u64,
            drain_ms: DRAIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TimeoutConfig {
    pub fn state_change(&self) -> Duration {
        Duration::from_millis(self.state_change_ms)
    }

    pub fn port_enable(&self) -> Duration {
        Duration::from_millis(self.port_enable_ms)
    }

    pub fn port_disable(&self) -> Duration {
        Duration::from_millis(self.port_disable_ms)
    }

    pub fn buffers_released(&self) -> Duration {
        Duration::from_millis(self.buffers_released_ms)
    }

    pub fn flush(&self) -> Duration {
        Duration::from_millis(self.flush_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}
