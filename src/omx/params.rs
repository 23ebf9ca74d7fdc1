//! Parameter and config structures exchanged with the component.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlRate {
    #[default]
    Disable,
    Variable,
    Constant,
    VariableSkipFrames,
    ConstantSkipFrames,
}

impl ControlRate {
    /// Modes that are meaningless without a target bitrate.
    pub fn needs_target(self) -> bool {
        !matches!(self, Self::Disable)
    }
}

/// Parameters read with get-modify-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    Bitrate {
        control_rate: ControlRate,
        target_bitrate: u32,
    },
    Quantization {
        qp_i: u32,
        qp_p: u32,
        qp_b: u32,
    },
}

impl Parameter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bitrate { .. } => "bitrate",
            Self::Quantization { .. } => "quantization",
        }
    }
}

/// Runtime configs applied to the next submitted input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigRequest {
    /// Force the next frame to be an intra refresh point.
    IntraRefresh,
    /// Mark the next frame as a long-term reference.
    ForceReference,
}
