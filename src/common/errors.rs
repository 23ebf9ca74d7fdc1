use std::time::Duration;

use thiserror::Error;

use crate::omx::{ComponentState, PortIndex};

/// Boxed error for setup paths (configuration, logging, the binary).
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;
pub type AnyResult<T> = std::result::Result<T, AnyError>;

/// Errors reported by a component or one of its ports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("component fault: {0}")]
    Fault(String),
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error("incorrect state transition {from:?} -> {to:?}")]
    IncorrectStateTransition {
        from: ComponentState,
        to: ComponentState,
    },
    #[error("incorrect state operation: {0}")]
    IncorrectStateOperation(String),
    #[error("unsupported parameter index")]
    UnsupportedIndex,
    #[error("unsupported parameter setting")]
    UnsupportedSetting,
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
}

impl ComponentError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::IncorrectStateOperation(msg.into())
    }
}

/// Errors reported by the downstream consumer of encoded frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("downstream is flushing")]
    Flushing,
    #[error("downstream is at end of stream")]
    Eos,
    #[error("downstream refused the output format")]
    NotNegotiated,
    #[error("downstream error: {0}")]
    Error(String),
}

/// Errors surfaced by the encoder pipeline.
///
/// The pipeline stores the first fatal error it hits and hands a clone of it
/// back to every later caller, so this type is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error("pipeline is flushing")]
    Flushing,
    #[error("pipeline is at end of stream")]
    Eos,
    #[error("not negotiated: {0}")]
    NotNegotiated(String),
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),
    #[error("buffer size mismatch: {0}")]
    BufferSize(String),
    #[error("failed to apply {name} parameters: {source}")]
    Parameter {
        name: &'static str,
        source: ComponentError,
    },
    #[error("failed to reconfigure {port} port: {source}")]
    Reconfigure {
        port: PortIndex,
        source: ComponentError,
    },
    #[error("component reached {actual:?} instead of {expected:?}")]
    StateChange {
        expected: ComponentState,
        actual: ComponentState,
    },
    #[error("failed to drain component: {0}")]
    Drain(String),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("failed to spawn output thread: {0}")]
    Spawn(String),
}

impl PipelineError {
    /// Errors that leave the session usable for later frames.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BufferSize(_) | Self::Flushing | Self::Eos | Self::UnsupportedFormat(_)
        )
    }
}
