//! The seam between the component state machine and an encoder
//! implementation.

use std::fmt;

use crate::{
    common::errors::ComponentError,
    omx::{
        buffer::BufferDescriptor,
        component::{ComponentEvents, ComponentState},
        params::{ConfigRequest, Parameter},
        port::{PortDefinition, PortIndex},
    },
};

/// A buffer the codec refused to take, handed back with the reason.
pub struct Rejected {
    pub error: ComponentError,
    pub buffer: BufferDescriptor,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("buffer", &self.buffer.id())
            .finish()
    }
}

/// An encoder behind the component.
///
/// Calls never happen with the component lock held, so implementations may
/// call back into [`ComponentEvents`] from any thread, including the calling
/// one.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Receives the event sink once, when the component is created.
    fn attach(&self, events: ComponentEvents);

    fn default_definition(&self, port: PortIndex) -> PortDefinition;

    /// Called when a state transition is requested. Going from Executing to
    /// Idle the codec must return every buffer it holds.
    fn on_state(&self, _from: ComponentState, _to: ComponentState) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Validates, and may adjust, a new port definition before it is stored.
    fn on_port_definition(
        &self,
        _port: PortIndex,
        _definition: &mut PortDefinition,
    ) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Takes a filled input buffer. It comes back through
    /// [`ComponentEvents::empty_buffer_done`] once consumed.
    fn empty_this_buffer(&self, buf: BufferDescriptor) -> Result<(), Rejected>;

    /// Takes an empty output buffer. It comes back through
    /// [`ComponentEvents::fill_buffer_done`] once filled.
    fn fill_this_buffer(&self, buf: BufferDescriptor) -> Result<(), Rejected>;

    /// Returns every buffer held on `port` without processing it.
    fn flush(&self, port: PortIndex);

    fn get_parameter(&self, _param: &mut Parameter) -> Result<(), ComponentError> {
        Err(ComponentError::UnsupportedIndex)
    }

    fn set_parameter(&self, _param: &Parameter) -> Result<(), ComponentError> {
        Err(ComponentError::UnsupportedIndex)
    }

    fn set_config(&self, _config: ConfigRequest) -> Result<(), ComponentError> {
        Err(ComponentError::UnsupportedIndex)
    }
}
