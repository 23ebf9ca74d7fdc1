//! Component layer: a state machine with one input and one output port,
//! driven through move-only buffer descriptors.
//!
//! The [`Component`] owns the shared state, the [`Codec`] trait is the seam to
//! the actual encoder implementation (hardware or the in-process
//! [`LoopbackCodec`]).

pub mod buffer;
pub mod codec;
pub mod component;
pub mod constants;
pub mod loopback;
pub mod params;
pub mod port;
pub mod ticks;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{BufferDescriptor, BufferFlags, BufferMemory, ImportHandle};
pub use codec::{Codec, Rejected};
pub use component::{Component, ComponentEvents, ComponentState};
pub use loopback::{LoopbackCodec, LoopbackOptions, TraceEvent};
pub use params::{ConfigRequest, ControlRate, Parameter};
pub use port::{
    Acquire, ColorFormat, Port, PortDefinition, PortIndex, PortStats, VideoPortFormat,
};
