//! Encoder session on top of a [`Component`](crate::omx::Component):
//! format negotiation, frame submission, the output acquisition loop,
//! reconfiguration and draining.

pub mod correlator;
pub mod fill;
pub mod format;
pub mod frame;
pub mod import;
pub mod output_loop;
pub mod params;
pub mod pipeline;
pub mod reconfigure;
pub mod sink;
pub mod variant;

#[cfg(test)]
mod tests;

pub use format::{Caps, PixelFormat, VideoFormat};
pub use frame::{Frame, FrameInfo, FramePayload};
pub use pipeline::{AllocationHint, EncoderPipeline, SubmitOutcome};
pub use sink::{ChannelSink, EncodedFrame, OutputSink, SinkEvent};
pub use variant::{ByteStreamVariant, CodecVariant, GenericVariant, OutputContext};
