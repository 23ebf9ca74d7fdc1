//! Codec specific behaviour plugged into the generic pipeline.

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::{
    common::errors::{FlowError, PipelineError},
    configs::QuirksConfig,
    encoder::{
        format::{Caps, VideoFormat},
        frame::FrameInfo,
        pipeline::Session,
        sink::{EncodedFrame, OutputSink},
    },
    omx::{BufferDescriptor, BufferFlags, Component, constants::ANNEXB_START_CODE, ticks},
};

/// Hooks a codec family provides to the pipeline.
pub trait CodecVariant: Send + Sync {
    fn name(&self) -> &str;

    /// Called after the input port definition was updated for a new format,
    /// before buffers are allocated.
    fn set_format(&self, _component: &Component, _format: &VideoFormat) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Output caps for the component's current output port definition.
    fn get_caps(&self, component: &Component, input: &VideoFormat) -> Option<Caps>;

    /// Turns one acquired output buffer into downstream events. `frame` is
    /// the submitted frame it was matched to, if any.
    fn handle_output_frame(
        &self,
        ctx: &mut OutputContext<'_>,
        buf: &BufferDescriptor,
        frame: Option<FrameInfo>,
    ) -> Result<(), FlowError> {
        default_output_frame(ctx, buf, frame)
    }
}

/// What an output handler may touch while it runs on the output thread.
pub struct OutputContext<'a> {
    pub(crate) component: &'a Component,
    pub(crate) sink: &'a dyn OutputSink,
    pub(crate) session: &'a mut Session,
    pub(crate) quirks: &'a QuirksConfig,
    pub(crate) variant: &'a dyn CodecVariant,
}

impl OutputContext<'_> {
    pub fn component(&self) -> &Component {
        self.component
    }

    pub fn quirks(&self) -> &QuirksConfig {
        self.quirks
    }

    pub fn input_format(&self) -> Option<&VideoFormat> {
        self.session.input_format.as_ref()
    }

    pub fn output_caps(&self) -> Option<&Caps> {
        self.session.output_caps.as_ref()
    }

    /// Queues an in-band stream header for the next delivered frame.
    pub fn push_header(&mut self, header: Bytes) {
        trace!("Queued {} byte stream header", header.len());
        self.session.headers.push(header);
    }

    /// Publishes new output caps downstream.
    pub fn negotiate(&mut self, caps: Caps) -> Result<(), FlowError> {
        self.sink.set_caps(&caps)?;
        self.session.output_caps = Some(caps);
        Ok(())
    }

    pub fn finish_frame(&mut self, mut frame: EncodedFrame) -> Result<(), FlowError> {
        frame.headers = std::mem::take(&mut self.session.headers);
        self.sink.deliver(frame)
    }

    pub fn drop_frame(&mut self, frame_id: u64) {
        self.sink.frame_dropped(frame_id);
    }
}

/// Output handling shared by all variants: codec config becomes caps
/// `codec_data`, everything else is delivered as an encoded frame.
pub fn default_output_frame(
    ctx: &mut OutputContext<'_>,
    buf: &BufferDescriptor,
    frame: Option<FrameInfo>,
) -> Result<(), FlowError> {
    if buf.flags.contains(BufferFlags::CONFIG) && buf.filled_len > 0 {
        debug!("Handling codec data");
        let Some(input) = ctx.input_format().cloned() else {
            error!("Codec data arrived before the input format");
            return Err(FlowError::NotNegotiated);
        };
        let Some(mut caps) = ctx.variant.get_caps(ctx.component, &input) else {
            error!("Failed to derive output caps");
            return Err(FlowError::NotNegotiated);
        };
        caps.codec_data = Some(buf.payload());
        return ctx.negotiate(caps).map_err(|err| {
            error!("Failed to negotiate codec data caps: {}", err);
            FlowError::NotNegotiated
        });
    }

    if buf.filled_len > 0 {
        if frame.is_none() {
            error!("No corresponding frame found");
        }
        let encoded = EncodedFrame {
            frame_id: frame.map(|f| f.id),
            data: buf.payload(),
            pts: ticks::ticks_to_duration(buf.timestamp),
            duration: (buf.tick_count != 0)
                .then(|| ticks::ticks_to_duration(buf.tick_count as i64)),
            sync_point: buf.flags.contains(BufferFlags::SYNC_POINT)
                || ctx.quirks.syncframe_flag_not_used,
            headers: Vec::new(),
        };
        return ctx.finish_frame(encoded);
    }

    if let Some(frame) = frame {
        trace!("Frame {} finished without output", frame.id);
        ctx.drop_frame(frame.id);
    }
    Ok(())
}

fn caps_from_output(component: &Component, media_type: &str, input: &VideoFormat) -> Caps {
    let video = component.output().definition().video;
    let (width, height) = if video.width > 0 && video.height > 0 {
        (video.width, video.height)
    } else {
        (input.width, input.height)
    };
    Caps::new(media_type, width, height).with_framerate(input.fps_n, input.fps_d)
}

/// Variant for codecs that need nothing beyond the default handling.
pub struct GenericVariant {
    media_type: String,
}

impl GenericVariant {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
        }
    }
}

impl CodecVariant for GenericVariant {
    fn name(&self) -> &str {
        &self.media_type
    }

    fn get_caps(&self, component: &Component, input: &VideoFormat) -> Option<Caps> {
        Some(caps_from_output(component, &self.media_type, input))
    }
}

/// H.264 and H.265 in Annex B byte-stream form. In-band parameter sets are
/// sent as stream headers instead of caps.
pub struct ByteStreamVariant {
    media_type: &'static str,
}

impl ByteStreamVariant {
    pub fn h264() -> Self {
        Self {
            media_type: "video/x-h264",
        }
    }

    pub fn h265() -> Self {
        Self {
            media_type: "video/x-h265",
        }
    }
}

impl CodecVariant for ByteStreamVariant {
    fn name(&self) -> &str {
        self.media_type
    }

    fn get_caps(&self, component: &Component, input: &VideoFormat) -> Option<Caps> {
        let mut caps = caps_from_output(component, self.media_type, input);
        caps.stream_format = Some("byte-stream".into());
        caps.alignment = Some("au".into());
        Some(caps)
    }

    fn handle_output_frame(
        &self,
        ctx: &mut OutputContext<'_>,
        buf: &BufferDescriptor,
        frame: Option<FrameInfo>,
    ) -> Result<(), FlowError> {
        if buf.flags.contains(BufferFlags::CONFIG) && buf.data().starts_with(&ANNEXB_START_CODE) {
            debug!("Collecting {} byte stream headers", self.media_type);
            ctx.push_header(buf.payload());
            return Ok(());
        }
        default_output_frame(ctx, buf, frame)
    }
}
