//! Downstream side of the pipeline.

use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::{
    common::errors::{FlowError, PipelineError},
    encoder::format::Caps,
};

/// An encoded access unit ready for downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// The submitted frame this output was matched to, `None` for output the
    /// component produced without a pending frame.
    pub frame_id: Option<u64>,
    pub data: Bytes,
    pub pts: Duration,
    pub duration: Option<Duration>,
    pub sync_point: bool,
    /// Stream headers collected since the previous frame, to be sent ahead
    /// of `data`.
    pub headers: Vec<Bytes>,
}

/// Receives what the encoder produces, in delivery order.
///
/// Called from the output thread. Returning an error from `set_caps` or
/// `deliver` stops the output loop.
pub trait OutputSink: Send + Sync {
    fn set_caps(&self, caps: &Caps) -> Result<(), FlowError>;

    fn deliver(&self, frame: EncodedFrame) -> Result<(), FlowError>;

    /// A submitted frame finished without producing output.
    fn frame_dropped(&self, _frame_id: u64) {}

    fn end_of_stream(&self);

    fn error(&self, _err: &PipelineError) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Caps(Caps),
    Frame(EncodedFrame),
    Dropped(u64),
    Eos,
    Error(PipelineError),
}

/// Sink that forwards every event into a channel.
pub struct ChannelSink {
    tx: flume::Sender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, flume::Receiver<SinkEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) -> Result<(), FlowError> {
        self.tx
            .send(event)
            .map_err(|_| FlowError::Error("sink receiver dropped".into()))
    }
}

impl OutputSink for ChannelSink {
    fn set_caps(&self, caps: &Caps) -> Result<(), FlowError> {
        debug!("Output caps: {}", caps);
        self.send(SinkEvent::Caps(caps.clone()))
    }

    fn deliver(&self, frame: EncodedFrame) -> Result<(), FlowError> {
        self.send(SinkEvent::Frame(frame))
    }

    fn frame_dropped(&self, frame_id: u64) {
        let _ = self.send(SinkEvent::Dropped(frame_id));
    }

    fn end_of_stream(&self) {
        let _ = self.send(SinkEvent::Eos);
    }

    fn error(&self, err: &PipelineError) {
        let _ = self.send(SinkEvent::Error(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_events_in_order() {
        let (sink, rx) = ChannelSink::new();
        sink.set_caps(&Caps::new("video/x-h264", 16, 16)).unwrap();
        sink.frame_dropped(3);
        sink.end_of_stream();

        assert!(matches!(rx.recv().unwrap(), SinkEvent::Caps(c) if c.width == 16));
        assert_eq!(rx.recv().unwrap(), SinkEvent::Dropped(3));
        assert_eq!(rx.recv().unwrap(), SinkEvent::Eos);
    }

    #[test]
    fn dropped_receiver_is_a_flow_error() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let frame = EncodedFrame {
            frame_id: Some(0),
            data: Bytes::from_static(b"x"),
            pts: Duration::ZERO,
            duration: None,
            sync_point: true,
            headers: Vec::new(),
        };
        assert!(matches!(sink.deliver(frame), Err(FlowError::Error(_))));
    }
}
