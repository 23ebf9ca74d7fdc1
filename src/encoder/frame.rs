use std::time::Duration;

use bytes::Bytes;

use crate::omx::ImportHandle;

#[derive(Debug, Clone)]
pub enum FramePayload {
    /// Raw planes laid out back to back with default strides, or already in
    /// the component's layout.
    Bytes(Bytes),
    /// Externally owned buffer, only valid in import mode.
    Imported(ImportHandle),
}

/// A raw frame offered for encoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub payload: FramePayload,
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    pub force_keyframe: bool,
    pub force_reference: bool,
}

impl Frame {
    pub fn new(id: u64, payload: FramePayload) -> Self {
        Self {
            id,
            payload,
            pts: None,
            duration: None,
            force_keyframe: false,
            force_reference: false,
        }
    }

    pub fn from_bytes(id: u64, data: impl Into<Bytes>) -> Self {
        Self::new(id, FramePayload::Bytes(data.into()))
    }

    pub fn with_pts(mut self, pts: Duration) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn keyframe(mut self) -> Self {
        self.force_keyframe = true;
        self
    }

    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            id: self.id,
            pts: self.pts,
            duration: self.duration,
            force_keyframe: self.force_keyframe,
        }
    }
}

/// What the pipeline keeps about a submitted frame until its output arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: u64,
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    pub force_keyframe: bool,
}
