//! Matching output buffers back to the frames that produced them.

use std::collections::VecDeque;

use crate::{encoder::frame::FrameInfo, omx::ticks};

/// Frames submitted to the component and not yet matched to output, in
/// submission order.
#[derive(Debug, Default)]
pub struct PendingFrameSet {
    frames: VecDeque<FrameInfo>,
}

impl PendingFrameSet {
    pub fn push(&mut self, frame: FrameInfo) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn remove(&mut self, id: u64) -> Option<FrameInfo> {
        let pos = self.frames.iter().position(|f| f.id == id)?;
        self.frames.remove(pos)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.frames.iter().map(|f| f.id).collect()
    }

    /// Removes the frame whose timestamp is nearest to `timestamp` (in
    /// component ticks). Ties go to the earliest submitted. Frames without a
    /// timestamp only match when no timestamped frame is pending, oldest
    /// first.
    pub fn take_nearest(&mut self, timestamp: i64) -> Option<FrameInfo> {
        let mut best: Option<(usize, u64)> = None;
        for (pos, frame) in self.frames.iter().enumerate() {
            let Some(pts) = frame.pts else {
                continue;
            };
            let diff = ticks::duration_to_ticks(pts).abs_diff(timestamp);
            if best.is_none_or(|(_, best_diff)| diff < best_diff) {
                best = Some((pos, diff));
            }
            if diff == 0 {
                break;
            }
        }

        let pos = match best {
            Some((pos, _)) => pos,
            None => self.frames.iter().position(|f| f.pts.is_none())?,
        };
        self.frames.remove(pos)
    }
}
