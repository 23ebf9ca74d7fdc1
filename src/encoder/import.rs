//! Discovering the external buffer pool in import mode.
//!
//! The component cannot go Executing until every imported buffer is bound
//! to the input port. The pool is known either from an explicit announcement
//! or from watching frames until the first handle repeats, whichever comes
//! first.

use tracing::{debug, info, warn};

use crate::omx::ImportHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolStatus {
    /// Still discovering, the frame cannot be encoded yet.
    Collecting,
    /// The pool just became complete with these handles.
    Ready(Vec<ImportHandle>),
    /// The pool was already complete.
    Active,
}

#[derive(Debug, Default)]
pub struct ImportPoolTracker {
    seen: Vec<ImportHandle>,
    announced: Option<Vec<ImportHandle>>,
    complete: bool,
}

impl ImportPoolTracker {
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The handles of the complete pool, empty while still collecting.
    pub fn pool(&self) -> &[ImportHandle] {
        if self.complete { &self.seen } else { &[] }
    }

    /// Registers the full pool ahead of time. Ignored once the pool is
    /// complete.
    pub fn announce(&mut self, handles: Vec<ImportHandle>) {
        if self.complete {
            warn!(
                "Ignoring announced pool of {} buffers, the pool is already complete",
                handles.len()
            );
            return;
        }
        debug!("Import pool announced with {} buffers", handles.len());
        self.announced = Some(handles);
    }

    /// Feeds the handle of a submitted frame.
    pub fn observe(&mut self, handle: ImportHandle) -> PoolStatus {
        if self.complete {
            return PoolStatus::Active;
        }

        if let Some(handles) = self.announced.take() {
            info!("Import pool complete from announcement ({} buffers)", handles.len());
            self.complete = true;
            self.seen = handles.clone();
            return PoolStatus::Ready(handles);
        }

        if self.seen.contains(&handle) {
            info!("Import pool complete, {} repeated ({} buffers)", handle, self.seen.len());
            self.complete = true;
            return PoolStatus::Ready(self.seen.clone());
        }

        debug!("Import pool collecting {}", handle);
        self.seen.push(handle);
        PoolStatus::Collecting
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.announced = None;
        self.complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_handle_completes_the_pool() {
        let mut tracker = ImportPoolTracker::default();
        assert_eq!(tracker.observe(ImportHandle(10)), PoolStatus::Collecting);
        assert_eq!(tracker.observe(ImportHandle(11)), PoolStatus::Collecting);
        assert_eq!(
            tracker.observe(ImportHandle(10)),
            PoolStatus::Ready(vec![ImportHandle(10), ImportHandle(11)])
        );
        assert_eq!(tracker.observe(ImportHandle(11)), PoolStatus::Active);
        assert_eq!(tracker.pool(), &[ImportHandle(10), ImportHandle(11)]);
    }

    #[test]
    fn announcement_wins_when_first() {
        let mut tracker = ImportPoolTracker::default();
        tracker.observe(ImportHandle(1));
        tracker.announce(vec![ImportHandle(1), ImportHandle(2), ImportHandle(3)]);
        assert_eq!(
            tracker.observe(ImportHandle(2)),
            PoolStatus::Ready(vec![ImportHandle(1), ImportHandle(2), ImportHandle(3)])
        );
    }

    #[test]
    fn late_announcement_is_ignored() {
        let mut tracker = ImportPoolTracker::default();
        tracker.observe(ImportHandle(1));
        tracker.observe(ImportHandle(1));
        tracker.announce(vec![ImportHandle(5)]);
        assert!(tracker.is_complete());
        assert_eq!(tracker.observe(ImportHandle(5)), PoolStatus::Active);

        tracker.reset();
        assert_eq!(tracker.observe(ImportHandle(5)), PoolStatus::Collecting);
    }
}
