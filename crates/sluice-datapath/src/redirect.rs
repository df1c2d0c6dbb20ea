//! Redirect batching
//!
//! Frames matched by a redirect rule are collected per target and handed over
//! in one call, so a socket takes its ring cursors once per batch instead of
//! once per frame. The batch lives in the RX queue's datapath state and never
//! outlives a `receive` call.

use crate::program::RedirectTarget;
use crate::rx::RxRings;
use crate::stats::RxQueueStats;

/// Frames collected before the batch is flushed
pub const REDIRECT_BATCH_CAPACITY: usize = 32;

/// Open redirect batch of one RX queue
pub(crate) struct RedirectContext {
    queue_id: u64,
    target: Option<RedirectTarget>,
    frames: Vec<(u32, u32)>,
}

impl RedirectContext {
    pub(crate) fn new(queue_id: u64) -> Self {
        Self {
            queue_id,
            target: None,
            frames: Vec::with_capacity(REDIRECT_BATCH_CAPACITY),
        }
    }

    /// Append a frame, flushing first if the target changed or the batch is
    /// full
    pub(crate) fn redirect(
        &mut self,
        rings: &RxRings,
        stats: &RxQueueStats,
        frame_index: u32,
        fragment_index: u32,
        target: &RedirectTarget,
    ) {
        let same = self
            .target
            .as_ref()
            .is_some_and(|open| open.same_target(target));
        if !same || self.frames.len() == REDIRECT_BATCH_CAPACITY {
            self.flush(rings, stats);
            self.target = Some(target.clone());
        }
        self.frames.push((frame_index, fragment_index));
    }

    /// Hand the open batch to its target
    pub(crate) fn flush(&mut self, rings: &RxRings, stats: &RxQueueStats) {
        if let Some(target) = &self.target
            && !self.frames.is_empty()
        {
            match target {
                RedirectTarget::Xsk(xsk) => {
                    xsk.datapath()
                        .receive_batch(rings, self.queue_id, &self.frames)
                }
            }
            stats.record_redirect_batch();
            tracing::trace!(queue = self.queue_id, frames = self.frames.len(), "flushed redirect batch");
        }
        self.frames.clear();
    }

    /// Forget the open batch and its target reference
    pub(crate) fn reset(&mut self) {
        self.target = None;
        self.frames.clear();
    }
}
