//! Queue and socket counters
//!
//! Counters are relaxed `AtomicU64`s bumped from the data path and read as
//! plain snapshots by the control plane.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// RX queue inspection counters
#[derive(Debug, Default)]
pub struct RxQueueStats {
    /// Receive batches dispatched
    inspect_batches: AtomicU64,
    /// Frames passed to the regular stack
    inspect_frames_passed: AtomicU64,
    /// Frames dropped by a rule
    inspect_frames_dropped: AtomicU64,
    /// Frames redirected to a socket
    inspect_frames_redirected: AtomicU64,
    /// Frames reflected back out by L2 forwarding
    inspect_frames_forwarded: AtomicU64,
    /// Redirect batches handed to a socket
    redirect_batches: AtomicU64,
    /// Headers copied into scratch storage because they spanned buffers
    header_copies: AtomicU64,
}

impl RxQueueStats {
    /// Create new statistics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a receive batch
    pub fn record_batch(&self) {
        self.inspect_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a passed frame
    pub fn record_passed(&self) {
        self.inspect_frames_passed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped frame
    pub fn record_dropped(&self) {
        self.inspect_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a redirected frame
    pub fn record_redirected(&self) {
        self.inspect_frames_redirected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a forwarded frame
    pub fn record_forwarded(&self) {
        self.inspect_frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a redirect batch handed to its target
    pub fn record_redirect_batch(&self) {
        self.redirect_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record scratch header copies
    pub fn record_header_copies(&self, count: u64) {
        if count > 0 {
            self.header_copies.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> RxQueueStatsSnapshot {
        RxQueueStatsSnapshot {
            inspect_batches: self.inspect_batches.load(Ordering::Relaxed),
            inspect_frames_passed: self.inspect_frames_passed.load(Ordering::Relaxed),
            inspect_frames_dropped: self.inspect_frames_dropped.load(Ordering::Relaxed),
            inspect_frames_redirected: self.inspect_frames_redirected.load(Ordering::Relaxed),
            inspect_frames_forwarded: self.inspect_frames_forwarded.load(Ordering::Relaxed),
            redirect_batches: self.redirect_batches.load(Ordering::Relaxed),
            header_copies: self.header_copies.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`RxQueueStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RxQueueStatsSnapshot {
    /// Receive batches dispatched
    pub inspect_batches: u64,
    /// Frames passed
    pub inspect_frames_passed: u64,
    /// Frames dropped
    pub inspect_frames_dropped: u64,
    /// Frames redirected
    pub inspect_frames_redirected: u64,
    /// Frames forwarded
    pub inspect_frames_forwarded: u64,
    /// Redirect batches flushed
    pub redirect_batches: u64,
    /// Scratch header copies
    pub header_copies: u64,
}

impl RxQueueStatsSnapshot {
    /// Frames that reached a verdict
    pub fn inspected(&self) -> u64 {
        self.inspect_frames_passed
            + self.inspect_frames_dropped
            + self.inspect_frames_redirected
            + self.inspect_frames_forwarded
    }
}

/// TX queue counters
#[derive(Debug, Default)]
pub struct TxQueueStats {
    /// Transmit flushes requested by the interface
    transmit_flushes: AtomicU64,
    /// Frames produced onto the frame ring
    frames_produced: AtomicU64,
    /// Frames completed back to the client
    frames_completed: AtomicU64,
}

impl TxQueueStats {
    /// Create new statistics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transmit flush that produced `produced` frames
    pub fn record_flush(&self, produced: u64) {
        self.transmit_flushes.fetch_add(1, Ordering::Relaxed);
        self.frames_produced.fetch_add(produced, Ordering::Relaxed);
    }

    /// Record completed frames
    pub fn record_completions(&self, count: u64) {
        self.frames_completed.fetch_add(count, Ordering::Relaxed);
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> TxQueueStatsSnapshot {
        TxQueueStatsSnapshot {
            transmit_flushes: self.transmit_flushes.load(Ordering::Relaxed),
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`TxQueueStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxQueueStatsSnapshot {
    /// Transmit flushes
    pub transmit_flushes: u64,
    /// Frames produced
    pub frames_produced: u64,
    /// Frames completed
    pub frames_completed: u64,
}

/// Socket counters
#[derive(Debug, Default)]
pub struct XskStats {
    rx_dropped: AtomicU64,
    rx_truncated: AtomicU64,
    rx_invalid_descriptors: AtomicU64,
    tx_invalid_descriptors: AtomicU64,
}

impl XskStats {
    /// Create new statistics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record frames dropped for lack of RX or fill ring space
    pub fn record_rx_dropped(&self, count: u64) {
        if count > 0 {
            self.rx_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record a frame truncated to the chunk size
    pub fn record_rx_truncated(&self) {
        self.rx_truncated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bad fill ring address
    pub fn record_rx_invalid_descriptor(&self) {
        self.rx_invalid_descriptors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected TX descriptor
    pub fn record_tx_invalid_descriptor(&self) {
        self.tx_invalid_descriptors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> XskStatistics {
        XskStatistics {
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_truncated: self.rx_truncated.load(Ordering::Relaxed),
            rx_invalid_descriptors: self.rx_invalid_descriptors.load(Ordering::Relaxed),
            tx_invalid_descriptors: self.tx_invalid_descriptors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`XskStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct XskStatistics {
    /// Frames dropped for lack of RX or fill ring space
    pub rx_dropped: u64,
    /// Frames truncated to the chunk size
    pub rx_truncated: u64,
    /// Fill ring addresses outside the payload area
    pub rx_invalid_descriptors: u64,
    /// TX descriptors rejected
    pub tx_invalid_descriptors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_stats_snapshot() {
        let stats = RxQueueStats::new();
        stats.record_batch();
        stats.record_passed();
        stats.record_passed();
        stats.record_redirected();
        stats.record_redirect_batch();
        stats.record_header_copies(0);
        stats.record_header_copies(3);

        let snap = stats.snapshot();
        assert_eq!(snap.inspect_batches, 1);
        assert_eq!(snap.inspect_frames_passed, 2);
        assert_eq!(snap.inspect_frames_redirected, 1);
        assert_eq!(snap.redirect_batches, 1);
        assert_eq!(snap.header_copies, 3);
        assert_eq!(snap.inspected(), 3);
    }

    #[test]
    fn test_xsk_stats_serialize() {
        let stats = XskStats::new();
        stats.record_rx_dropped(2);
        stats.record_tx_invalid_descriptor();

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["rx_dropped"], 2);
        assert_eq!(json["tx_invalid_descriptors"], 1);
        assert_eq!(json["rx_truncated"], 0);
    }
}
