// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy writer and per-reader match state.
//!
//! `ProxyWriter` is the local picture of one remote writer; `ReaderMatch` is
//! the state of one local reader's relationship with it. The AckNack engine
//! in [`crate::acknack`] reads the former and owns all mutation of the
//! latter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ReliabilityConfig;
use crate::msg::SourceTimestamp;
use crate::sources::{Defragmenter, DeliveryQueue, ReorderBuffer, SecurityPlugin};
use crate::types::Guid;

// ============================================================================
// Delivery progress (low-word checkpoint)
// ============================================================================

/// Published progress of the delivery thread.
///
/// The delivery queue advances a 64-bit "next to deliver" counter, but only
/// its low 32 bits are shared, with relaxed ordering on both sides. The
/// reader reconstructs the full value against an upper bound it knows
/// (`next_seq`); see [`ProxyWriter::next_deliv_seq`]. No acquire/release
/// pairing is needed: a stale value only shrinks the acknowledged region.
#[derive(Debug, Clone)]
pub struct DeliveryProgress {
    lowword: Arc<AtomicU32>,
}

impl DeliveryProgress {
    /// New progress handle starting at sequence 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lowword: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Publish the low word of the next sequence number to be delivered.
    /// Called by the delivery thread each time its head advances.
    pub fn publish(&self, next_deliv_seq: u64) {
        self.lowword.store(next_deliv_seq as u32, Ordering::Relaxed);
    }

    fn load_lowword(&self) -> u32 {
        self.lowword.load(Ordering::Relaxed)
    }
}

impl Default for DeliveryProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Proxy writer
// ============================================================================

/// Local representation of a remote writer.
pub struct ProxyWriter {
    /// Remote writer identity.
    pub guid: Guid,
    /// Highest sequence number heard about from this writer.
    pub last_seq: u64,
    /// Highest fragment index known for `last_seq` (0-based).
    pub last_fragnum: u32,
    /// True once any heartbeat arrived; until then AckNacks are pre-emptive.
    pub have_seen_heartbeat: bool,
    /// Writer-wide in-order tracker.
    pub reorder: Box<dyn ReorderBuffer>,
    /// Writer-wide fragment tracker.
    pub defrag: Box<dyn Defragmenter>,
    /// Queue between the reorder buffer and the application.
    pub dqueue: Arc<dyn DeliveryQueue>,
    /// Optional DDS Security integration.
    pub security: Option<Arc<dyn SecurityPlugin>>,
    /// Tags each emitted NackFrag; bumped once per emission.
    pub(crate) nackfragcount: u32,
    pub(crate) config: Arc<ReliabilityConfig>,
    deliv: DeliveryProgress,
}

impl ProxyWriter {
    pub fn new(
        guid: Guid,
        reorder: Box<dyn ReorderBuffer>,
        defrag: Box<dyn Defragmenter>,
        dqueue: Arc<dyn DeliveryQueue>,
        config: Arc<ReliabilityConfig>,
    ) -> Self {
        Self {
            guid,
            last_seq: 0,
            last_fragnum: 0,
            have_seen_heartbeat: false,
            reorder,
            defrag,
            dqueue,
            security: None,
            nackfragcount: 0,
            config,
            deliv: DeliveryProgress::new(),
        }
    }

    /// Handle for the delivery thread to publish its progress.
    #[must_use]
    pub fn delivery_progress(&self) -> DeliveryProgress {
        self.deliv.clone()
    }

    /// Latch heartbeat reception (receive path).
    pub fn note_heartbeat(&mut self) {
        self.have_seen_heartbeat = true;
    }

    #[must_use]
    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Current NackFrag emission counter.
    #[must_use]
    pub fn nackfragcount(&self) -> u32 {
        self.nackfragcount
    }

    /// Next sequence number to be delivered to in-sync readers, which is
    /// what we may acknowledge: `next_seq` tracks what was *received*, the
    /// delivery queue lags behind it.
    ///
    /// Only the low word of the counter is published. With
    /// `next_seq - N <= nd <= next_seq` for `N << 2^32`, the high word of
    /// the true value is `H(next_seq)` or `H(next_seq) - 1`, and gluing
    /// `H(next_seq)` to the published low word overshoots `next_seq` exactly
    /// when it should have been `H(next_seq) - 1`. Reading a stale low word
    /// merely under-approximates, which acknowledges slightly less than it
    /// could.
    #[must_use]
    pub fn next_deliv_seq(&self, next_seq: u64) -> u64 {
        let lw = u64::from(self.deliv.load_lowword());
        let mut nd = (next_seq & !u64::from(u32::MAX)) | lw;
        if nd > next_seq {
            nd = nd.wrapping_sub(1 << 32);
        }
        debug_assert!(
            nd >= 1 && nd <= next_seq,
            "next_deliv_seq {} out of [1, {}]",
            nd,
            next_seq
        );
        nd.clamp(1, next_seq)
    }
}

// ============================================================================
// Reader match
// ============================================================================

/// Synchronization state of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Tracking the writer through the writer-wide reorder buffer.
    InSync,
    /// Catching up through a private reorder buffer.
    OutOfSync,
    /// Waiting for historical (transient-local) data before going in sync.
    TransientLocalWait,
}

/// Region covered by the previously sent NACK:
/// `[seq_base:0 .. seq_end_p1:0)` plus, when `frag_end_p1 > 0`,
/// `[seq_end_p1:frag_base .. seq_end_p1:frag_end_p1)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackSummary {
    pub seq_base: u64,
    pub seq_end_p1: u64,
    pub frag_base: u32,
    pub frag_end_p1: u32,
}

/// Per (reader, proxy writer) reliability state.
///
/// Mutated only by the AckNack engine (commit path) and the heartbeat
/// receive path; the scheduler serializes the two per match.
pub struct ReaderMatch {
    /// Local reader identity.
    pub rd_guid: Guid,
    pub sync: SyncState,
    /// Reader has a content filter and tracks its own high-water mark.
    pub filtered: bool,
    /// Reader-local last sequence; meaningful only when `filtered`.
    pub last_seq: u64,
    /// Private reorder buffer; present whenever `sync` is `OutOfSync` or
    /// `filtered` is set.
    pub catchup_reorder: Option<Box<dyn ReorderBuffer>>,
    /// AckNack emission counter (wire field).
    pub count: u32,
    pub last_nack: NackSummary,
    /// Sticky: the last NACK was motivated by the NackDelay timer, not by
    /// new missing data.
    pub nack_sent_on_nackdelay: bool,
    pub heartbeat_since_ack: bool,
    pub heartbeatfrag_since_ack: bool,
    /// Writer requested an acknowledgment.
    pub ack_requested: bool,
    /// Last heartbeat was unicast-directed at this reader.
    pub directed_heartbeat: bool,
    pub t_last_ack: Instant,
    pub t_last_nack: Instant,
    /// Reception time of the heartbeat to measure HB-to-ACK latency
    /// against; consumed by the next emission.
    pub hb_timestamp: Option<SourceTimestamp>,
}

impl ReaderMatch {
    pub fn new(rd_guid: Guid, tnow: Instant) -> Self {
        Self {
            rd_guid,
            sync: SyncState::InSync,
            filtered: false,
            last_seq: 0,
            catchup_reorder: None,
            count: 0,
            last_nack: NackSummary::default(),
            nack_sent_on_nackdelay: false,
            heartbeat_since_ack: false,
            heartbeatfrag_since_ack: false,
            ack_requested: false,
            directed_heartbeat: false,
            t_last_ack: tnow,
            t_last_nack: tnow,
            hb_timestamp: None,
        }
    }

    /// Bookkeeping for a received heartbeat (receive path).
    ///
    /// `response_required` is the inverse of the heartbeat's FINAL flag;
    /// `timestamp` is the reception time when HB-to-ACK latency measurement
    /// is on.
    pub fn on_heartbeat(
        &mut self,
        directed: bool,
        response_required: bool,
        timestamp: Option<SourceTimestamp>,
    ) {
        self.heartbeat_since_ack = true;
        if response_required {
            self.ack_requested = true;
        }
        if directed {
            self.directed_heartbeat = true;
        }
        if timestamp.is_some() {
            self.hb_timestamp = timestamp;
        }
    }

    /// Bookkeeping for a received HEARTBEAT_FRAG (receive path).
    pub fn on_heartbeat_frag(&mut self) {
        self.heartbeatfrag_since_ack = true;
    }
}
