// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AckNack/NackFrag generation for one (proxy writer, reader) match.
//!
//! Reconciles three sources of information into one feedback decision: the
//! reorder buffer (missing sequences), the defragmenter (missing fragments
//! of partially received samples), and the history of what was already
//! NACK'd. The outcome classifies as a pure ACK, a NACK, a fragment-only
//! NACK, or a suppressed message, with the AckDelay/NackDelay spacing rules
//! keeping a slow writer from being stormed.
//!
//! Two entry points, both driven by the owning event scheduler:
//! [`ProxyWriter::sched_acknack_if_needed`] predicts whether the event would
//! do anything and arms it accordingly; [`ProxyWriter::make_and_resched_acknack`]
//! runs the same classification, commits the state changes, and builds the
//! outgoing control message.

use std::time::Instant;

use crate::bitmap::{FragmentNumberSet, SequenceNumberSet};
use crate::config::{
    ACKNACK_SIZE_MAX, FRAGMENT_NUMBER_SET_MAX_BITS, NACKFRAG_SIZE_MAX,
    SEQUENCE_NUMBER_SET_MAX_BITS,
};
use crate::event::AckNackEvent;
use crate::msg::{CtrlMsg, CtrlMsgPool};
use crate::proxy::{NackSummary, ProxyWriter, ReaderMatch, SyncState};
use crate::sources::{DefragNackMapResult, ReorderBuffer};

/// Emission reasons carried in the flag nibble when `ack-reason-flags` is on.
#[cfg(feature = "ack-reason-flags")]
mod reason {
    /// NACK region advanced past the previous one.
    pub const REGION_ADVANCED: u8 = 0x10;
    /// Answering a directed heartbeat.
    pub const DIRECTED_HEARTBEAT: u8 = 0x20;
    /// NackDelay expired on an unchanged region.
    pub const NACK_DELAY: u8 = 0x30;
    /// NACK suppressed, demoted to a plain ACK.
    pub const SUPPRESSED: u8 = 0x40;
}

/// Classification of a potential outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckNackOutcome {
    /// Nothing missing: acknowledge through the bitmap base.
    Ack,
    /// Missing data: AckNack with a bitmap, possibly plus a NackFrag.
    Nack,
    /// Only fragments missing and the writer is not owed an ACK: send the
    /// NackFrag alone.
    NackFragOnly,
    /// A pure ACK the writer did not ask for (or asked too recently).
    SuppressedAck,
    /// The NACK would repeat the previous region before NackDelay expired.
    SuppressedNack,
}

/// Bitmap material for one decision.
#[derive(Debug, Clone)]
pub struct AckNackInfo {
    /// Proposed new value for [`ReaderMatch::nack_sent_on_nackdelay`].
    pub nack_sent_on_nackdelay: bool,
    #[cfg(feature = "ack-reason-flags")]
    pub reason: u8,
    /// Missing-sequence bitmap; empty means pure ACK.
    pub acknack: SequenceNumberSet,
    /// Sample whose fragments are NACK'd; 0 means no NackFrag.
    pub nackfrag_seq: u64,
    /// Missing-fragment bitmap, meaningful when `nackfrag_seq > 0`.
    pub nackfrag: FragmentNumberSet,
}

/// Full result of the classifier.
#[derive(Debug, Clone)]
pub struct AckNackDecision {
    pub outcome: AckNackOutcome,
    pub info: AckNackInfo,
    /// Region this decision covers, recorded as `last_nack` on commit.
    pub summary: NackSummary,
}

/// Pick the reorder source for the match: the private catch-up buffer while
/// out of sync or content-filtered, the writer-wide buffer otherwise. Under
/// late-ack mode the base drops back to the delivery checkpoint and a full
/// delivery queue cuts the bitmap tail, so we never NACK data we already
/// accepted but have not delivered.
fn nack_source<'a>(pw: &'a ProxyWriter, rm: &'a ReaderMatch) -> (&'a dyn ReorderBuffer, u64, bool) {
    if rm.sync == SyncState::OutOfSync || rm.filtered {
        if let Some(reorder) = rm.catchup_reorder.as_deref() {
            return (reorder, reorder.next_seq(), false);
        }
        debug_assert!(false, "out-of-sync/filtered match without catch-up reorder");
        let reorder = &*pw.reorder;
        return (reorder, reorder.next_seq(), false);
    }
    let reorder = &*pw.reorder;
    if !pw.config().late_ack_mode {
        (reorder, reorder.next_seq(), false)
    } else {
        let base = pw.next_deliv_seq(reorder.next_seq());
        (reorder, base, pw.dqueue.is_full())
    }
}

/// Build the sequence bitmap, then scan it against the defragmenter: the
/// whole-sample NACK stops at the first missing sample whose fragments are
/// individually tracked, switching to a per-fragment NACK for it. Returns
/// false when there is nothing to NACK at all.
fn make_bitmaps(pw: &ProxyWriter, rm: &ReaderMatch, info: &mut AckNackInfo) -> bool {
    let (reorder, bitmap_base, notail) = nack_source(pw, rm);

    let last_seq = if rm.filtered { rm.last_seq } else { pw.last_seq };
    info.acknack = reorder.nackmap(bitmap_base, last_seq, SEQUENCE_NUMBER_SET_MAX_BITS, notail);
    if info.acknack.is_empty() {
        info.nackfrag_seq = 0;
        return false;
    }

    info.nackfrag_seq = 0;
    let base = info.acknack.base();
    let num_bits = info.acknack.num_bits();
    for i in 0..num_bits {
        if !info.acknack.is_set(i) {
            continue;
        }

        let seq = base + u64::from(i);
        let last_fragnum = (seq == pw.last_seq).then_some(pw.last_fragnum);
        match pw.defrag.nackmap(seq, last_fragnum, FRAGMENT_NUMBER_SET_MAX_BITS) {
            DefragNackMapResult::UnknownSample => {}
            DefragNackMapResult::AllAdvertisedFragmentsKnown => {
                // Cut the NACK short (or make it an ACK if this is the
                // first sample), no NackFrag.
                info.nackfrag_seq = 0;
                info.acknack.truncate(i);
                return i > 0;
            }
            DefragNackMapResult::FragmentsMissing(set) => {
                debug_assert!(!set.is_empty());
                info.nackfrag_seq = seq;
                info.nackfrag = set;
                info.acknack.truncate(i);
                return true;
            }
        }
    }
    true
}

impl ProxyWriter {
    fn delays_passed(&self, rm: &ReaderMatch, tnow: Instant) -> (bool, bool) {
        // duration_since saturates to zero when the clock has not advanced,
        // degrading to "delay not passed" rather than misfiring.
        let ackdelay_passed = tnow.duration_since(rm.t_last_ack) >= self.config().ack_delay;
        let nackdelay_passed = tnow.duration_since(rm.t_last_nack) >= self.config().nack_delay;
        (ackdelay_passed, nackdelay_passed)
    }

    /// Classify what an emission right now would be, without committing
    /// anything.
    pub fn acknack_info(
        &self,
        rm: &ReaderMatch,
        ackdelay_passed: bool,
        nackdelay_passed: bool,
    ) -> AckNackDecision {
        let mut info = AckNackInfo {
            nack_sent_on_nackdelay: false,
            #[cfg(feature = "ack-reason-flags")]
            reason: 0,
            acknack: SequenceNumberSet::empty(1),
            nackfrag_seq: 0,
            nackfrag: FragmentNumberSet::empty(0),
        };

        let summary;
        let mut outcome;
        if !make_bitmaps(self, rm, &mut info) {
            info.nack_sent_on_nackdelay = rm.nack_sent_on_nackdelay;
            summary = NackSummary {
                seq_base: info.acknack.base(),
                seq_end_p1: 0,
                frag_base: 0,
                frag_end_p1: 0,
            };
            outcome = AckNackOutcome::Ack;
        } else {
            let seq_base = info.acknack.base();
            debug_assert!(seq_base >= 1);
            debug_assert!(info.acknack.num_bits() > 0 || info.nackfrag_seq > 0);
            debug_assert!(info.nackfrag_seq == 0 || !info.nackfrag.is_empty());
            let seq_end_p1 = seq_base + u64::from(info.acknack.num_bits());
            let (frag_base, frag_end_p1) = if info.nackfrag_seq > 0 {
                (
                    info.nackfrag.base(),
                    info.nackfrag.base() + info.nackfrag.num_bits(),
                )
            } else {
                (0, 0)
            };
            summary = NackSummary {
                seq_base,
                seq_end_p1,
                frag_base,
                frag_end_p1,
            };

            if seq_base > rm.last_nack.seq_end_p1
                || (seq_base == rm.last_nack.seq_end_p1 && frag_base >= rm.last_nack.frag_end_p1)
            {
                // NACK for something not previously NACK'd.
                info.nack_sent_on_nackdelay = false;
                #[cfg(feature = "ack-reason-flags")]
                {
                    info.reason = reason::REGION_ADVANCED;
                }
                outcome = AckNackOutcome::Nack;
            } else if rm.directed_heartbeat && (!rm.nack_sent_on_nackdelay || nackdelay_passed) {
                info.nack_sent_on_nackdelay = false;
                #[cfg(feature = "ack-reason-flags")]
                {
                    info.reason = reason::DIRECTED_HEARTBEAT;
                }
                outcome = AckNackOutcome::Nack;
            } else if nackdelay_passed {
                info.nack_sent_on_nackdelay = true;
                #[cfg(feature = "ack-reason-flags")]
                {
                    info.reason = reason::NACK_DELAY;
                }
                outcome = AckNackOutcome::Nack;
            } else {
                // Overlap with the previous NACK and NackDelay still
                // running: clear the bitmaps to turn the NACK into an ACK.
                info.nack_sent_on_nackdelay = rm.nack_sent_on_nackdelay;
                #[cfg(feature = "ack-reason-flags")]
                {
                    info.reason = reason::SUPPRESSED;
                }
                info.acknack.truncate(0);
                info.nackfrag_seq = 0;
                outcome = AckNackOutcome::SuppressedNack;
            }
        }

        if matches!(
            outcome,
            AckNackOutcome::Ack | AckNackOutcome::SuppressedNack
        ) {
            // Both end up a pure ACK; send it only if the writer is owed one.
            if !(rm.heartbeat_since_ack && rm.ack_requested) {
                outcome = AckNackOutcome::SuppressedAck; // writer didn't ask for it
            } else if !(summary.seq_base > rm.last_nack.seq_base || ackdelay_passed) {
                outcome = AckNackOutcome::SuppressedAck; // no progress, too soon
            }
        } else if info.acknack.num_bits() == 0 && info.nackfrag_seq > 0 && !rm.ack_requested {
            // Not NACK'ing whole samples and the writer has not asked for an
            // ACK since the last one: skip the AckNack submessage.
            outcome = AckNackOutcome::NackFragOnly;
        }

        AckNackDecision {
            outcome,
            info,
            summary,
        }
    }

    /// Predict what the AckNack event would do at `tnow` and arm it: now
    /// when a message would go out, at the NackDelay expiry when only a
    /// suppressed NACK is on offer, not at all for a suppressed ACK.
    pub fn sched_acknack_if_needed(
        &self,
        rm: &ReaderMatch,
        ev: &AckNackEvent,
        tnow: Instant,
        avoid_suppressed_nack: bool,
    ) {
        let (ackdelay_passed, nackdelay_passed) = self.delays_passed(rm, tnow);
        let decision = self.acknack_info(rm, ackdelay_passed, nackdelay_passed);
        match decision.outcome {
            AckNackOutcome::SuppressedAck => {}
            AckNackOutcome::SuppressedNack if avoid_suppressed_nack => {
                ev.resched_if_earlier(rm.t_last_nack + self.config().nack_delay);
            }
            _ => {
                ev.resched_if_earlier(tnow);
            }
        }
    }

    /// Classify, commit, and build the outgoing control message.
    ///
    /// Returns `None` without touching timestamps when the outcome is
    /// suppressed, when the pool is exhausted, or when the security plugin
    /// drops the message; the armed event (or the writer's next heartbeat)
    /// covers the retry.
    pub fn make_and_resched_acknack(
        &mut self,
        rm: &mut ReaderMatch,
        ev: &AckNackEvent,
        pool: &CtrlMsgPool,
        tnow: Instant,
        avoid_suppressed_nack: bool,
    ) -> Option<CtrlMsg> {
        let (ackdelay_passed, nackdelay_passed) = self.delays_passed(rm, tnow);
        let AckNackDecision {
            outcome,
            info,
            summary,
        } = self.acknack_info(rm, ackdelay_passed, nackdelay_passed);

        match outcome {
            AckNackOutcome::SuppressedAck => return None,
            AckNackOutcome::SuppressedNack if avoid_suppressed_nack => {
                ev.resched_if_earlier(rm.t_last_nack + self.config().nack_delay);
                return None;
            }
            _ => {}
        }

        // Committing to a response: consume the heartbeat flags now. The
        // paths below can still bail out (pool exhausted, security drop);
        // the flags stay consumed and the writer's next heartbeat re-arms
        // them, so the change is not rolled back.
        rm.directed_heartbeat = false;
        rm.heartbeat_since_ack = false;
        rm.heartbeatfrag_since_ack = false;
        rm.nack_sent_on_nackdelay = info.nack_sent_on_nackdelay;

        let participant = self
            .security
            .as_ref()
            .filter(|sec| sec.proxy_participant_is_secure())
            .and_then(|sec| sec.local_participant_for_reader(&rm.rd_guid));

        let mut msg = pool.new_ctrl_msg(
            rm.rd_guid,
            participant,
            ACKNACK_SIZE_MAX + NACKFRAG_SIZE_MAX,
        )?;
        msg.set_destination(self.guid.prefix);

        if self.config().meas_hb_to_ack_latency {
            if let Some(ts) = rm.hb_timestamp.take() {
                // Best effort: nothing guarantees this message answers the
                // heartbeat that set the timestamp.
                msg.add_timestamp(ts);
            }
        }

        #[allow(unused_mut)]
        let mut flags_extra = 0u8;
        #[cfg(feature = "ack-reason-flags")]
        {
            flags_extra = info.reason;
        }

        if outcome != AckNackOutcome::NackFragOnly {
            let wire_count = rm.count.wrapping_add(1);
            let marker = match msg.add_acknack(
                rm.rd_guid.entity_id,
                self.guid.entity_id,
                &info.acknack,
                wire_count,
                flags_extra,
            ) {
                Ok(marker) => marker,
                Err(err) => {
                    log::debug!("[acknack] acknack encode failed: {}", err);
                    return None;
                }
            };
            if log::log_enabled!(log::Level::Trace) {
                let bits: String = (0..info.acknack.num_bits())
                    .map(|i| if info.acknack.is_set(i) { '1' } else { '0' })
                    .collect();
                log::trace!(
                    "[acknack] {}acknack {} -> {}: #{}:{}/{}:{}",
                    if self.have_seen_heartbeat { "" } else { "preemptive " },
                    rm.rd_guid,
                    self.guid,
                    wire_count,
                    info.acknack.base(),
                    info.acknack.num_bits(),
                    bits
                );
            }
            if let Some(sec) = self.security.as_ref() {
                sec.encode_datareader_submsg(&mut msg, marker, &self.guid, &rm.rd_guid);
            }
        }

        if info.nackfrag_seq > 0 {
            let marker = match msg.add_nackfrag(
                rm.rd_guid.entity_id,
                self.guid.entity_id,
                info.nackfrag_seq,
                &info.nackfrag,
                self.nackfragcount,
                flags_extra,
            ) {
                Ok(marker) => marker,
                Err(err) => {
                    log::debug!("[acknack] nackfrag encode failed: {}", err);
                    return None;
                }
            };
            if log::log_enabled!(log::Level::Trace) {
                let bits: String = (0..info.nackfrag.num_bits())
                    .map(|i| if info.nackfrag.is_set(i) { '1' } else { '0' })
                    .collect();
                log::trace!(
                    "[acknack] nackfrag #{}:{}/{}/{}:{}",
                    self.nackfragcount,
                    info.nackfrag_seq,
                    info.nackfrag.base() + 1,
                    info.nackfrag.num_bits(),
                    bits
                );
            }
            if let Some(sec) = self.security.as_ref() {
                sec.encode_datareader_submsg(&mut msg, marker, &self.guid, &rm.rd_guid);
            }
        }

        if msg.size() == 0 {
            // The encoding attempt dropped the message.
            return None;
        }

        rm.count = rm.count.wrapping_add(1);
        match outcome {
            AckNackOutcome::Ack => {
                rm.ack_requested = false;
                rm.t_last_ack = tnow;
                rm.last_nack.seq_base = summary.seq_base;
            }
            AckNackOutcome::Nack | AckNackOutcome::NackFragOnly => {
                if summary.frag_end_p1 != 0 {
                    self.nackfragcount = self.nackfragcount.wrapping_add(1);
                }
                if outcome != AckNackOutcome::NackFragOnly {
                    rm.ack_requested = false;
                    rm.t_last_ack = tnow;
                }
                rm.last_nack = summary;
                rm.t_last_nack = tnow;
                // Even though an ACKNACK is only owed in response to a
                // HEARTBEAT, writers have been seen to lose track; retry
                // unconditionally rather than give up.
                ev.resched_if_earlier(tnow + self.config().auto_resched_nack_delay);
            }
            AckNackOutcome::SuppressedNack => {
                rm.ack_requested = false;
                rm.t_last_ack = tnow;
                rm.last_nack.seq_base = summary.seq_base;
                ev.resched_if_earlier(rm.t_last_nack + self.config().nack_delay);
            }
            AckNackOutcome::SuppressedAck => unreachable!("suppressed ACK returns early"),
        }

        log::debug!(
            "[acknack] send acknack (rd {} -> pwr {})",
            rm.rd_guid,
            self.guid
        );
        Some(msg)
    }
}
