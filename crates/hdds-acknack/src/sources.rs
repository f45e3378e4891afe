// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Seams to the surrounding stack.
//!
//! The AckNack engine reconciles three sources of truth it does not own: the
//! reorder buffer (which sequences are still missing), the defragmenter
//! (which fragments of a partially received sample are still missing), and
//! the delivery queue (how far behind the application is). These traits are
//! implemented by the hosting stack; the engine only consumes them.

use crate::bitmap::{FragmentNumberSet, SequenceNumberSet};
use crate::msg::{CtrlMsg, SubmsgMarker};
use crate::types::Guid;

/// In-order sequence tracker producing gap bitmaps.
pub trait ReorderBuffer: Send {
    /// Next sequence number not yet accepted by this buffer.
    fn next_seq(&self) -> u64;

    /// Build the missing-sequence bitmap starting at `bitmap_base`, bounded
    /// by `last_seq` (the highest sequence heard about from the writer) and
    /// `max_bits`. The returned set's base equals `bitmap_base` even when no
    /// bit is set (the empty set is a pure ACK up to `bitmap_base`).
    ///
    /// With `notail` set, sequences past the highest one already accepted by
    /// the buffer are left out of the map: under delivery-queue pressure we
    /// must not NACK data the writer sent and we accepted but have not yet
    /// delivered.
    fn nackmap(&self, bitmap_base: u64, last_seq: u64, max_bits: u32, notail: bool)
        -> SequenceNumberSet;
}

/// Verdict of the defragmenter for one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefragNackMapResult {
    /// The defragmenter holds no fragments of this sample.
    UnknownSample,
    /// Every advertised fragment is present; the sample merely awaits
    /// reassembly or delivery.
    AllAdvertisedFragmentsKnown,
    /// Some fragments are missing; the set says which (0-based).
    FragmentsMissing(FragmentNumberSet),
}

/// Per-sample fragment tracker.
pub trait Defragmenter: Send {
    /// Build the missing-fragment map for `seq`.
    ///
    /// `last_fragnum` is the highest fragment index known for the sample
    /// when the caller has that information (i.e. `seq` is the writer's most
    /// recent sample), `None` otherwise.
    fn nackmap(&self, seq: u64, last_fragnum: Option<u32>, max_bits: u32) -> DefragNackMapResult;
}

/// The delivery queue between the reorder buffer and the application.
pub trait DeliveryQueue: Send + Sync {
    /// True when the queue is saturated and accepting more data would only
    /// grow the backlog.
    fn is_full(&self) -> bool;
}

/// Optional DDS Security integration.
///
/// Covers the two capabilities the engine needs from a security plugin: the
/// submessage protection hook, and resolving the local participant behind a
/// reader (required to key the protection of messages towards a secure
/// remote participant).
pub trait SecurityPlugin: Send + Sync {
    /// True when the remote (proxy) participant runs with DDS Security.
    fn proxy_participant_is_secure(&self) -> bool;

    /// Local participant GUID owning `rd_guid`, if any.
    fn local_participant_for_reader(&self, rd_guid: &Guid) -> Option<Guid>;

    /// Protect the submessage identified by `marker`. A plugin that cannot
    /// encode the submessage clears the whole message; the caller detects
    /// that through `CtrlMsg::size() == 0` and drops it.
    fn encode_datareader_submsg(
        &self,
        msg: &mut CtrlMsg,
        marker: SubmsgMarker,
        pw_guid: &Guid,
        rd_guid: &Guid,
    );
}
