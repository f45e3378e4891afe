// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hdds-acknack - Reader-side RTPS reliability feedback
//!
//! For each proxy writer a local reader is matched with, this crate decides
//! WHEN to transmit an AckNack (and optional NackFrag) control message and
//! WHAT to put in it, so the writer learns which sequence numbers and which
//! fragments are still missing - while suppressing the redundant messages
//! that would storm it.
//!
//! ## Protocol Flow
//!
//! ```text
//! Writer                                    Reader
//!   |--- DATA (seq=10) ----------------------->|
//!   |--- DATA (seq=11) ---------X (lost)       |
//!   |--- DATA (seq=12) ----------------------->|
//!   |                                          |
//!   |--- HEARTBEAT (first=10, last=12) ------->|  heartbeat_since_ack,
//!   |                                          |  ack_requested latched
//!   |<-- ACKNACK (base=11, bits=1) ------------|  event fires, NACK
//!   |                                          |
//!   |--- DATA (seq=11) [retransmit] ---------->|  gap filled
//!   |<-- ACKNACK (base=13, numbits=0) ---------|  pure ACK
//! ```
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`ProxyWriter`] / [`ReaderMatch`] | Per-writer and per-match reliability state |
//! | [`DeliveryProgress`] | Lock-free low-word checkpoint of the delivery thread |
//! | [`SequenceNumberSet`] / [`FragmentNumberSet`] | NACK bitmaps (256 bits, MSB-first) |
//! | [`AckNackEvent`] | Rearm-if-earlier retry event owned by the scheduler |
//! | [`CtrlMsgPool`] / [`CtrlMsg`] | Bounded control-message builder and packet assembly |
//! | [`ReorderBuffer`] / [`Defragmenter`] / [`DeliveryQueue`] | Seams to the hosting stack |
//!
//! The decision logic itself lives in [`acknack`]:
//! [`ProxyWriter::sched_acknack_if_needed`] predicts and arms,
//! [`ProxyWriter::make_and_resched_acknack`] commits and builds.
//!
//! ## See Also
//!
//! - [RTPS v2.5 Sec.8.3.7.1 / 8.3.7.10](https://www.omg.org/spec/DDSI-RTPS/2.5/) -
//!   ACKNACK and NACK_FRAG submessages

/// AckNack/NackFrag decision engine and commit path.
pub mod acknack;
/// Sequence and fragment number set bitmaps.
pub mod bitmap;
/// Protocol constants and reliability tuning knobs.
pub mod config;
/// Retry event (rearm-if-earlier).
pub mod event;
/// Control-message builder, pool, and wire serialization.
pub mod msg;
/// Proxy writer and reader match state.
pub mod proxy;
/// Seams to the reorder buffer, defragmenter, delivery queue, and security.
pub mod sources;
/// RTPS identity types.
pub mod types;

pub use acknack::{AckNackDecision, AckNackInfo, AckNackOutcome};
pub use bitmap::{FragmentNumberSet, SequenceNumberSet};
pub use config::{
    ReliabilityConfig, ACKNACK_SIZE_MAX, FRAGMENT_NUMBER_SET_MAX_BITS, NACKFRAG_SIZE_MAX,
    SEQUENCE_NUMBER_SET_MAX_BITS,
};
pub use event::AckNackEvent;
pub use msg::{CtrlMsg, CtrlMsgPool, EncodeError, SourceTimestamp, SubmsgMarker};
pub use proxy::{DeliveryProgress, NackSummary, ProxyWriter, ReaderMatch, SyncState};
pub use sources::{
    DefragNackMapResult, Defragmenter, DeliveryQueue, ReorderBuffer, SecurityPlugin,
};
pub use types::{EntityId, Guid, GuidPrefix};
