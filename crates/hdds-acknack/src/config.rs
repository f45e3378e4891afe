// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol constants and reliability tuning knobs - single source of truth.
//!
//! All RTPS constants used by the AckNack engine live here. **NEVER hardcode
//! elsewhere!**

use std::time::Duration;

// =======================================================================
// RTPS submessage constants (OMG DDS-RTPS v2.5 Sec.8.3.7.1 / 8.3.7.10)
// =======================================================================

/// RTPS protocol version carried in the message header.
pub const RTPS_VERSION: [u8; 2] = [2, 3];

/// Vendor id carried in the message header.
pub const RTPS_VENDOR_ID: [u8; 2] = [0x01, 0xaa];

/// ACKNACK submessage id.
pub const SMID_ACKNACK: u8 = 0x06;

/// NACK_FRAG submessage id.
pub const SMID_NACK_FRAG: u8 = 0x12;

/// INFO_TS submessage id.
pub const SMID_INFO_TS: u8 = 0x09;

/// INFO_DST submessage id.
pub const SMID_INFO_DST: u8 = 0x0e;

/// Submessage flag: endianness (1 = little-endian).
pub const SMFLAG_ENDIANNESS: u8 = 0x01;

/// ACKNACK flag: FinalFlag (reader does not require a heartbeat response).
pub const ACKNACK_FLAG_FINAL: u8 = 0x02;

/// Maximum bitmap width of a `SequenceNumberSet` (RTPS v2.5 Sec.9.4.2.6).
pub const SEQUENCE_NUMBER_SET_MAX_BITS: u32 = 256;

/// Maximum bitmap width of a `FragmentNumberSet` (RTPS v2.5 Sec.9.4.2.8).
pub const FRAGMENT_NUMBER_SET_MAX_BITS: u32 = 256;

// Bitmap widths must pack into whole u32 words.
const _: () = assert!(SEQUENCE_NUMBER_SET_MAX_BITS % 32 == 0);
const _: () = assert!(FRAGMENT_NUMBER_SET_MAX_BITS % 32 == 0);

/// Largest possible ACKNACK submessage: header(4) + entityIds(8) + SN(8)
/// + numBits(4) + full bitmap(32) + count(4).
pub const ACKNACK_SIZE_MAX: usize =
    4 + 8 + 8 + 4 + (SEQUENCE_NUMBER_SET_MAX_BITS as usize / 8) + 4;

/// Largest possible NACK_FRAG submessage: header(4) + entityIds(8) + SN(8)
/// + bitmapBase(4) + numBits(4) + full bitmap(32) + count(4).
pub const NACKFRAG_SIZE_MAX: usize =
    4 + 8 + 8 + 4 + 4 + (FRAGMENT_NUMBER_SET_MAX_BITS as usize / 8) + 4;

// =======================================================================
// Reliability tuning
// =======================================================================

/// Reader-side reliability feedback configuration.
///
/// The two delays bound how often a match emits pure ACKs / repeat NACKs;
/// `auto_resched_nack_delay` is the retry interval armed after every NACK so
/// a confused writer cannot stall the match forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Minimum spacing between successive pure ACKs on one match.
    pub ack_delay: Duration,
    /// Minimum spacing between successive NACKs covering the same region.
    pub nack_delay: Duration,
    /// Retry interval armed unconditionally after sending a NACK.
    pub auto_resched_nack_delay: Duration,
    /// Acknowledge only what has been delivered to the application, not
    /// merely received (tail-cut under delivery-queue pressure).
    pub late_ack_mode: bool,
    /// Attach the heartbeat reception timestamp to outgoing AckNacks for
    /// HB-to-ACK latency measurement.
    pub meas_hb_to_ack_latency: bool,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ack_delay: Duration::from_millis(10),
            nack_delay: Duration::from_millis(100),
            auto_resched_nack_delay: Duration::from_secs(1),
            late_ack_mode: false,
            meas_hb_to_ack_latency: false,
        }
    }
}
