// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control message builder and submessage serialization.
//!
//! A `CtrlMsg` accumulates submessages sequentially; the trailing `count`
//! field of ACKNACK/NACKFRAG sits at a variable offset behind the bitmap, so
//! appending fields in wire order (and patching `octetsToNextHeader` when the
//! submessage closes) avoids all offset arithmetic.
//!
//! ACKNACK wire shape (RTPS v2.5 Sec.8.3.7.1):
//!
//! ```text
//! +------------------+
//! | smhdr            |  4 bytes (id=0x06, flags=E|FINAL, octetsToNextHeader)
//! | readerId         |  4 bytes
//! | writerId         |  4 bytes
//! | readerSNState:   |
//! |   bitmapBase     |  8 bytes (SN: high i32, low u32)
//! |   numBits        |  4 bytes
//! |   bitmap[]       |  ceil(numBits/32) x 4 bytes
//! | count            |  4 bytes
//! +------------------+
//! ```
//!
//! NACK_FRAG (Sec.8.3.7.10) has the same shape with `writerSN` in place of
//! the SN bitmap base and a u32 `fragmentNumberState.bitmapBase` that is
//! 1-based on the wire.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::bitmap::{word_count_for_bits, FragmentNumberSet, SequenceNumberSet};
use crate::config::{
    ACKNACK_FLAG_FINAL, FRAGMENT_NUMBER_SET_MAX_BITS, RTPS_VENDOR_ID, RTPS_VERSION,
    SEQUENCE_NUMBER_SET_MAX_BITS, SMFLAG_ENDIANNESS, SMID_ACKNACK, SMID_INFO_DST, SMID_INFO_TS,
    SMID_NACK_FRAG,
};
use crate::types::{EntityId, Guid, GuidPrefix};

/// Result type for submessage encoding.
pub type EncodeResult<T> = Result<T, EncodeError>;

/// Errors raised while building a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Submessage body exceeds the u16 `octetsToNextHeader` range.
    SubmessageTooLong,
    /// Invalid parameter provided.
    InvalidParameter(&'static str),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubmessageTooLong => write!(f, "submessage exceeds octetsToNextHeader range"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
        }
    }
}

impl std::error::Error for EncodeError {}

// ============================================================================
// Source timestamp (INFO_TS payload)
// ============================================================================

/// Wall-clock timestamp carried in an INFO_TS submessage.
///
/// Stored as nanoseconds since the UNIX epoch, converted to the RTPS
/// seconds + 2^-32 fraction format at the serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTimestamp {
    nanos: u64,
}

impl SourceTimestamp {
    /// Timestamp for the current system time.
    #[must_use]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| {
                log::debug!("[acknack] system time before UNIX epoch, using timestamp 0");
                Duration::from_secs(0)
            });
        Self {
            nanos: duration.as_nanos() as u64,
        }
    }

    #[must_use]
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    #[must_use]
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Convert to RTPS (seconds, fraction) with saturation on overflow.
    #[must_use]
    pub fn to_rtps(&self) -> (i32, u32) {
        let seconds = i32::try_from(self.nanos / 1_000_000_000).unwrap_or(i32::MAX);
        let remainder = self.nanos % 1_000_000_000;
        let fraction = ((remainder << 32) / 1_000_000_000) as u32;
        (seconds, fraction)
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Bounds the number of control messages alive at once.
///
/// Exhaustion is transient: the caller returns no message and the armed retry
/// event covers the gap.
#[derive(Debug)]
pub struct CtrlMsgPool {
    max_outstanding: usize,
    outstanding: Arc<AtomicUsize>,
}

impl CtrlMsgPool {
    #[must_use]
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            max_outstanding,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Messages currently alive.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Allocate a control message bound to `rd_guid` (and, under DDS
    /// Security, the local participant behind it). `None` when the pool is
    /// exhausted.
    #[must_use]
    pub fn new_ctrl_msg(
        &self,
        rd_guid: Guid,
        participant: Option<Guid>,
        capacity: usize,
    ) -> Option<CtrlMsg> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_outstanding).then_some(n + 1)
            })
            .ok()?;
        Some(CtrlMsg {
            rd_guid,
            participant,
            dst: None,
            timestamp: None,
            submsgs: Vec::with_capacity(capacity),
            _slot: PoolSlot {
                outstanding: Arc::clone(&self.outstanding),
            },
        })
    }
}

/// RAII pool slot; releases on drop so every exit path returns the builder.
#[derive(Debug)]
struct PoolSlot {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Control message
// ============================================================================

/// Start offset of one submessage inside a `CtrlMsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmsgMarker(usize);

/// Outgoing control message: a sequence of submessages plus out-of-band
/// destination and timestamp, materialized into a full RTPS packet at send
/// time.
#[derive(Debug)]
pub struct CtrlMsg {
    rd_guid: Guid,
    participant: Option<Guid>,
    dst: Option<GuidPrefix>,
    timestamp: Option<SourceTimestamp>,
    submsgs: Vec<u8>,
    _slot: PoolSlot,
}

impl CtrlMsg {
    /// Reader this message originates from.
    #[must_use]
    pub fn reader_guid(&self) -> &Guid {
        &self.rd_guid
    }

    /// Local participant for secure encoding, when bound.
    #[must_use]
    pub fn participant(&self) -> Option<&Guid> {
        self.participant.as_ref()
    }

    /// Address the message to the proxy writer's participant.
    pub fn set_destination(&mut self, prefix: GuidPrefix) {
        self.dst = Some(prefix);
    }

    #[must_use]
    pub fn destination(&self) -> Option<&GuidPrefix> {
        self.dst.as_ref()
    }

    /// Attach a source timestamp, emitted as INFO_TS ahead of the
    /// submessages at packet assembly.
    pub fn add_timestamp(&mut self, ts: SourceTimestamp) {
        self.timestamp = Some(ts);
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<SourceTimestamp> {
        self.timestamp
    }

    /// Accumulated submessage bytes. Zero means nothing to send.
    #[must_use]
    pub fn size(&self) -> usize {
        self.submsgs.len()
    }

    /// Drop all submessage content (a security plugin that cannot encode the
    /// message uses this to force the caller to discard it).
    pub fn clear(&mut self) {
        self.submsgs.clear();
    }

    /// Raw bytes of the submessage at `marker`, header included.
    #[must_use]
    pub fn submsg_bytes(&self, marker: SubmsgMarker) -> &[u8] {
        let len = 4 + u16::from_le_bytes([self.submsgs[marker.0 + 2], self.submsgs[marker.0 + 3]])
            as usize;
        &self.submsgs[marker.0..marker.0 + len]
    }

    /// Mutable view of the submessage at `marker` (security transforms).
    #[must_use]
    pub fn submsg_bytes_mut(&mut self, marker: SubmsgMarker) -> &mut [u8] {
        let len = 4 + u16::from_le_bytes([self.submsgs[marker.0 + 2], self.submsgs[marker.0 + 3]])
            as usize;
        &mut self.submsgs[marker.0..marker.0 + len]
    }

    fn begin_submsg(&mut self, id: u8, flags: u8) -> SubmsgMarker {
        let marker = SubmsgMarker(self.submsgs.len());
        self.submsgs.push(id);
        self.submsgs.push(flags);
        self.submsgs.extend_from_slice(&0u16.to_le_bytes());
        marker
    }

    fn end_submsg(&mut self, marker: SubmsgMarker) -> EncodeResult<()> {
        let body_len = self.submsgs.len() - marker.0 - 4;
        let body_len = u16::try_from(body_len).map_err(|_| EncodeError::SubmessageTooLong)?;
        self.submsgs[marker.0 + 2..marker.0 + 4].copy_from_slice(&body_len.to_le_bytes());
        Ok(())
    }

    fn put_u32(&mut self, value: u32) {
        self.submsgs.extend_from_slice(&value.to_le_bytes());
    }

    fn put_sn(&mut self, sn: u64) {
        let high = (sn >> 32) as i32;
        let low = sn as u32;
        self.submsgs.extend_from_slice(&high.to_le_bytes());
        self.submsgs.extend_from_slice(&low.to_le_bytes());
    }

    fn put_entity_id(&mut self, id: EntityId) {
        self.submsgs.extend_from_slice(&id);
    }

    /// Append an ACKNACK submessage. The FINAL flag is always set: in steady
    /// state we do not want a heartbeat in response to an acknowledgment.
    /// `flags_extra` carries the optional reason nibble (0 by default).
    pub fn add_acknack(
        &mut self,
        reader_id: EntityId,
        writer_id: EntityId,
        set: &SequenceNumberSet,
        count: u32,
        flags_extra: u8,
    ) -> EncodeResult<SubmsgMarker> {
        if set.num_bits() > SEQUENCE_NUMBER_SET_MAX_BITS {
            return Err(EncodeError::InvalidParameter("readerSNState too wide"));
        }
        let marker =
            self.begin_submsg(SMID_ACKNACK, SMFLAG_ENDIANNESS | ACKNACK_FLAG_FINAL | flags_extra);
        self.put_entity_id(reader_id);
        self.put_entity_id(writer_id);
        self.put_sn(set.base());
        self.put_u32(set.num_bits());
        for w in 0..set.word_count() {
            self.put_u32(set.word(w));
        }
        self.put_u32(count);
        self.end_submsg(marker)?;
        Ok(marker)
    }

    /// Append a NACK_FRAG submessage for sample `writer_sn`. The fragment
    /// base converts to 1-based exactly here, at the serialization boundary.
    pub fn add_nackfrag(
        &mut self,
        reader_id: EntityId,
        writer_id: EntityId,
        writer_sn: u64,
        set: &FragmentNumberSet,
        count: u32,
        flags_extra: u8,
    ) -> EncodeResult<SubmsgMarker> {
        if set.is_empty() || set.num_bits() > FRAGMENT_NUMBER_SET_MAX_BITS {
            return Err(EncodeError::InvalidParameter(
                "fragmentNumberState empty or too wide",
            ));
        }
        let marker = self.begin_submsg(SMID_NACK_FRAG, SMFLAG_ENDIANNESS | flags_extra);
        self.put_entity_id(reader_id);
        self.put_entity_id(writer_id);
        self.put_sn(writer_sn);
        self.put_u32(set.base() + 1);
        self.put_u32(set.num_bits());
        for w in 0..set.word_count() {
            self.put_u32(set.word(w));
        }
        self.put_u32(count);
        self.end_submsg(marker)?;
        Ok(marker)
    }

    /// Assemble the full RTPS packet: header, INFO_DST towards the writer's
    /// participant, optional INFO_TS, then the accumulated submessages.
    #[must_use]
    pub fn into_packet(self, sender_prefix: GuidPrefix) -> Vec<u8> {
        let mut packet = Vec::with_capacity(20 + 16 + 12 + self.submsgs.len());

        packet.extend_from_slice(b"RTPS");
        packet.extend_from_slice(&RTPS_VERSION);
        packet.extend_from_slice(&RTPS_VENDOR_ID);
        packet.extend_from_slice(&sender_prefix);

        if let Some(dst) = self.dst {
            packet.push(SMID_INFO_DST);
            packet.push(SMFLAG_ENDIANNESS);
            packet.extend_from_slice(&12u16.to_le_bytes());
            packet.extend_from_slice(&dst);
        }

        if let Some(ts) = self.timestamp {
            let (seconds, fraction) = ts.to_rtps();
            packet.push(SMID_INFO_TS);
            packet.push(SMFLAG_ENDIANNESS);
            packet.extend_from_slice(&8u16.to_le_bytes());
            packet.extend_from_slice(&seconds.to_le_bytes());
            packet.extend_from_slice(&fraction.to_le_bytes());
        }

        packet.extend_from_slice(&self.submsgs);
        packet
    }
}

/// Expected encoded size of an ACKNACK submessage with `num_bits` bitmap bits.
#[must_use]
pub fn acknack_size(num_bits: u32) -> usize {
    4 + 8 + 8 + 4 + word_count_for_bits(num_bits) * 4 + 4
}

/// Expected encoded size of a NACK_FRAG submessage with `num_bits` bits.
#[must_use]
pub fn nackfrag_size(num_bits: u32) -> usize {
    4 + 8 + 8 + 4 + 4 + word_count_for_bits(num_bits) * 4 + 4
}
