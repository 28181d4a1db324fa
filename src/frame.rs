//! MAC frame model.
//!
//! Frames are typed records; (de)serialization to a wire format belongs to
//! the layers above and below and is not modelled here. Bit lengths are
//! still tracked because airtime and the RTS/CTS decision depend on them.

use bytes::Bytes;

use crate::SimTime;

/// MAC header length including the trailing CRC, bits
pub const MAC_HEADER_BITS: u32 = 272;

/// RTS frame length, bits
pub const LENGTH_RTS: u32 = 160;

/// CTS frame length, bits
pub const LENGTH_CTS: u32 = 112;

/// ACK frame length, bits
pub const LENGTH_ACK: u32 = 112;

/// PHY preamble and PLCP header, bits
pub const PHY_HEADER_BITS: u32 = 192;

/// Rate at which the PHY header is transmitted, bit/s
pub const HEADER_BITRATE: f64 = 1.0e6;

/// Longest supported MPDU, bits. Longer payloads are rejected at the
/// upper-layer handoff since fragmentation is not supported.
pub const MAX_FRAME_BITS: u32 = 18_496;

/// Link-layer address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub u16);

impl Address {
    /// Broadcast sentinel address
    pub const BROADCAST: Address = Address(0xffff);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Frame kinds exchanged between peer MACs
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum FrameKind {
    Rts,
    Cts,
    Data,
    Ack,
    Broadcast,
}

/// Reception metadata attached by the PHY decider to every delivered frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RxInfo {
    /// Link quality (SNR) of the reception
    pub snr: f64,
    /// Bitrate the frame was decoded at, bit/s
    pub bitrate: f64,
}

/// A MAC frame, immutable once handed to the PHY.
///
/// DATA and RTS frames referencing the head of the outgoing queue are
/// duplicates of the queue entry, so the original survives failed attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub src: Address,
    pub dest: Address,
    /// Channel time the remainder of this exchange still occupies once the
    /// frame is on the air; overhearing nodes defer for this long (NAV)
    pub duration: SimTime,
    pub sequence: u16,
    /// Set on retransmissions, used for duplicate suppression at the peer
    pub retry: bool,
    payload: Bytes,
}

impl Frame {
    /// Build a unicast DATA frame around an upper-layer payload
    pub fn data(src: Address, dest: Address, sequence: u16, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            src,
            dest,
            duration: 0.0,
            sequence,
            retry: false,
            payload,
        }
    }

    /// Build a BROADCAST frame around an upper-layer payload
    pub fn broadcast(src: Address, sequence: u16, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Broadcast,
            src,
            dest: Address::BROADCAST,
            duration: 0.0,
            sequence,
            retry: false,
            payload,
        }
    }

    /// Build an RTS control frame
    pub fn rts(src: Address, dest: Address) -> Self {
        Self::control(FrameKind::Rts, src, dest)
    }

    /// Build a CTS control frame
    pub fn cts(src: Address, dest: Address) -> Self {
        Self::control(FrameKind::Cts, src, dest)
    }

    /// Build an ACK control frame
    pub fn ack(src: Address, dest: Address) -> Self {
        Self::control(FrameKind::Ack, src, dest)
    }

    fn control(kind: FrameKind, src: Address, dest: Address) -> Self {
        Self {
            kind,
            src,
            dest,
            duration: 0.0,
            sequence: 0,
            retry: false,
            payload: Bytes::new(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Total frame length as transmitted by the MAC, bits
    pub fn bit_length(&self) -> u32 {
        match self.kind {
            FrameKind::Rts => LENGTH_RTS,
            FrameKind::Cts => LENGTH_CTS,
            FrameKind::Ack => LENGTH_ACK,
            FrameKind::Data | FrameKind::Broadcast => {
                MAC_HEADER_BITS + 8 * self.payload.len() as u32
            }
        }
    }
}
