//! Wire headers for the data plane and the session-management plane.
//!
//! Every frame starts with a fixed 16-byte [`PktHdr`]. Session-management
//! frames additionally carry an 8-byte [`SmHdr`] as their payload.

use crate::error::{Error, Result};

/// Data-plane packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 16;

/// Session-management header size in bytes.
pub const SM_HDR_SIZE: usize = 8;

/// Magic byte identifying wirerpc frames.
pub const WIRE_MAGIC: u8 = 0xD7;

/// Maximum message size (bounded by the 24-bit on-wire size field).
pub const MAX_MSG_SIZE: usize = (1 << 24) - 1;

/// Maximum request number (48-bit on-wire field).
pub const MAX_REQ_NUM: u64 = (1 << 48) - 1;

/// Maximum per-message packet index (14-bit on-wire field).
pub const MAX_PKT_IDX: u16 = (1 << 14) - 1;

/// Frame kind, 2 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktKind {
    /// Request packet (any segment of a request message).
    Req = 0,
    /// Response packet (any segment of a response message).
    Resp = 1,
    /// Session-management packet; payload is an [`SmHdr`].
    Sm = 2,
    /// Reserved for explicit credit returns. Responses return credits
    /// implicitly, so the engine never emits this today.
    CreditReturn = 3,
}

impl TryFrom<u8> for PktKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PktKind::Req),
            1 => Ok(PktKind::Resp),
            2 => Ok(PktKind::Sm),
            3 => Ok(PktKind::CreditReturn),
            _ => Err(Error::MalformedPacket("bad packet kind")),
        }
    }
}

/// Data-plane packet header.
///
/// On-wire layout (little-endian):
///
/// ```text
/// offset  size  field
/// 0       1     magic
/// 1       1     req_type
/// 2       2     dest_session
/// 4       3     msg_size (24-bit)
/// 7       1     reserved
/// 8       2     kind (2 bits) | pkt_idx (14 bits)
/// 10      6     req_num (48-bit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktHdr {
    /// Application-defined request type.
    pub req_type: u8,
    /// Session number in the *receiver's* session space.
    pub dest_session: u16,
    /// Total message size in bytes across all segments.
    pub msg_size: usize,
    /// Frame kind.
    pub kind: PktKind,
    /// Segment index within the message.
    pub pkt_idx: u16,
    /// Request number, monotonically increasing per session.
    pub req_num: u64,
}

impl PktHdr {
    pub fn new(
        req_type: u8,
        dest_session: u16,
        msg_size: usize,
        kind: PktKind,
        pkt_idx: u16,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= MAX_MSG_SIZE);
        debug_assert!(pkt_idx <= MAX_PKT_IDX);
        debug_assert!(req_num <= MAX_REQ_NUM);
        Self {
            req_type,
            dest_session,
            msg_size,
            kind,
            pkt_idx,
            req_num,
        }
    }

    /// Encode into the 16-byte wire representation.
    pub fn to_bytes(&self) -> [u8; PKT_HDR_SIZE] {
        let mut b = [0u8; PKT_HDR_SIZE];
        b[0] = WIRE_MAGIC;
        b[1] = self.req_type;
        b[2..4].copy_from_slice(&self.dest_session.to_le_bytes());
        let size = self.msg_size as u32;
        b[4] = (size & 0xFF) as u8;
        b[5] = ((size >> 8) & 0xFF) as u8;
        b[6] = ((size >> 16) & 0xFF) as u8;
        let kind_idx = ((self.kind as u16) << 14) | (self.pkt_idx & MAX_PKT_IDX);
        b[8..10].copy_from_slice(&kind_idx.to_le_bytes());
        let rn = self.req_num.to_le_bytes();
        b[10..16].copy_from_slice(&rn[..6]);
        b
    }

    /// Decode from a received frame prefix.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PKT_HDR_SIZE {
            return Err(Error::MalformedPacket("frame shorter than header"));
        }
        if buf[0] != WIRE_MAGIC {
            return Err(Error::MalformedPacket("bad magic"));
        }
        let dest_session = u16::from_le_bytes([buf[2], buf[3]]);
        let msg_size =
            (buf[4] as usize) | ((buf[5] as usize) << 8) | ((buf[6] as usize) << 16);
        let kind_idx = u16::from_le_bytes([buf[8], buf[9]]);
        let kind = PktKind::try_from((kind_idx >> 14) as u8)?;
        let pkt_idx = kind_idx & MAX_PKT_IDX;
        let mut rn = [0u8; 8];
        rn[..6].copy_from_slice(&buf[10..16]);
        Ok(Self {
            req_type: buf[1],
            dest_session,
            msg_size,
            kind,
            pkt_idx,
            req_num: u64::from_le_bytes(rn),
        })
    }

    /// Number of segments a message of `msg_size` bytes occupies at the
    /// given MTU. Zero-length messages still occupy one segment.
    pub fn num_pkts(msg_size: usize, mtu: usize) -> u16 {
        let data_per_pkt = mtu - PKT_HDR_SIZE;
        if msg_size == 0 {
            1
        } else {
            msg_size.div_ceil(data_per_pkt) as u16
        }
    }

    /// Payload bytes carried by one segment at the given MTU.
    pub fn data_per_pkt(mtu: usize) -> usize {
        mtu - PKT_HDR_SIZE
    }
}

/// Session-management message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmKind {
    ConnectRequest = 0,
    ConnectResponse = 1,
    DisconnectRequest = 2,
    DisconnectResponse = 3,
}

impl TryFrom<u8> for SmKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmKind::ConnectRequest),
            1 => Ok(SmKind::ConnectResponse),
            2 => Ok(SmKind::DisconnectRequest),
            3 => Ok(SmKind::DisconnectResponse),
            _ => Err(Error::MalformedPacket("bad SM kind")),
        }
    }
}

/// Session-management error code carried in SM responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErr {
    Ok = 0,
    /// The remote endpoint has no free session slot.
    NoSessionSlots = 1,
}

impl TryFrom<u8> for SmErr {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmErr::Ok),
            1 => Ok(SmErr::NoSessionSlots),
            _ => Err(Error::MalformedPacket("bad SM error code")),
        }
    }
}

/// Session-management header, carried as the payload of a `PktKind::Sm`
/// frame.
///
/// On-wire layout (little-endian):
///
/// ```text
/// offset  size  field
/// 0       1     kind
/// 1       1     err
/// 2       2     client_session
/// 4       2     server_session
/// 6       2     credits (advertised by the sender)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmHdr {
    pub kind: SmKind,
    pub err: SmErr,
    /// Session number in the connect initiator's space.
    pub client_session: u16,
    /// Session number in the acceptor's space; zero until assigned.
    pub server_session: u16,
    /// Credit count the sender grants for this session.
    pub credits: u16,
}

impl SmHdr {
    pub fn new(
        kind: SmKind,
        err: SmErr,
        client_session: u16,
        server_session: u16,
        credits: u16,
    ) -> Self {
        Self {
            kind,
            err,
            client_session,
            server_session,
            credits,
        }
    }

    pub fn to_bytes(&self) -> [u8; SM_HDR_SIZE] {
        let mut b = [0u8; SM_HDR_SIZE];
        b[0] = self.kind as u8;
        b[1] = self.err as u8;
        b[2..4].copy_from_slice(&self.client_session.to_le_bytes());
        b[4..6].copy_from_slice(&self.server_session.to_le_bytes());
        b[6..8].copy_from_slice(&self.credits.to_le_bytes());
        b
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < SM_HDR_SIZE {
            return Err(Error::MalformedPacket("truncated SM header"));
        }
        Ok(Self {
            kind: SmKind::try_from(buf[0])?,
            err: SmErr::try_from(buf[1])?,
            client_session: u16::from_le_bytes([buf[2], buf[3]]),
            server_session: u16::from_le_bytes([buf[4], buf[5]]),
            credits: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_hdr_roundtrip() {
        let hdr = PktHdr::new(42, 0x1234, 0x12_3456, PktKind::Req, 0x3FFF, 0xFFFF_FFFF_FFFF);
        let bytes = hdr.to_bytes();
        let back = PktHdr::from_bytes(&bytes).unwrap();
        assert_eq!(hdr, back);
    }

    #[test]
    fn pkt_hdr_rejects_bad_magic() {
        let mut bytes = PktHdr::new(0, 0, 0, PktKind::Resp, 0, 0).to_bytes();
        bytes[0] = 0x00;
        assert!(PktHdr::from_bytes(&bytes).is_err());
    }

    #[test]
    fn pkt_hdr_rejects_short_frame() {
        assert!(PktHdr::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn all_kinds_roundtrip() {
        for kind in [PktKind::Req, PktKind::Resp, PktKind::Sm, PktKind::CreditReturn] {
            let hdr = PktHdr::new(1, 2, 3, kind, 4, 5);
            assert_eq!(PktHdr::from_bytes(&hdr.to_bytes()).unwrap().kind, kind);
        }
    }

    #[test]
    fn num_pkts() {
        let mtu = 1024;
        let data = PktHdr::data_per_pkt(mtu);
        assert_eq!(PktHdr::num_pkts(0, mtu), 1);
        assert_eq!(PktHdr::num_pkts(1, mtu), 1);
        assert_eq!(PktHdr::num_pkts(data, mtu), 1);
        assert_eq!(PktHdr::num_pkts(data + 1, mtu), 2);
        assert_eq!(PktHdr::num_pkts(3 * data, mtu), 3);
    }

    #[test]
    fn sm_hdr_roundtrip() {
        let hdr = SmHdr::new(SmKind::ConnectResponse, SmErr::NoSessionSlots, 7, 9, 32);
        assert_eq!(SmHdr::from_bytes(&hdr.to_bytes()).unwrap(), hdr);
    }
}
