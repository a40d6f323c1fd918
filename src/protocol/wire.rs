//! Datagram framing: header layout and packet kinds
//!
//! ```text
//! offset  size  field
//! 0       2     magic (0x4358, "CX")
//! 2       1     kind
//! 3       1     flags
//! 4       4     sequence
//! 8       4     payload length
//! 12      n     payload
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::{CortexError, Result};

pub const MAGIC: u16 = 0x4358;
pub const HEADER_LEN: usize = 12;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Set on a frame when the host restarted its frame counter.
pub const FLAG_RESET: u8 = 0x01;

/// What a datagram carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    HostQuery = 0x01,
    HostInfo = 0x02,
    Request = 0x10,
    Response = 0x11,
    Unrecognized = 0x12,
    HostError = 0x13,
    SkyCommand = 0x14,
    SkyReturn = 0x15,
    Htr = 0x16,
    Frame = 0x20,
    Subscribe = 0x30,
    Unsubscribe = 0x31,
    SubscribeAck = 0x32,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => PacketKind::HostQuery,
            0x02 => PacketKind::HostInfo,
            0x10 => PacketKind::Request,
            0x11 => PacketKind::Response,
            0x12 => PacketKind::Unrecognized,
            0x13 => PacketKind::HostError,
            0x14 => PacketKind::SkyCommand,
            0x15 => PacketKind::SkyReturn,
            0x16 => PacketKind::Htr,
            0x20 => PacketKind::Frame,
            0x30 => PacketKind::Subscribe,
            0x31 => PacketKind::Unsubscribe,
            0x32 => PacketKind::SubscribeAck,
            _ => return None,
        })
    }

    /// Kinds a host sends back in answer to a request.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketKind::HostInfo
                | PacketKind::Response
                | PacketKind::Unrecognized
                | PacketKind::HostError
                | PacketKind::SkyReturn
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: PacketKind,
    pub flags: u8,
    pub sequence: u32,
    pub payload_len: u32,
}

impl Header {
    pub fn new(kind: PacketKind, sequence: u32) -> Self {
        Self { kind, flags: 0, sequence, payload_len: 0 }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_reset(&self) -> bool {
        self.flags & FLAG_RESET != 0
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.sequence);
        buf.put_u32(self.payload_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(CortexError::protocol(
                "datagram header",
                format!("{} bytes is shorter than the {}-byte header", buf.remaining(), HEADER_LEN),
            ));
        }

        let magic = buf.get_u16();
        if magic != MAGIC {
            return Err(CortexError::protocol("datagram header", format!("bad magic 0x{:04x}", magic)));
        }

        let raw_kind = buf.get_u8();
        let kind = PacketKind::from_u8(raw_kind).ok_or_else(|| {
            CortexError::protocol("datagram header", format!("unknown packet kind 0x{:02x}", raw_kind))
        })?;

        Ok(Self { kind, flags: buf.get_u8(), sequence: buf.get_u32(), payload_len: buf.get_u32() })
    }
}

/// A parsed datagram borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Split a datagram into header and payload.
    ///
    /// The declared payload length must match the bytes that follow.
    pub fn parse(datagram: &'a [u8]) -> Result<Self> {
        let mut buf = datagram;
        let header = Header::decode(&mut buf)?;
        if header.payload_len as usize != buf.len() {
            return Err(CortexError::protocol(
                "datagram header",
                format!("declared payload of {} bytes but {} follow", header.payload_len, buf.len()),
            ));
        }
        Ok(Self { header, payload: buf })
    }
}

/// Write a complete datagram into `out`, replacing its contents.
///
/// `payload` appends the body; the header's length field is filled in
/// afterwards. Fails if the result would not fit in one datagram.
pub fn write_packet<F>(out: &mut BytesMut, header: Header, payload: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    out.clear();
    out.put_bytes(0, HEADER_LEN);
    payload(out)?;

    let total = out.len();
    if total > MAX_DATAGRAM {
        return Err(CortexError::protocol(
            "encoding datagram",
            format!("{:?} packet of {} bytes exceeds the {}-byte limit", header.kind, total, MAX_DATAGRAM),
        ));
    }

    let header = Header { payload_len: (total - HEADER_LEN) as u32, ..header };
    let mut head = &mut out[..HEADER_LEN];
    header.encode(&mut head);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_layout_is_big_endian() {
        let mut out = BytesMut::new();
        write_packet(&mut out, Header::new(PacketKind::Frame, 0x0102_0304).with_flags(FLAG_RESET), |buf| {
            buf.put_slice(b"abc");
            Ok(())
        })
        .unwrap();

        assert_eq!(&out[..], &[0x43, 0x58, 0x20, 0x01, 1, 2, 3, 4, 0, 0, 0, 3, b'a', b'b', b'c']);

        let packet = Packet::parse(&out).unwrap();
        assert!(packet.header.is_reset());
        assert_eq!(packet.header.sequence, 0x0102_0304);
        assert_eq!(packet.payload, b"abc");
    }

    #[test]
    fn rejects_foreign_datagrams() {
        assert!(Packet::parse(b"GET / HTTP/1.1\r\n").is_err());
        assert!(Packet::parse(&[0x43, 0x58, 0x20]).is_err());
        assert!(Packet::parse(&[0x43, 0x58, 0x7f, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut out = BytesMut::new();
        write_packet(&mut out, Header::new(PacketKind::Request, 1), |buf| {
            buf.put_slice(b"Pause");
            Ok(())
        })
        .unwrap();

        assert!(Packet::parse(&out[..out.len() - 1]).is_err());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut out = BytesMut::new();
        let err = write_packet(&mut out, Header::new(PacketKind::Frame, 0), |buf| {
            buf.put_bytes(0xAA, MAX_DATAGRAM);
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, CortexError::Protocol { .. }));
    }

    proptest! {
        #[test]
        fn prop_unknown_kinds_are_rejected(kind in any::<u8>()) {
            let datagram = [0x43, 0x58, kind, 0, 0, 0, 0, 0, 0, 0, 0, 0];
            prop_assert_eq!(Packet::parse(&datagram).is_ok(), PacketKind::from_u8(kind).is_some());
        }
    }
}
