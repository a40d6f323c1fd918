//! Wire protocol spoken with the host and with downstream clients.
//!
//! Every datagram is a fixed [`Header`] followed by a kind-specific payload.
//! [`wire`] handles framing; [`codec`] turns payloads into the crate's types
//! and back.
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use cortex_stream::Frame;
//! use cortex_stream::protocol::{Header, Packet, PacketKind, codec, write_packet};
//!
//! let frame = Frame { frame_number: 10, ..Default::default() };
//!
//! let mut datagram = BytesMut::new();
//! write_packet(&mut datagram, Header::new(PacketKind::Frame, 0), |buf| codec::encode_frame(&frame, buf))?;
//!
//! let packet = Packet::parse(&datagram)?;
//! let mut decoded = Frame::default();
//! codec::decode_frame_into(packet.payload, &mut decoded)?;
//! assert_eq!(decoded.frame_number, 10);
//! # Ok::<(), cortex_stream::CortexError>(())
//! ```

pub mod codec;
pub mod wire;

pub use wire::{FLAG_RESET, HEADER_LEN, Header, MAGIC, MAX_DATAGRAM, Packet, PacketKind, write_packet};

/// Request asking the host for its body definitions.
pub const GET_BODY_DEFS: &str = "GetBodyDefs";

/// Request asking the host for the frame it is currently showing.
pub const GET_CURRENT_FRAME: &str = "GetCurrentFrame";
