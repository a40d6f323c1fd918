//! Command/response channel to the host
//!
//! One UDP socket, one request in flight. Callers that arrive while a request
//! is outstanding wait their turn on an async mutex, and the reply stays in
//! the channel's receive buffer until the caller drops the [`Response`]
//! borrowing it.
//!
//! Every request carries a fresh sequence number. Replies with any other
//! sequence number, typically late answers to a request that already timed
//! out, are discarded.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::{Deref, Range};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    GET_BODY_DEFS, GET_CURRENT_FRAME, HEADER_LEN, Header, MAX_DATAGRAM, Packet, PacketKind, codec, write_packet,
};
use crate::types::{BodyDefinitionSet, Frame, Hierarchy, HostInfo, SegmentData, SkyReturn};
use crate::{CortexError, Result};

/// Everything only the request holding the lock may touch.
struct Exchange {
    host: Option<SocketAddrV4>,
    sequence: u32,
    send_buf: BytesMut,
    recv_buf: Vec<u8>,
    /// Decoded reply of the latest `GetCurrentFrame`.
    polled: Frame,
}

/// A reply held in the channel's receive buffer.
///
/// The next request waits until this is dropped.
pub struct Response<'a> {
    guard: MutexGuard<'a, Exchange>,
    payload: Range<usize>,
}

impl Response<'_> {
    pub fn bytes(&self) -> &[u8] {
        &self.guard.recv_buf[self.payload.clone()]
    }

    /// The reply as UTF-8 text.
    pub fn as_str(&self) -> Result<&str> {
        codec::decode_text(self.bytes())
    }

    /// Copy the reply out so the channel can be used again.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }
}

impl Deref for Response<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl std::fmt::Debug for Response<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("len", &self.payload.len()).finish()
    }
}

/// The host's current frame, decoded into the channel's polling buffer.
pub struct FrameView<'a>(MappedMutexGuard<'a, Frame>);

impl Deref for FrameView<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.0
    }
}

/// Request/response link to the host.
pub struct CommandChannel {
    socket: UdpSocket,
    exchange: Mutex<Exchange>,
    host_port: u16,
    min_timeout: Duration,
    host_info: Arc<watch::Sender<HostInfo>>,
}

impl CommandChannel {
    /// Bind the command socket.
    ///
    /// With `host` unset the first [`discover_host`](Self::discover_host)
    /// broadcasts on `host_port` and adopts whoever answers.
    pub async fn bind(
        local: SocketAddrV4,
        host: Option<SocketAddrV4>,
        host_port: u16,
        min_timeout: Duration,
        host_info: Arc<watch::Sender<HostInfo>>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        info!(local = %socket.local_addr()?, host = ?host, "Command channel bound");

        Ok(Self {
            socket,
            exchange: Mutex::new(Exchange {
                host,
                sequence: 0,
                send_buf: BytesMut::with_capacity(1024),
                recv_buf: vec![0; MAX_DATAGRAM],
                polled: Frame::default(),
            }),
            host_port,
            min_timeout,
            host_info,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Host endpoint in use, once known.
    pub async fn host(&self) -> Option<SocketAddrV4> {
        self.exchange.lock().await.host
    }

    pub fn effective_timeout(&self, requested: Duration) -> Duration {
        requested.max(self.min_timeout)
    }

    /// Send a text command and wait for its reply.
    pub async fn request(&self, command: &str, timeout: Duration) -> Result<Response<'_>> {
        let mut guard = self.exchange.lock().await;
        let (kind, payload) = self.exchange_with(&mut guard, PacketKind::Request, command, timeout).await?;

        match kind {
            PacketKind::Response => Ok(Response { guard, payload }),
            other => Err(reply_error(other, command, &guard.recv_buf[payload])),
        }
    }

    /// Run a Sky command and decode its typed result.
    pub async fn sky_command(&self, command: &str, timeout: Duration) -> Result<SkyReturn> {
        let mut guard = self.exchange.lock().await;
        let (kind, payload) = self.exchange_with(&mut guard, PacketKind::SkyCommand, command, timeout).await?;
        let payload = &guard.recv_buf[payload];

        match kind {
            PacketKind::SkyReturn => codec::decode_sky_return(payload),
            other => Err(reply_error(other, command, payload)),
        }
    }

    /// Ask the host to identify itself.
    pub async fn discover_host(&self, timeout: Duration) -> Result<HostInfo> {
        let mut guard = self.exchange.lock().await;
        let target = guard.host.unwrap_or(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.host_port));
        let effective = self.effective_timeout(timeout);

        let expected_peer = guard.host;
        let sequence = self.send(&mut guard, target, PacketKind::HostQuery, |_| Ok(())).await?;
        let (kind, from, payload) = self.await_reply(&mut guard, sequence, effective, expected_peer).await?;

        if kind != PacketKind::HostInfo {
            return Err(CortexError::protocol("host discovery", format!("unexpected {:?} reply", kind)));
        }
        let reply = codec::decode_host_info(&guard.recv_buf[payload])?;

        if guard.host.is_none() {
            info!(host = %from, name = %reply.machine_name, "Host discovered");
            guard.host = Some(from);
        }
        self.host_info.send_modify(move |info| info.update_identity(reply));
        Ok(self.host_info.borrow().clone())
    }

    /// Fetch the host's body definitions.
    pub async fn body_definitions(&self, timeout: Duration) -> Result<BodyDefinitionSet> {
        let response = self.request(GET_BODY_DEFS, timeout).await?;
        codec::decode_body_defs(&response)
    }

    /// Poll the frame the host is currently showing.
    ///
    /// The frame lives in the channel until the view is dropped; clone it to
    /// keep it longer.
    pub async fn current_frame(&self, timeout: Duration) -> Result<FrameView<'_>> {
        let mut guard = self.exchange.lock().await;
        let (kind, payload) = self.exchange_with(&mut guard, PacketKind::Request, GET_CURRENT_FRAME, timeout).await?;

        let exchange = &mut *guard;
        match kind {
            PacketKind::Response => codec::decode_frame_into(&exchange.recv_buf[payload], &mut exchange.polled)?,
            other => return Err(reply_error(other, GET_CURRENT_FRAME, &exchange.recv_buf[payload])),
        }
        Ok(FrameView(MutexGuard::map(guard, |exchange| &mut exchange.polled)))
    }

    /// Push a skeleton to the host.
    pub async fn send_htr(&self, hierarchy: &Hierarchy, segments: &[SegmentData], timeout: Duration) -> Result<()> {
        let mut payload = BytesMut::new();
        codec::encode_htr(hierarchy, segments, &mut payload)?;

        let mut guard = self.exchange.lock().await;
        let host = require_host(&guard)?;
        let effective = self.effective_timeout(timeout);
        let sequence = self
            .send(&mut guard, host, PacketKind::Htr, |buf| {
                buf.put_slice(&payload);
                Ok(())
            })
            .await?;
        let (kind, _, range) = self.await_reply(&mut guard, sequence, effective, Some(host)).await?;

        match kind {
            PacketKind::Response => Ok(()),
            other => Err(reply_error(other, "skeleton push", &guard.recv_buf[range])),
        }
    }

    /// Drop the retained polling frame.
    pub async fn release_buffers(&self) {
        self.exchange.lock().await.polled.release();
    }

    async fn exchange_with(
        &self,
        exchange: &mut Exchange,
        kind: PacketKind,
        text: &str,
        timeout: Duration,
    ) -> Result<(PacketKind, Range<usize>)> {
        let host = require_host(exchange)?;
        let effective = self.effective_timeout(timeout);
        let sequence = self
            .send(exchange, host, kind, |buf| {
                buf.put_slice(text.as_bytes());
                Ok(())
            })
            .await?;

        trace!(command = text, sequence, "Request sent");
        let (kind, _, payload) = self.await_reply(exchange, sequence, effective, Some(host)).await?;
        Ok((kind, payload))
    }

    async fn send<F>(&self, exchange: &mut Exchange, target: SocketAddrV4, kind: PacketKind, payload: F) -> Result<u32>
    where
        F: FnOnce(&mut BytesMut) -> Result<()>,
    {
        exchange.sequence = exchange.sequence.wrapping_add(1);
        let sequence = exchange.sequence;
        write_packet(&mut exchange.send_buf, Header::new(kind, sequence), payload)?;
        self.socket.send_to(&exchange.send_buf, target).await?;
        Ok(sequence)
    }

    /// Wait for the reply carrying `sequence`, discarding everything else.
    async fn await_reply(
        &self,
        exchange: &mut Exchange,
        sequence: u32,
        timeout: Duration,
        expected_peer: Option<SocketAddrV4>,
    ) -> Result<(PacketKind, SocketAddrV4, Range<usize>)> {
        let deadline = Instant::now() + timeout;

        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut exchange.recv_buf)).await;
            let (len, from) = match received {
                Err(_) => {
                    debug!(sequence, ?timeout, "Request timed out");
                    return Err(CortexError::Timeout { duration: timeout });
                }
                Ok(result) => result?,
            };

            let SocketAddr::V4(from) = from else { continue };
            if expected_peer.is_some_and(|peer| peer.ip() != from.ip()) {
                debug!(%from, "Ignoring datagram from a peer other than the host");
                continue;
            }

            let header = match Packet::parse(&exchange.recv_buf[..len]) {
                Ok(packet) => packet.header,
                Err(e) => {
                    debug!(%from, error = %e, "Discarding malformed reply");
                    continue;
                }
            };

            if header.sequence != sequence || !header.kind.is_reply() {
                debug!(
                    expected = sequence,
                    got = header.sequence,
                    kind = ?header.kind,
                    "Discarding uncorrelated reply"
                );
                continue;
            }

            self.host_info.send_modify(|info| info.confirm(*from.ip()));
            return Ok((header.kind, from, HEADER_LEN..len));
        }
    }
}

fn require_host(exchange: &Exchange) -> Result<SocketAddrV4> {
    exchange
        .host
        .ok_or_else(|| CortexError::api_misuse("host address unknown: configure one or run host discovery first"))
}

/// Map a non-success reply onto the matching error.
fn reply_error(kind: PacketKind, command: &str, payload: &[u8]) -> CortexError {
    match kind {
        PacketKind::Unrecognized => CortexError::Unrecognized { command: command.to_string() },
        PacketKind::HostError => {
            let reason = String::from_utf8_lossy(payload);
            warn!(command, %reason, "Host reported an error");
            CortexError::general(format!("host failed '{}': {}", command, reason))
        }
        other => CortexError::protocol("command reply", format!("unexpected {:?} reply to '{}'", other, command)),
    }
}
