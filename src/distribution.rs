//! Client distribution server
//!
//! Lets this session act as a host for downstream clients: it answers their
//! discovery queries, tracks who subscribed, hands their commands to a
//! [`ClientRequestHandler`] and multicasts frames to them.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{BufMut, BytesMut};
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{Header, MAX_DATAGRAM, Packet, PacketKind, codec, write_packet};
use crate::subscriber::TEARDOWN_TIMEOUT;
use crate::types::{Frame, HostInfo, SkyReturn};
use crate::Result;

/// Answer to a downstream command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientReply {
    Response(Vec<u8>),
    Sky(SkyReturn),
    Unrecognized,
    /// The command was understood but failed; the text goes back to the client.
    Error(String),
}

/// Handles commands sent by downstream clients.
///
/// Both methods default to [`ClientReply::Unrecognized`].
pub trait ClientRequestHandler: Send + Sync + 'static {
    fn on_request(&self, command: &str, from: SocketAddr) -> ClientReply {
        let _ = (command, from);
        ClientReply::Unrecognized
    }

    fn on_sky_command(&self, command: &str, from: SocketAddr) -> ClientReply {
        let _ = (command, from);
        ClientReply::Unrecognized
    }
}

/// Rejects every command.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnrecognizedRequests;

impl ClientRequestHandler for UnrecognizedRequests {}

/// Sockets and identity of a distribution server.
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    pub nic: Ipv4Addr,
    /// Local port clients send requests to (`0` for any).
    pub request_port: u16,
    /// Local port frames are sent from (`0` for any).
    pub send_port: u16,
    /// Where frames go, normally the clients' multicast group.
    pub destination: SocketAddrV4,
    /// What this server reports to discovery queries.
    pub identity: HostInfo,
}

type Subscribers = Arc<Mutex<HashSet<SocketAddr>>>;

pub struct DistributionServer {
    send_socket: UdpSocket,
    destination: SocketAddrV4,
    request_addr: SocketAddr,
    subscribers: Subscribers,
    send_buf: Mutex<BytesMut>,
    sequence: AtomicU32,
    listener: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DistributionServer {
    /// Bind both sockets and start listening for client requests.
    pub async fn start(config: DistributionConfig, handler: Arc<dyn ClientRequestHandler>) -> Result<Self> {
        let request_socket = UdpSocket::bind((config.nic, config.request_port)).await?;
        let send_socket = UdpSocket::bind((config.nic, config.send_port)).await?;
        let request_addr = request_socket.local_addr()?;

        if config.destination.ip().is_multicast() && !config.nic.is_unspecified() {
            if let Err(e) = SockRef::from(&send_socket).set_multicast_if_v4(&config.nic) {
                warn!(nic = %config.nic, error = %e, "Could not select the outgoing multicast interface");
            }
        }

        info!(
            requests = %request_addr,
            destination = %config.destination,
            "Client distribution server listening"
        );

        let subscribers: Subscribers = Arc::default();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(
            request_socket,
            handler,
            config.identity,
            subscribers.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            send_socket,
            destination: config.destination,
            request_addr,
            subscribers,
            send_buf: Mutex::new(BytesMut::with_capacity(MAX_DATAGRAM)),
            sequence: AtomicU32::new(0),
            listener: Mutex::new(Some(listener)),
            cancel,
        })
    }

    /// Address clients send their requests to.
    pub fn request_addr(&self) -> SocketAddr {
        self.request_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Send one frame to the clients without blocking.
    ///
    /// Returns the bytes sent: `0` when nobody subscribed or when the socket
    /// buffer is full and the frame was dropped.
    pub fn send_frame(&self, frame: &Frame) -> Result<usize> {
        if self.subscriber_count() == 0 {
            return Ok(0);
        }

        let mut buf = self.send_buf.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        write_packet(&mut buf, Header::new(PacketKind::Frame, sequence), |b| codec::encode_frame(frame, b))?;

        match self.send_socket.try_send_to(&buf, SocketAddr::V4(self.destination)) {
            Ok(sent) => Ok(sent),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!(frame = frame.frame_number, "Send buffer full, dropping relayed frame");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Signal the request listener to exit without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the request listener. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel();

        let task = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut task) = task else { return };
        if tokio::time::timeout(TEARDOWN_TIMEOUT, &mut task).await.is_err() {
            warn!("Client listener did not stop in time, aborting");
            task.abort();
        }
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Drop for DistributionServer {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn listen(
    socket: UdpSocket,
    handler: Arc<dyn ClientRequestHandler>,
    identity: HostInfo,
    subscribers: Subscribers,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut out = BytesMut::with_capacity(1024);

    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "Client request receive failed");
                    continue;
                }
            },
        };

        let packet = match Packet::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%from, error = %e, "Discarding malformed client datagram");
                continue;
            }
        };

        let sequence = packet.header.sequence;
        let written = match packet.header.kind {
            PacketKind::Subscribe => {
                let added = subscribers.lock().unwrap_or_else(PoisonError::into_inner).insert(from);
                if added {
                    info!(client = %from, "Client subscribed");
                }
                write_packet(&mut out, Header::new(PacketKind::SubscribeAck, sequence), |_| Ok(()))
            }
            PacketKind::Unsubscribe => {
                if subscribers.lock().unwrap_or_else(PoisonError::into_inner).remove(&from) {
                    info!(client = %from, "Client unsubscribed");
                }
                write_packet(&mut out, Header::new(PacketKind::SubscribeAck, sequence), |_| Ok(()))
            }
            PacketKind::HostQuery => write_packet(&mut out, Header::new(PacketKind::HostInfo, sequence), |b| {
                codec::encode_host_info(&identity, b)
            }),
            PacketKind::Request | PacketKind::SkyCommand => {
                let command = match codec::decode_text(packet.payload) {
                    Ok(command) => command,
                    Err(e) => {
                        debug!(client = %from, error = %e, "Discarding client command");
                        continue;
                    }
                };
                trace!(client = %from, command, "Client command");

                let reply = if packet.header.kind == PacketKind::Request {
                    handler.on_request(command, from)
                } else {
                    handler.on_sky_command(command, from)
                };
                write_reply(&mut out, sequence, command, reply)
            }
            other => {
                trace!(client = %from, kind = ?other, "Ignoring client datagram");
                continue;
            }
        };

        match written {
            Ok(()) => {
                if let Err(e) = socket.send_to(&out, from).await {
                    debug!(client = %from, error = %e, "Reply to client failed");
                }
            }
            Err(e) => warn!(client = %from, error = %e, "Could not encode reply to client"),
        }
    }

    debug!("Client listener stopped");
}

fn write_reply(out: &mut BytesMut, sequence: u32, command: &str, reply: ClientReply) -> Result<()> {
    match reply {
        ClientReply::Response(bytes) => write_packet(out, Header::new(PacketKind::Response, sequence), |b| {
            b.put_slice(&bytes);
            Ok(())
        }),
        ClientReply::Sky(ret) => {
            write_packet(out, Header::new(PacketKind::SkyReturn, sequence), |b| codec::encode_sky_return(&ret, b))
        }
        ClientReply::Unrecognized => write_packet(out, Header::new(PacketKind::Unrecognized, sequence), |b| {
            b.put_slice(command.as_bytes());
            Ok(())
        }),
        ClientReply::Error(reason) => write_packet(out, Header::new(PacketKind::HostError, sequence), |b| {
            b.put_slice(reason.as_bytes());
            Ok(())
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_frame;
    use crate::types::SkyValue;
    use crate::ReturnCode;
    use std::time::Duration;

    async fn loopback_socket() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let SocketAddr::V4(addr) = socket.local_addr().unwrap() else { unreachable!() };
        (socket, addr)
    }

    async fn server_to(destination: SocketAddrV4, handler: Arc<dyn ClientRequestHandler>) -> DistributionServer {
        let config = DistributionConfig {
            nic: Ipv4Addr::LOCALHOST,
            request_port: 0,
            send_port: 0,
            destination,
            identity: HostInfo { program_name: "relay".into(), ..Default::default() },
        };
        DistributionServer::start(config, handler).await.unwrap()
    }

    /// Send one packet from `client` and wait for the reply.
    async fn ask(client: &UdpSocket, server: SocketAddr, kind: PacketKind, payload: &[u8]) -> (PacketKind, Vec<u8>) {
        let mut out = BytesMut::new();
        write_packet(&mut out, Header::new(kind, 9), |b| {
            b.put_slice(payload);
            Ok(())
        })
        .unwrap();
        client.send_to(&out, server).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf)).await.unwrap().unwrap();
        let packet = Packet::parse(&buf[..len]).unwrap();
        assert_eq!(packet.header.sequence, 9);
        (packet.header.kind, packet.payload.to_vec())
    }

    #[tokio::test]
    async fn no_subscribers_means_nothing_is_sent() {
        let (sink, destination) = loopback_socket().await;
        let server = server_to(destination, Arc::new(UnrecognizedRequests)).await;

        assert_eq!(server.send_frame(&sample_frame(1)).unwrap(), 0);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let nothing = tokio::time::timeout(Duration::from_millis(100), sink.recv_from(&mut buf)).await;
        assert!(nothing.is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn subscribed_clients_receive_frames() {
        let (sink, destination) = loopback_socket().await;
        let server = server_to(destination, Arc::new(UnrecognizedRequests)).await;
        let (client, _) = loopback_socket().await;

        let (kind, _) = ask(&client, server.request_addr(), PacketKind::Subscribe, &[]).await;
        assert_eq!(kind, PacketKind::SubscribeAck);
        assert_eq!(server.subscriber_count(), 1);

        let frame = sample_frame(314);
        assert!(server.send_frame(&frame).unwrap() > 0);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sink.recv_from(&mut buf)).await.unwrap().unwrap();
        let packet = Packet::parse(&buf[..len]).unwrap();
        let mut decoded = Frame::default();
        codec::decode_frame_into(packet.payload, &mut decoded).unwrap();
        assert_eq!(decoded, frame);

        ask(&client, server.request_addr(), PacketKind::Unsubscribe, &[]).await;
        assert_eq!(server.subscriber_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn discovery_reports_relay_identity() {
        let (_sink, destination) = loopback_socket().await;
        let server = server_to(destination, Arc::new(UnrecognizedRequests)).await;
        let (client, _) = loopback_socket().await;

        let (kind, payload) = ask(&client, server.request_addr(), PacketKind::HostQuery, &[]).await;
        assert_eq!(kind, PacketKind::HostInfo);
        assert_eq!(codec::decode_host_info(&payload).unwrap().program_name, "relay");
        server.stop().await;
    }

    #[tokio::test]
    async fn default_handler_rejects_commands() {
        let (_sink, destination) = loopback_socket().await;
        let server = server_to(destination, Arc::new(UnrecognizedRequests)).await;
        let (client, _) = loopback_socket().await;

        let (kind, payload) = ask(&client, server.request_addr(), PacketKind::Request, b"Pause").await;
        assert_eq!(kind, PacketKind::Unrecognized);
        assert_eq!(payload, b"Pause");
        server.stop().await;
    }

    #[tokio::test]
    async fn custom_handler_answers_commands() {
        struct Echo;
        impl ClientRequestHandler for Echo {
            fn on_request(&self, command: &str, _from: SocketAddr) -> ClientReply {
                ClientReply::Response(command.to_uppercase().into_bytes())
            }

            fn on_sky_command(&self, _command: &str, _from: SocketAddr) -> ClientReply {
                ClientReply::Sky(SkyReturn { code: ReturnCode::Okay, value: SkyValue::Bool(true) })
            }
        }

        let (_sink, destination) = loopback_socket().await;
        let server = server_to(destination, Arc::new(Echo)).await;
        let (client, _) = loopback_socket().await;

        let (kind, payload) = ask(&client, server.request_addr(), PacketKind::Request, b"pause").await;
        assert_eq!((kind, payload.as_slice()), (PacketKind::Response, b"PAUSE".as_slice()));

        let (kind, payload) = ask(&client, server.request_addr(), PacketKind::SkyCommand, b"IsLive").await;
        assert_eq!(kind, PacketKind::SkyReturn);
        assert_eq!(codec::decode_sky_return(&payload).unwrap().value, SkyValue::Bool(true));

        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn multicast_frames_leave_through_the_configured_nic() {
        let server = server_to(SocketAddrV4::new(Ipv4Addr::new(225, 1, 1, 2), 1510), Arc::new(UnrecognizedRequests)).await;

        let nic = SockRef::from(&server.send_socket).multicast_if_v4().unwrap();
        assert_eq!(nic, Ipv4Addr::LOCALHOST);
        server.stop().await;
    }
}
