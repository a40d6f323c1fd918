//! Multicast frame subscriber
//!
//! A receive loop on its own blocking-pool thread takes host datagrams,
//! decodes each frame in place into a loop-owned [`Frame`] and hands it to
//! the registered [`FrameHandler`] before receiving the next one. There is no
//! queue between the socket and the handler: a slow handler backs up into the
//! OS socket buffer, and the OS drops what does not fit. The handler never
//! runs on a runtime worker, so it cannot stall command timeouts or other
//! tasks.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::distribution::DistributionServer;
use crate::protocol::{MAX_DATAGRAM, Packet, PacketKind, codec};
use crate::types::{Frame, HostInfo};
use crate::Result;

/// Longest a stop waits for the receive task before aborting it.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive receive failures tolerated before backing off.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Where frame datagrams come from.
#[async_trait]
pub trait DatagramSource: Send + 'static {
    /// Receive one datagram into `buf`.
    ///
    /// Returns `Ok(None)` once the source has ended for good.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;
}

/// Host multicast group membership on a local port.
pub struct MulticastSource {
    socket: UdpSocket,
}

impl MulticastSource {
    /// Bind `port` on every interface and join `group` through `nic`.
    ///
    /// The port is bound with address reuse so several clients on one machine
    /// can listen to the same host. Failing to join only logs a warning: the
    /// socket still receives anything sent to it directly.
    pub async fn bind(nic: Ipv4Addr, group: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = UdpSocket::from_std(shared_socket(port)?)?;

        if group.is_multicast() {
            match socket.join_multicast_v4(group, nic) {
                Ok(()) => info!(%group, %nic, port = socket.local_addr()?.port(), "Joined host multicast group"),
                Err(e) => warn!(%group, %nic, error = %e, "Could not join host multicast group"),
            }
        }

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

fn shared_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // BSD stacks only share a bound port with SO_REUSEPORT
    #[cfg(any(target_vendor = "apple", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(socket.into())
}

#[async_trait]
impl DatagramSource for MulticastSource {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        Ok(Some(self.socket.recv_from(buf).await?))
    }
}

/// Receives every decoded frame.
///
/// Called on the subscriber's receive thread, which may block. The frame is
/// only valid for the duration of the call; it is overwritten by the next
/// datagram. Clone it or use [`Frame::copy_into`] to keep it.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: &Frame);
}

impl<F> FrameHandler for F
where
    F: Fn(&Frame) + Send + Sync + 'static,
{
    fn on_frame(&self, frame: &Frame) {
        self(frame)
    }
}

/// Latest-frame snapshots, only produced while someone listens.
type FrameSender = watch::Sender<Option<Arc<Frame>>>;

/// Handle to a running receive task.
pub struct Subscriber {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    frames: Arc<FrameSender>,
    frames_received: Arc<AtomicU64>,
}

impl Subscriber {
    /// Start receiving from `source` on a dedicated thread of the current
    /// runtime's blocking pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        source: S,
        handler: Option<Arc<dyn FrameHandler>>,
        host_info: Arc<watch::Sender<HostInfo>>,
        relay: Option<Arc<DistributionServer>>,
    ) -> Self
    where
        S: DatagramSource,
    {
        let (frames, _) = watch::channel(None);
        let frames = Arc::new(frames);
        let cancel = CancellationToken::new();
        let frames_received = Arc::new(AtomicU64::new(0));

        let task = ReceiveTask {
            handler,
            host_info,
            relay,
            frames: frames.clone(),
            frames_received: frames_received.clone(),
        };
        let runtime = Handle::current();
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || runtime.block_on(task.run(source, token)));

        Self { task: Some(task), cancel, frames, frames_received }
    }

    /// Frames decoded so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stream of owned frame snapshots.
    ///
    /// Snapshots are only made while at least one such stream exists. A slow
    /// consumer sees the latest frame, not every frame.
    pub fn frames(&self) -> impl Stream<Item = Arc<Frame>> + Send + 'static {
        WatchStream::new(self.frames.subscribe())
            .skip_while(|frame| {
                let waiting = frame.is_none();
                async move { waiting }
            })
            .take_while(|frame| {
                let running = frame.is_some();
                async move { running }
            })
            .filter_map(|frame| async move { frame })
    }

    /// Signal the receive loop to exit without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the receive loop and wait for it, detaching after
    /// [`TEARDOWN_TIMEOUT`].
    ///
    /// A handler still running at the deadline keeps its thread until it
    /// returns; the loop exits right after.
    ///
    /// Stopping an already stopped subscriber does nothing.
    pub async fn stop(&mut self) {
        self.cancel();

        let Some(task) = self.task.take() else { return };
        match tokio::time::timeout(TEARDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => debug!("Frame receiver joined"),
            Ok(Err(e)) => error!(error = %e, "Frame receiver failed"),
            Err(_) => warn!(timeout = ?TEARDOWN_TIMEOUT, "Frame receiver did not stop in time, detaching"),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct ReceiveTask {
    handler: Option<Arc<dyn FrameHandler>>,
    host_info: Arc<watch::Sender<HostInfo>>,
    relay: Option<Arc<DistributionServer>>,
    frames: Arc<FrameSender>,
    frames_received: Arc<AtomicU64>,
}

impl ReceiveTask {
    async fn run<S: DatagramSource>(self, mut source: S, cancel: CancellationToken) {
        info!("Frame receiver started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut frame = Frame::default();
        let mut last_frame_number: Option<i32> = None;
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Frame receiver cancelled");
                    break;
                }
                result = source.recv(&mut buf) => result,
            };

            let (len, from) = match result {
                Ok(Some(received)) => {
                    error_count = 0;
                    received
                }
                Ok(None) => {
                    info!("Frame source ended");
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    error!(error = %e, count = error_count, "Frame receive failed");

                    if error_count >= MAX_CONSECUTIVE_ERRORS {
                        // 50ms, 100ms, 200ms, ... capped at 1.6s
                        let backoff = Duration::from_millis(50 * (1 << (error_count - MAX_CONSECUTIVE_ERRORS).min(5)));
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    continue;
                }
            };

            let packet = match Packet::parse(&buf[..len]) {
                Ok(packet) if packet.header.kind == PacketKind::Frame => packet,
                Ok(packet) => {
                    trace!(kind = ?packet.header.kind, %from, "Ignoring non-frame datagram");
                    continue;
                }
                Err(e) => {
                    debug!(%from, error = %e, "Discarding malformed datagram");
                    continue;
                }
            };

            if let Err(e) = codec::decode_frame_into(packet.payload, &mut frame) {
                warn!(%from, error = %e, "Discarding undecodable frame");
                continue;
            }

            if let Some(previous) = last_frame_number {
                if frame.frame_number < previous && !packet.header.is_reset() {
                    debug!(previous, current = frame.frame_number, "Frame number went backwards");
                }
            }
            last_frame_number = Some(frame.frame_number);

            if let SocketAddr::V4(from) = from {
                self.host_info.send_modify(|info| info.confirm(*from.ip()));
            }

            self.deliver(&frame);
        }

        self.frames.send_replace(None);
        info!(frames = self.frames_received.load(Ordering::Relaxed), "Frame receiver stopped");
    }

    fn deliver(&self, frame: &Frame) {
        if let Some(handler) = &self.handler {
            handler.on_frame(frame);
        }

        if let Some(relay) = &self.relay {
            if let Err(e) = relay.send_frame(frame) {
                debug!(error = %e, "Relaying frame failed");
            }
        }

        if self.frames.receiver_count() > 0 {
            self.frames.send_replace(Some(Arc::new(frame.clone())));
        }

        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
}
