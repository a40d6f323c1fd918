//! Remote control for an instrumented treadmill
//!
//! The treadmill controller accepts fixed 64-byte speed packets over TCP or
//! UDP. This client is synchronous: each call writes one packet.
//!
//! ```rust,no_run
//! use cortex_stream::treadmill::TreadmillRemote;
//!
//! # fn run() -> Result<(), cortex_stream::treadmill::TreadmillError> {
//! let mut treadmill = TreadmillRemote::connect("192.168.1.50", 4000)?;
//! treadmill.set_speed(1.2, 1.2, 0.5)?;
//! treadmill.close();
//! # Ok(())
//! # }
//! ```

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

pub const SPEED_PACKET_LEN: usize = 64;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TreadmillError {
    #[error("Could not resolve treadmill address '{address}'")]
    Address {
        address: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Could not create treadmill socket")]
    Socket {
        #[source]
        source: io::Error,
    },

    #[error("Could not connect to treadmill at {address}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not configure treadmill socket")]
    SocketOption {
        #[source]
        source: io::Error,
    },

    #[error("Treadmill is not connected")]
    NotConnected,

    #[error("Could not send speed packet")]
    Send {
        #[source]
        source: io::Error,
    },
}

impl TreadmillError {
    /// Numeric status code used by existing treadmill tooling.
    pub fn code(&self) -> i32 {
        match self {
            TreadmillError::Address { .. } => 11,
            TreadmillError::Socket { .. } => 12,
            TreadmillError::Connect { .. } => 13,
            TreadmillError::SocketOption { .. } => 14,
            TreadmillError::NotConnected => 20,
            TreadmillError::Send { .. } => 21,
        }
    }

    /// Raised while connecting, as opposed to while sending.
    pub fn is_startup_error(&self) -> bool {
        self.code() < 20
    }
}

/// Belt speeds in m/s and a shared acceleration in m/s².
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BeltSpeeds {
    pub front_left: f64,
    pub front_right: f64,
    pub rear_left: f64,
    pub rear_right: f64,
    pub acceleration: f64,
}

fn millis(value: f64) -> i16 {
    (value * 1000.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Encode one speed packet.
///
/// Speeds go in right, left, rear right, rear left order; the bytes after the
/// payload repeat it bitwise inverted so the controller can reject garbage.
pub fn speed_packet(speeds: &BeltSpeeds) -> [u8; SPEED_PACKET_LEN] {
    let mut packet = [0u8; SPEED_PACKET_LEN];
    let accel = millis(speeds.acceleration);
    let fields = [
        millis(speeds.front_right),
        millis(speeds.front_left),
        millis(speeds.rear_right),
        millis(speeds.rear_left),
        accel,
        accel,
        accel,
        accel,
        0, // incline
    ];

    for (n, field) in fields.iter().enumerate() {
        packet[1 + 2 * n..3 + 2 * n].copy_from_slice(&field.to_be_bytes());
    }
    for n in 1..=18 {
        packet[18 + n] = !packet[n];
    }
    packet
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

pub struct TreadmillRemote {
    transport: Option<Transport>,
    peer: SocketAddr,
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr, TreadmillError> {
    let mut addrs = (address, port).to_socket_addrs().map_err(|e| TreadmillError::Address {
        address: address.to_string(),
        source: Some(e),
    })?;
    addrs.find(SocketAddr::is_ipv4).ok_or_else(|| TreadmillError::Address {
        address: address.to_string(),
        source: None,
    })
}

impl TreadmillRemote {
    /// Connect over TCP.
    pub fn connect(address: &str, port: u16) -> Result<Self, TreadmillError> {
        let peer = resolve(address, port)?;
        let stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT).map_err(|e| TreadmillError::Connect {
            address: peer.to_string(),
            source: e,
        })?;
        stream.set_nodelay(true).map_err(|e| TreadmillError::SocketOption { source: e })?;

        info!(%peer, "Treadmill connected over TCP");
        Ok(Self { transport: Some(Transport::Tcp(stream)), peer })
    }

    /// Send packets as UDP datagrams.
    pub fn connect_udp(address: &str, port: u16) -> Result<Self, TreadmillError> {
        let peer = resolve(address, port)?;
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|e| TreadmillError::Socket { source: e })?;
        socket.connect(peer).map_err(|e| TreadmillError::Connect {
            address: peer.to_string(),
            source: e,
        })?;

        info!(%peer, "Treadmill connected over UDP");
        Ok(Self { transport: Some(Transport::Udp(socket)), peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Drive both belts of a split-belt treadmill.
    pub fn set_speed(&mut self, left: f64, right: f64, acceleration: f64) -> Result<(), TreadmillError> {
        self.send(&BeltSpeeds {
            front_left: left,
            front_right: right,
            rear_left: left,
            rear_right: right,
            acceleration,
        })
    }

    /// Drive all four belts independently.
    pub fn set_speed4(
        &mut self,
        front_left: f64,
        front_right: f64,
        rear_left: f64,
        rear_right: f64,
        acceleration: f64,
    ) -> Result<(), TreadmillError> {
        self.send(&BeltSpeeds { front_left, front_right, rear_left, rear_right, acceleration })
    }

    pub fn send(&mut self, speeds: &BeltSpeeds) -> Result<(), TreadmillError> {
        let packet = speed_packet(speeds);
        let result = match self.transport.as_mut().ok_or(TreadmillError::NotConnected)? {
            Transport::Tcp(stream) => stream.write_all(&packet),
            Transport::Udp(socket) => socket.send(&packet).map(|_| ()),
        };
        result.map_err(|e| TreadmillError::Send { source: e })?;

        debug!(?speeds, "Treadmill speed sent");
        Ok(())
    }

    /// Drop the connection. Later sends fail with `NotConnected`.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            info!(peer = %self.peer, "Treadmill connection closed");
        }
    }
}

impl Drop for TreadmillRemote {
    fn drop(&mut self) {
        self.close();
    }
}
