//! Test utilities: representative fixtures and a loopback fake host
//!
//! The fake host speaks the wire protocol on `127.0.0.1` so the command
//! channel, distribution server and session can be exercised without a real
//! capture system or multicast routing.

#![cfg(any(test, feature = "benchmark"))]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::protocol::{GET_BODY_DEFS, GET_CURRENT_FRAME, Header, MAX_DATAGRAM, Packet, PacketKind, codec, write_packet};
use crate::types::{
    BodyDefinition, BodyDefinitionSet, BodyFrame, CameraEncoders, ForceSample, Frame, Hierarchy, HostInfo,
    RecordingStatus, SegmentData, SkyReturn, SkyValue, TimeCode, TimeCodeStandard, VoltageRange,
};
use crate::ReturnCode;

/// A frame with every section populated, sized like a small two-subject capture.
pub fn sample_frame(frame_number: i32) -> Frame {
    let body = |name: &str, markers: usize| BodyFrame {
        name: name.to_string(),
        markers: (0..markers)
            .map(|i| if i % 7 == 3 { None } else { Some([i as f32, 100.0 + i as f32, 900.0]) })
            .collect(),
        avg_marker_residual: 0.35,
        segments: (0..12)
            .map(|i| SegmentData { position: [i as f64; 3], rotation: [0.0, 10.0 * i as f64, 0.0], length: 250.0 })
            .collect(),
        dofs: (0..30).map(|i| i as f64 * 0.5).collect(),
        avg_dof_residual: 0.02,
        iterations: 4,
        encoders: CameraEncoders::default(),
        events: vec!["LeftHeelStrike".to_string()],
    };

    let mut frame = Frame {
        frame_number,
        delay: 0.006,
        bodies: vec![body("SubjectA", 40), body("SubjectB", 40)],
        unidentified_markers: vec![[1.0, 2.0, 3.0]; 5],
        recording: RecordingStatus { recording: true, first_frame: 1, last_frame: 0, filename: "trial.cap".into() },
        timecode: TimeCode { standard: TimeCodeStandard::Smpte, hours: 10, minutes: 4, seconds: 33, frames: 12 },
        ..Default::default()
    };

    frame.analog.channel_count = 16;
    frame.analog.samples_per_channel = 10;
    frame.analog.samples = (0..160).map(|v| v as i16).collect();
    frame.analog.force_plate_count = 2;
    frame.analog.samples_per_plate = 10;
    frame.analog.forces = vec![ForceSample { force: [0.0, 0.0, 700.0], ..Default::default() }; 20];
    frame
}

pub fn sample_body_defs() -> BodyDefinitionSet {
    let hierarchy = Hierarchy::from_raw_parents(
        vec!["Pelvis".into(), "LThigh".into(), "LShank".into(), "RThigh".into()],
        &[-1, 0, 1, 0],
    )
    .expect("fixture hierarchy is valid");

    BodyDefinitionSet {
        bodies: vec![BodyDefinition {
            name: "SubjectA".into(),
            marker_names: vec!["LASI".into(), "RASI".into(), "LKNE".into()],
            hierarchy,
            dof_names: vec!["LHipFlex".into(), "LKneeFlex".into()],
        }],
        analog_channel_names: vec!["Fx".into(), "Fy".into()],
        force_plate_count: 1,
        analog_bit_depth: Some(16),
        analog_voltage_ranges: Some(vec![VoltageRange { low: -10.0, high: 10.0 }; 2]),
    }
}

pub fn sample_host_info() -> HostInfo {
    HostInfo {
        machine_name: "capture-rig".into(),
        machine_address: Ipv4Addr::LOCALHOST,
        program_name: "Cortex".into(),
        program_version: [0, 9, 0, 1],
        ..Default::default()
    }
}

/// Encode a complete frame datagram.
pub fn frame_datagram(frame: &Frame, flags: u8) -> Vec<u8> {
    let mut out = BytesMut::new();
    write_packet(&mut out, Header::new(PacketKind::Frame, 0).with_flags(flags), |buf| codec::encode_frame(frame, buf))
        .expect("fixture frame fits in a datagram");
    out.to_vec()
}

/// What the fake host does with one request.
pub enum Reply {
    Send { kind: PacketKind, payload: Vec<u8>, delay: Duration },
    Silent,
}

impl Reply {
    pub fn now(kind: PacketKind, payload: Vec<u8>) -> Self {
        Reply::Send { kind, payload, delay: Duration::ZERO }
    }
}

type Handler = dyn Fn(PacketKind, &[u8]) -> Reply + Send + Sync;

/// Minimal host on loopback answering with a caller-supplied handler.
pub struct FakeHost {
    addr: SocketAddrV4,
    received: Arc<Mutex<Vec<(PacketKind, Vec<u8>)>>>,
    cancel: CancellationToken,
}

impl FakeHost {
    pub async fn spawn<F>(handler: F) -> std::io::Result<Self>
    where
        F: Fn(PacketKind, &[u8]) -> Reply + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };

        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let handler: Arc<Handler> = Arc::new(handler);

        let log = received.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            let mut out = BytesMut::new();
            loop {
                let (len, from) = tokio::select! {
                    _ = stop.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(r) => r,
                        Err(_) => continue,
                    },
                };

                let Ok(packet) = Packet::parse(&buf[..len]) else { continue };
                log.lock().unwrap().push((packet.header.kind, packet.payload.to_vec()));

                if let Reply::Send { kind, payload, delay } = handler(packet.header.kind, packet.payload) {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let header = Header::new(kind, packet.header.sequence);
                    if write_packet(&mut out, header, |b| {
                        b.put_slice(&payload);
                        Ok(())
                    })
                    .is_ok()
                    {
                        let _ = socket.send_to(&out, from).await;
                    }
                }
            }
        });

        Ok(Self { addr, received, cancel })
    }

    /// A host that knows a fixed set of commands.
    ///
    /// `GetBodyDefs` and `GetCurrentFrame` answer with the fixtures, any
    /// command starting with `Bogus` is unrecognized, `Fail` reports a host
    /// error, other requests echo their text. Sky commands return the length
    /// of the command as an `Int`.
    pub async fn standard() -> std::io::Result<Self> {
        Self::spawn(|kind, payload| {
            let text = String::from_utf8_lossy(payload).into_owned();
            let mut buf = BytesMut::new();
            match kind {
                PacketKind::HostQuery => {
                    codec::encode_host_info(&sample_host_info(), &mut buf).unwrap();
                    Reply::now(PacketKind::HostInfo, buf.to_vec())
                }
                PacketKind::Request | PacketKind::SkyCommand if text.starts_with("Bogus") => {
                    Reply::now(PacketKind::Unrecognized, payload.to_vec())
                }
                PacketKind::Request if text == "Fail" => Reply::now(PacketKind::HostError, b"not now".to_vec()),
                PacketKind::Request if text == GET_BODY_DEFS => {
                    codec::encode_body_defs(&sample_body_defs(), &mut buf).unwrap();
                    Reply::now(PacketKind::Response, buf.to_vec())
                }
                PacketKind::Request if text == GET_CURRENT_FRAME => {
                    codec::encode_frame(&sample_frame(77), &mut buf).unwrap();
                    Reply::now(PacketKind::Response, buf.to_vec())
                }
                PacketKind::Request => Reply::now(PacketKind::Response, payload.to_vec()),
                PacketKind::SkyCommand => {
                    let ret = SkyReturn { code: ReturnCode::Okay, value: SkyValue::Int(text.len() as i32) };
                    codec::encode_sky_return(&ret, &mut buf).unwrap();
                    Reply::now(PacketKind::SkyReturn, buf.to_vec())
                }
                PacketKind::Htr => Reply::now(PacketKind::Response, Vec::new()),
                _ => Reply::Silent,
            }
        })
        .await
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// Every datagram received so far.
    pub fn received(&self) -> Vec<(PacketKind, Vec<u8>)> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
