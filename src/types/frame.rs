//! Per-frame motion data streamed by the host

use serde::{Deserialize, Serialize};

/// One marker position (X, Y, Z).
pub type MarkerData = [f32; 3];

/// Segment transform relative to the parent segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    pub position: [f64; 3],
    /// Euler angles in degrees, in the host's ZYX convention.
    pub rotation: [f64; 3],
    pub length: f64,
}

/// One force-plate sample: center of pressure, force vector and vertical moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForceSample {
    pub position: [f32; 3],
    pub force: [f32; 3],
    pub moment_z: f32,
}

/// Camera tracker lens encoder readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraEncoders {
    pub zoom: i32,
    pub focus: i32,
    pub iris: i32,
}

/// One body's pose for one frame.
///
/// Bodies are matched to their definitions by `name`; the host does not
/// guarantee a stable order across frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyFrame {
    pub name: String,
    /// `None` means the marker was not seen this frame.
    ///
    /// On the wire an unseen marker has X set to
    /// [`XEMPTY`](crate::protocol::codec::XEMPTY), so a seen marker whose X
    /// is exactly that value also arrives as `None`.
    pub markers: Vec<Option<MarkerData>>,
    pub avg_marker_residual: f32,
    pub segments: Vec<SegmentData>,
    pub dofs: Vec<f64>,
    pub avg_dof_residual: f32,
    pub iterations: i32,
    pub encoders: CameraEncoders,
    /// Names of the events that fired on this frame.
    pub events: Vec<String>,
}

/// Analog samples gathered during one video frame.
///
/// Each flat vector is laid out `[sample][channel]` and its length is always
/// the product of the two counts next to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalogFrame {
    pub channel_count: usize,
    pub samples_per_channel: usize,
    pub samples: Vec<i16>,

    pub force_plate_count: usize,
    pub samples_per_plate: usize,
    pub forces: Vec<ForceSample>,

    pub encoder_count: usize,
    pub samples_per_encoder: usize,
    pub encoder_angles: Vec<f64>,
}

impl AnalogFrame {
    /// Raw sample of `channel` at sub-frame `sample`.
    pub fn sample(&self, sample: usize, channel: usize) -> Option<i16> {
        if channel >= self.channel_count {
            return None;
        }
        self.samples.get(sample * self.channel_count + channel).copied()
    }

    /// Force sample of `plate` at sub-frame `sample`.
    pub fn force(&self, sample: usize, plate: usize) -> Option<&ForceSample> {
        if plate >= self.force_plate_count {
            return None;
        }
        self.forces.get(sample * self.force_plate_count + plate)
    }
}

/// Recording state of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub recording: bool,
    pub first_frame: i32,
    pub last_frame: i32,
    pub filename: String,
}

/// Timecode standard used for frame alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeCodeStandard {
    #[default]
    None,
    Smpte,
    Film,
    Ebu,
    SystemClock,
}

impl TimeCodeStandard {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TimeCodeStandard::None),
            1 => Some(TimeCodeStandard::Smpte),
            2 => Some(TimeCodeStandard::Film),
            3 => Some(TimeCodeStandard::Ebu),
            4 => Some(TimeCodeStandard::SystemClock),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TimeCodeStandard::None => 0,
            TimeCodeStandard::Smpte => 1,
            TimeCodeStandard::Film => 2,
            TimeCodeStandard::Ebu => 3,
            TimeCodeStandard::SystemClock => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeCode {
    pub standard: TimeCodeStandard,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
}

/// Everything the host streams for one frame.
///
/// A `Frame` is reused across deliveries: the subscriber overwrites it in
/// place when the next datagram arrives. Use [`Clone`] or
/// [`Frame::copy_into`] to keep data past the handler's return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_number: i32,
    /// Seconds from camera exposure to the host sending this frame.
    pub delay: f32,
    pub bodies: Vec<BodyFrame>,
    pub unidentified_markers: Vec<MarkerData>,
    pub analog: AnalogFrame,
    pub recording: RecordingStatus,
    pub timecode: TimeCode,
}

impl Frame {
    /// Find a body by name.
    pub fn body(&self, name: &str) -> Option<&BodyFrame> {
        self.bodies.iter().find(|b| b.name == name)
    }

    /// True when no sub-array holds data and all scalars are zero.
    pub fn is_empty(&self) -> bool {
        *self == Frame::default()
    }
}
