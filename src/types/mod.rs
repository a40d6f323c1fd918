//! Core types for motion-capture data.
//!
//! ## Architecture
//!
//! - [`Frame`] is everything the host streams for one video frame: per-body
//!   poses, unidentified markers, analog samples, recording status, timecode
//! - [`BodyDefinitionSet`] describes what the host tracks; frames refer back to
//!   it by body name
//! - [`HostInfo`] is the discovery and liveness state of the host
//! - [`SkyReturn`] is the typed result of a Sky command
//!
//! Absent data is always an `Option`: a marker the cameras lost is `None`, and
//! analog calibration an older host never sent is `None` rather than zero.
//!
//! ## Usage Example
//!
//! ```rust
//! use cortex_stream::types::{BodyFrame, Frame};
//!
//! let mut frame = Frame::default();
//! frame.bodies.push(BodyFrame {
//!     name: "Wand".to_string(),
//!     markers: vec![Some([0.0, 10.0, 20.0]), None],
//!     ..Default::default()
//! });
//!
//! let wand = frame.body("Wand").unwrap();
//! let visible = wand.markers.iter().flatten().count();
//! assert_eq!(visible, 1);
//! ```

mod body_defs;
mod command;
mod frame;
mod host;
mod update_rate;

pub use body_defs::{BodyDefinition, BodyDefinitionSet, Hierarchy, VoltageRange};
pub use command::{SkyReturn, SkyReturnType, SkyValue};
pub use frame::{
    AnalogFrame, BodyFrame, CameraEncoders, ForceSample, Frame, MarkerData, RecordingStatus,
    SegmentData, TimeCode, TimeCodeStandard,
};
pub use host::HostInfo;
pub use update_rate::UpdateRate;

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_analog_indexing_stays_in_bounds(
            channels in 0usize..8,
            samples in 0usize..8,
            at_sample in 0usize..10,
            at_channel in 0usize..10
        ) {
            let analog = AnalogFrame {
                channel_count: channels,
                samples_per_channel: samples,
                samples: (0..channels * samples).map(|v| v as i16).collect(),
                ..Default::default()
            };

            let value = analog.sample(at_sample, at_channel);
            if at_channel < channels && at_sample < samples {
                prop_assert_eq!(value, Some((at_sample * channels + at_channel) as i16));
            } else {
                prop_assert!(value.is_none());
            }
        }

        #[test]
        fn prop_timecode_standard_roundtrip(value in 0u8..5) {
            let standard = TimeCodeStandard::from_u8(value).unwrap();
            prop_assert_eq!(standard.as_u8(), value);
        }
    }

    #[test]
    fn default_frame_is_empty() {
        assert!(Frame::default().is_empty());

        let mut frame = Frame::default();
        frame.frame_number = 1;
        assert!(!frame.is_empty());
    }

    #[test]
    fn body_lookup_is_by_name_not_position() {
        let frame = Frame {
            bodies: vec![
                BodyFrame { name: "B".into(), ..Default::default() },
                BodyFrame { name: "A".into(), iterations: 7, ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(frame.body("A").map(|b| b.iterations), Some(7));
        assert!(frame.body("C").is_none());
    }

    #[test]
    fn host_version_string_skips_module_id() {
        let info = HostInfo { program_version: [1, 7, 2, 3], ..Default::default() };
        assert_eq!(info.version_string(), "7.2.3");
    }

    #[test]
    fn host_confirmation_keeps_known_address() {
        let mut info = HostInfo::default();
        info.confirm("10.0.0.5".parse().unwrap());
        assert!(info.found);
        assert!(info.last_confirmation.is_some());

        info.confirm("10.0.0.9".parse().unwrap());
        assert_eq!(info.machine_address, "10.0.0.5".parse::<std::net::Ipv4Addr>().unwrap());
    }
}
