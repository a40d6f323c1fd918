//! Frame buffer management.
//!
//! A [`Frame`] is decoded into over and over. Instead of allocating a new frame
//! per datagram, the decoder describes the incoming dimensions as a
//! [`FrameShape`] and [`Frame::reshape`] resizes the existing sub-arrays to
//! match: shrinking and same-size reshapes keep their allocations, growth is
//! reserved fallibly.
//!
//! All growth is reserved before any length changes. If an allocation fails the
//! frame keeps its previous contents and a [`CortexError::Memory`] is returned.

use crate::types::{AnalogFrame, BodyFrame, Frame};
use crate::{CortexError, Result};

/// Array dimensions of one body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyShape {
    pub markers: usize,
    pub segments: usize,
    pub dofs: usize,
    pub events: usize,
}

/// Array dimensions of the analog block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalogShape {
    pub channel_count: usize,
    pub samples_per_channel: usize,
    pub force_plate_count: usize,
    pub samples_per_plate: usize,
    pub encoder_count: usize,
    pub samples_per_encoder: usize,
}

impl AnalogShape {
    fn sample_len(&self) -> Result<usize> {
        checked_product(self.channel_count, self.samples_per_channel, "analog samples")
    }

    fn force_len(&self) -> Result<usize> {
        checked_product(self.force_plate_count, self.samples_per_plate, "force samples")
    }

    fn encoder_len(&self) -> Result<usize> {
        checked_product(self.encoder_count, self.samples_per_encoder, "encoder samples")
    }
}

/// Array dimensions of a whole frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameShape {
    pub bodies: Vec<BodyShape>,
    pub unidentified_markers: usize,
    pub analog: AnalogShape,
}

fn checked_product(a: usize, b: usize, what: &str) -> Result<usize> {
    a.checked_mul(b).ok_or_else(|| CortexError::allocation_failed(format!("sizing {}", what), usize::MAX))
}

/// Make sure `vec` can hold `len` elements without reallocating.
fn reserve_len<T>(vec: &mut Vec<T>, len: usize, what: &str) -> Result<()> {
    if len > vec.capacity() {
        vec.try_reserve_exact(len - vec.len())
            .map_err(|_| CortexError::allocation_failed(format!("reserving {}", what), len))?;
    }
    Ok(())
}

impl BodyShape {
    fn reserve(&self, body: &mut BodyFrame) -> Result<()> {
        reserve_len(&mut body.markers, self.markers, "body markers")?;
        reserve_len(&mut body.segments, self.segments, "body segments")?;
        reserve_len(&mut body.dofs, self.dofs, "body dofs")?;
        reserve_len(&mut body.events, self.events, "body events")?;
        Ok(())
    }

    /// Only called after `reserve` succeeded, so none of these allocate.
    fn apply(&self, body: &mut BodyFrame) {
        body.markers.resize(self.markers, None);
        body.segments.resize(self.segments, Default::default());
        body.dofs.resize(self.dofs, 0.0);
        body.events.resize_with(self.events, String::new);
    }
}

impl AnalogShape {
    fn reserve(&self, analog: &mut AnalogFrame) -> Result<()> {
        reserve_len(&mut analog.samples, self.sample_len()?, "analog samples")?;
        reserve_len(&mut analog.forces, self.force_len()?, "force samples")?;
        reserve_len(&mut analog.encoder_angles, self.encoder_len()?, "encoder samples")?;
        Ok(())
    }

    fn apply(&self, analog: &mut AnalogFrame) -> Result<()> {
        analog.channel_count = self.channel_count;
        analog.samples_per_channel = self.samples_per_channel;
        analog.samples.resize(self.sample_len()?, 0);

        analog.force_plate_count = self.force_plate_count;
        analog.samples_per_plate = self.samples_per_plate;
        analog.forces.resize(self.force_len()?, Default::default());

        analog.encoder_count = self.encoder_count;
        analog.samples_per_encoder = self.samples_per_encoder;
        analog.encoder_angles.resize(self.encoder_len()?, 0.0);
        Ok(())
    }
}

impl BodyFrame {
    /// Current array dimensions.
    pub fn shape(&self) -> BodyShape {
        BodyShape {
            markers: self.markers.len(),
            segments: self.segments.len(),
            dofs: self.dofs.len(),
            events: self.events.len(),
        }
    }

    /// Resize this body's arrays to `shape`, keeping existing allocations.
    pub fn reshape(&mut self, shape: &BodyShape) -> Result<()> {
        shape.reserve(self)?;
        shape.apply(self);
        Ok(())
    }
}

impl AnalogFrame {
    pub fn shape(&self) -> AnalogShape {
        AnalogShape {
            channel_count: self.channel_count,
            samples_per_channel: self.samples_per_channel,
            force_plate_count: self.force_plate_count,
            samples_per_plate: self.samples_per_plate,
            encoder_count: self.encoder_count,
            samples_per_encoder: self.samples_per_encoder,
        }
    }

    pub fn reshape(&mut self, shape: &AnalogShape) -> Result<()> {
        shape.reserve(self)?;
        shape.apply(self)
    }
}

impl Frame {
    /// Current array dimensions.
    pub fn shape(&self) -> FrameShape {
        FrameShape {
            bodies: self.bodies.iter().map(BodyFrame::shape).collect(),
            unidentified_markers: self.unidentified_markers.len(),
            analog: self.analog.shape(),
        }
    }

    /// Resize every sub-array to exactly `shape`.
    ///
    /// Element values that survive the resize are left as they were; new
    /// elements are zeroed (`None` for markers). On error nothing but spare
    /// capacity has changed.
    pub fn reshape(&mut self, shape: &FrameShape) -> Result<()> {
        let body_count = shape.bodies.len();

        reserve_len(&mut self.bodies, body_count, "bodies")?;
        reserve_len(&mut self.unidentified_markers, shape.unidentified_markers, "unidentified markers")?;
        shape.analog.reserve(&mut self.analog)?;

        for (body, body_shape) in self.bodies.iter_mut().zip(&shape.bodies) {
            body_shape.reserve(body)?;
        }

        // Bodies beyond the current count are built off to the side so a
        // failure cannot leave half-grown entries in the frame.
        let mut fresh = Vec::new();
        if body_count > self.bodies.len() {
            let missing = &shape.bodies[self.bodies.len()..];
            fresh
                .try_reserve_exact(missing.len())
                .map_err(|_| CortexError::allocation_failed("reserving bodies", body_count))?;
            for body_shape in missing {
                let mut body = BodyFrame::default();
                body_shape.reserve(&mut body)?;
                fresh.push(body);
            }
        }

        self.bodies.truncate(body_count);
        self.bodies.append(&mut fresh);
        for (body, body_shape) in self.bodies.iter_mut().zip(&shape.bodies) {
            body_shape.apply(body);
        }

        self.unidentified_markers.resize(shape.unidentified_markers, [0.0; 3]);
        shape.analog.apply(&mut self.analog)
    }

    /// Deep-copy this frame into `dst`, reusing `dst`'s allocations.
    ///
    /// `dst` may be a fresh default frame or a previously used one.
    pub fn copy_into(&self, dst: &mut Frame) -> Result<()> {
        dst.reshape(&self.shape())?;

        dst.frame_number = self.frame_number;
        dst.delay = self.delay;

        for (d, s) in dst.bodies.iter_mut().zip(&self.bodies) {
            d.name.clone_from(&s.name);
            d.markers.copy_from_slice(&s.markers);
            d.avg_marker_residual = s.avg_marker_residual;
            d.segments.copy_from_slice(&s.segments);
            d.dofs.copy_from_slice(&s.dofs);
            d.avg_dof_residual = s.avg_dof_residual;
            d.iterations = s.iterations;
            d.encoders = s.encoders;
            for (de, se) in d.events.iter_mut().zip(&s.events) {
                de.clone_from(se);
            }
        }

        dst.unidentified_markers.copy_from_slice(&self.unidentified_markers);
        dst.analog.samples.copy_from_slice(&self.analog.samples);
        dst.analog.forces.copy_from_slice(&self.analog.forces);
        dst.analog.encoder_angles.copy_from_slice(&self.analog.encoder_angles);
        dst.recording.clone_from(&self.recording);
        dst.timecode = self.timecode;

        Ok(())
    }

    /// Free every sub-array and reset to the empty frame.
    ///
    /// Releasing an already empty frame does nothing.
    pub fn release(&mut self) {
        *self = Frame::default();
    }

    /// Total element capacity held by this frame's sub-arrays.
    pub fn retained_capacity(&self) -> usize {
        let bodies: usize = self
            .bodies
            .iter()
            .map(|b| b.markers.capacity() + b.segments.capacity() + b.dofs.capacity() + b.events.capacity())
            .sum();

        self.bodies.capacity()
            + bodies
            + self.unidentified_markers.capacity()
            + self.analog.samples.capacity()
            + self.analog.forces.capacity()
            + self.analog.encoder_angles.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ForceSample, SegmentData};
    use proptest::prelude::*;

    fn shape(bodies: &[(usize, usize, usize)], unidentified: usize) -> FrameShape {
        FrameShape {
            bodies: bodies
                .iter()
                .map(|&(markers, segments, dofs)| BodyShape { markers, segments, dofs, events: 0 })
                .collect(),
            unidentified_markers: unidentified,
            analog: AnalogShape {
                channel_count: 4,
                samples_per_channel: 2,
                force_plate_count: 1,
                samples_per_plate: 2,
                encoder_count: 0,
                samples_per_encoder: 0,
            },
        }
    }

    fn populated_frame() -> Frame {
        let mut frame = Frame::default();
        frame.reshape(&shape(&[(3, 2, 4), (1, 0, 0)], 2)).unwrap();
        frame.frame_number = 42;
        frame.delay = 0.012;
        frame.bodies[0].name = "Subject".into();
        frame.bodies[0].markers[0] = Some([1.0, 2.0, 3.0]);
        frame.bodies[0].segments[1] = SegmentData { position: [1.0; 3], rotation: [0.0, 90.0, 0.0], length: 0.4 };
        frame.bodies[0].dofs[3] = 12.5;
        frame.bodies[1].name = "Wand".into();
        frame.unidentified_markers[1] = [9.0, 8.0, 7.0];
        frame.analog.samples[5] = -300;
        frame.analog.forces[1] = ForceSample { force: [0.0, 0.0, 700.0], ..Default::default() };
        frame.recording.filename = "trial01.cap".into();
        frame
    }

    #[test]
    fn reshape_matches_requested_lengths() {
        let mut frame = Frame::default();
        let target = shape(&[(5, 3, 2)], 7);
        frame.reshape(&target).unwrap();

        assert_eq!(frame.shape(), target);
        assert_eq!(frame.analog.samples.len(), 8);
        assert_eq!(frame.analog.forces.len(), 2);
    }

    #[test]
    fn shrinking_keeps_allocations() {
        let mut frame = Frame::default();
        frame.reshape(&shape(&[(100, 10, 10)], 50)).unwrap();
        let marker_capacity = frame.bodies[0].markers.capacity();

        frame.reshape(&shape(&[(3, 1, 1)], 2)).unwrap();
        assert_eq!(frame.bodies[0].markers.len(), 3);
        assert_eq!(frame.bodies[0].markers.capacity(), marker_capacity);
    }

    #[test]
    fn failed_growth_leaves_frame_intact() {
        let mut frame = populated_frame();
        let before = frame.clone();

        let mut huge = frame.shape();
        huge.bodies[0].markers = usize::MAX / 2;
        let err = frame.reshape(&huge).unwrap_err();

        assert!(matches!(err, CortexError::Memory { .. }));
        assert_eq!(frame, before);
    }

    #[test]
    fn overflowing_analog_dimensions_are_memory_errors() {
        let mut frame = populated_frame();
        let before = frame.clone();

        let mut huge = frame.shape();
        huge.analog.channel_count = usize::MAX;
        huge.analog.samples_per_channel = 2;

        assert!(matches!(frame.reshape(&huge), Err(CortexError::Memory { .. })));
        assert_eq!(frame, before);
    }

    #[test]
    fn copy_is_equal_and_independent() {
        let src = populated_frame();
        let mut copy = Frame::default();
        src.copy_into(&mut copy).unwrap();
        assert_eq!(copy, src);

        copy.bodies[0].markers[0] = None;
        copy.bodies[0].name.push_str("-copy");
        assert_eq!(src.bodies[0].markers[0], Some([1.0, 2.0, 3.0]));
        assert_eq!(src.bodies[0].name, "Subject");
    }

    #[test]
    fn copy_into_used_frame_overwrites_everything() {
        let src = populated_frame();
        let mut dst = Frame::default();
        dst.reshape(&shape(&[(9, 9, 9), (9, 9, 9), (9, 9, 9)], 20)).unwrap();
        dst.bodies[2].name = "Stale".into();

        src.copy_into(&mut dst).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn release_copy_leaves_source_untouched() {
        let src = populated_frame();
        let snapshot = src.clone();

        let mut copy = Frame::default();
        src.copy_into(&mut copy).unwrap();
        copy.release();

        assert_eq!(src, snapshot);
        assert!(copy.is_empty());
    }

    #[test]
    fn release_frees_everything_and_is_idempotent() {
        let mut frame = populated_frame();
        assert!(frame.retained_capacity() > 0);

        frame.release();
        assert_eq!(frame.retained_capacity(), 0);
        assert!(frame.is_empty());

        frame.release();
        assert_eq!(frame.retained_capacity(), 0);
    }

    proptest! {
        #[test]
        fn prop_final_shape_is_last_requested(
            sequence in prop::collection::vec(
                (prop::collection::vec((0usize..20, 0usize..10, 0usize..10), 0..6), 0usize..30),
                1..6
            )
        ) {
            let mut frame = Frame::default();
            let mut last = FrameShape::default();

            for (bodies, unidentified) in sequence {
                last = shape(&bodies, unidentified);
                frame.reshape(&last).unwrap();
            }

            prop_assert_eq!(frame.shape(), last);

            frame.release();
            prop_assert_eq!(frame.retained_capacity(), 0);
        }
    }
}
