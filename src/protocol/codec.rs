//! Payload encoders and decoders
//!
//! Strings are a `u16` length followed by UTF-8, counts are `u32`, and every
//! count is checked against the bytes still unread before anything is
//! allocated for it. Frames decode in two passes: the first validates the whole
//! payload and measures it into a [`FrameShape`], the second writes into a
//! frame already reshaped to fit.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};

use crate::buffer::{AnalogShape, BodyShape, FrameShape};
use crate::types::{
    BodyDefinition, BodyDefinitionSet, Frame, Hierarchy, HostInfo, MarkerData, SegmentData, SkyReturn,
    SkyReturnType, SkyValue, TimeCodeStandard, VoltageRange,
};
use crate::{CortexError, Result, ReturnCode};

/// Coordinate value the host uses for a marker it could not see.
///
/// Any marker whose X equals this value decodes as `None`, so it is not a
/// usable coordinate.
pub const XEMPTY: f32 = 9_999_999.0;

const MARKER_LEN: usize = 12;
const SEGMENT_LEN: usize = 7 * 8;
const FORCE_LEN: usize = 7 * 4;
const STR_MIN_LEN: usize = 2;
/// Name length, counts, residuals, iterations and encoders of an empty body.
const BODY_MIN_LEN: usize = STR_MIN_LEN + 4 + 4 + 4 + 4 + 4 + 4 + 12 + 4;

/// Bounds-checked cursor over a payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    context: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, context }
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(CortexError::protocol(
                self.context,
                format!("truncated {}: need {} bytes, {} left", what, len, self.buf.remaining()),
            ));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        self.need(2, "i16")?;
        Ok(self.buf.get_i16())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub(crate) fn f32(&mut self) -> Result<f32> {
        self.need(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    pub(crate) fn str(&mut self) -> Result<&'a str> {
        let len = self.u16()? as usize;
        self.need(len, "string")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        std::str::from_utf8(head).map_err(|e| CortexError::protocol(self.context, format!("invalid UTF-8: {}", e)))
    }

    /// Read a count of elements that each take at least `elem_len` bytes.
    pub(crate) fn count(&mut self, elem_len: usize, what: &str) -> Result<usize> {
        let count = self.u32()? as usize;
        self.check_fits(count, elem_len, what)?;
        Ok(count)
    }

    fn check_fits(&self, count: usize, elem_len: usize, what: &str) -> Result<()> {
        let fits = count.checked_mul(elem_len).is_some_and(|bytes| bytes <= self.buf.remaining());
        if !fits {
            return Err(CortexError::protocol(
                self.context,
                format!("{} {} do not fit in the {} bytes left", count, what, self.buf.remaining()),
            ));
        }
        Ok(())
    }

    pub(crate) fn skip(&mut self, len: usize, what: &str) -> Result<()> {
        self.need(len, what)?;
        self.buf.advance(len);
        Ok(())
    }

    fn marker(&mut self) -> Result<Option<MarkerData>> {
        let marker = [self.f32()?, self.f32()?, self.f32()?];
        Ok(if marker[0] == XEMPTY { None } else { Some(marker) })
    }

    fn f64x3(&mut self) -> Result<[f64; 3]> {
        Ok([self.f64()?, self.f64()?, self.f64()?])
    }

    fn f32x3(&mut self) -> Result<[f32; 3]> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    /// Two dimension counts whose product of `elem_len`-byte elements follows.
    fn dims(&mut self, elem_len: usize, what: &str) -> Result<(usize, usize)> {
        let outer = self.u32()? as usize;
        let inner = self.u32()? as usize;
        let total = outer.checked_mul(inner).ok_or_else(|| {
            CortexError::protocol(self.context, format!("{} dimensions {}x{} overflow", what, outer, inner))
        })?;
        self.check_fits(total, elem_len, what)?;
        Ok((outer, inner))
    }
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| CortexError::protocol("encoding string", format!("{} bytes exceeds u16 length", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = u32::try_from(count)
        .map_err(|_| CortexError::protocol("encoding count", format!("{} exceeds u32", count)))?;
    buf.put_u32(count);
    Ok(())
}

fn put_strs(buf: &mut BytesMut, values: &[String]) -> Result<()> {
    put_count(buf, values.len())?;
    for value in values {
        put_str(buf, value)?;
    }
    Ok(())
}

fn get_strs(r: &mut Reader<'_>, what: &str) -> Result<Vec<String>> {
    let count = r.count(STR_MIN_LEN, what)?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.str()?.to_owned());
    }
    Ok(values)
}

fn put_segment(buf: &mut BytesMut, segment: &SegmentData) {
    for v in segment.position.iter().chain(&segment.rotation) {
        buf.put_f64(*v);
    }
    buf.put_f64(segment.length);
}

fn get_segment(r: &mut Reader<'_>) -> Result<SegmentData> {
    Ok(SegmentData { position: r.f64x3()?, rotation: r.f64x3()?, length: r.f64()? })
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Append the wire form of `frame`.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    buf.put_i32(frame.frame_number);
    buf.put_f32(frame.delay);

    put_count(buf, frame.bodies.len())?;
    for body in &frame.bodies {
        put_str(buf, &body.name)?;

        put_count(buf, body.markers.len())?;
        for marker in &body.markers {
            let [x, y, z] = marker.unwrap_or([XEMPTY; 3]);
            buf.put_f32(x);
            buf.put_f32(y);
            buf.put_f32(z);
        }
        buf.put_f32(body.avg_marker_residual);

        put_count(buf, body.segments.len())?;
        for segment in &body.segments {
            put_segment(buf, segment);
        }

        put_count(buf, body.dofs.len())?;
        for dof in &body.dofs {
            buf.put_f64(*dof);
        }
        buf.put_f32(body.avg_dof_residual);
        buf.put_i32(body.iterations);
        buf.put_i32(body.encoders.zoom);
        buf.put_i32(body.encoders.focus);
        buf.put_i32(body.encoders.iris);

        put_strs(buf, &body.events)?;
    }

    put_count(buf, frame.unidentified_markers.len())?;
    for marker in &frame.unidentified_markers {
        for v in marker {
            buf.put_f32(*v);
        }
    }

    let analog = &frame.analog;
    put_count(buf, analog.channel_count)?;
    put_count(buf, analog.samples_per_channel)?;
    for sample in &analog.samples {
        buf.put_i16(*sample);
    }
    put_count(buf, analog.force_plate_count)?;
    put_count(buf, analog.samples_per_plate)?;
    for force in &analog.forces {
        for v in force.position.iter().chain(&force.force) {
            buf.put_f32(*v);
        }
        buf.put_f32(force.moment_z);
    }
    put_count(buf, analog.encoder_count)?;
    put_count(buf, analog.samples_per_encoder)?;
    for angle in &analog.encoder_angles {
        buf.put_f64(*angle);
    }

    buf.put_u8(frame.recording.recording as u8);
    buf.put_i32(frame.recording.first_frame);
    buf.put_i32(frame.recording.last_frame);
    put_str(buf, &frame.recording.filename)?;

    let tc = &frame.timecode;
    buf.put_u8(tc.standard.as_u8());
    buf.put_slice(&[tc.hours, tc.minutes, tc.seconds, tc.frames]);
    Ok(())
}

/// Validate a frame payload and measure the arrays it needs.
pub fn scan_frame(payload: &[u8]) -> Result<FrameShape> {
    let mut r = Reader::new(payload, "frame");
    r.skip(8, "frame number and delay")?;

    let body_count = r.count(BODY_MIN_LEN, "bodies")?;
    let mut bodies = Vec::new();
    bodies
        .try_reserve_exact(body_count)
        .map_err(|_| CortexError::allocation_failed("measuring bodies", body_count))?;

    for _ in 0..body_count {
        r.str()?;
        let markers = r.count(MARKER_LEN, "markers")?;
        r.skip(markers * MARKER_LEN + 4, "markers")?;
        let segments = r.count(SEGMENT_LEN, "segments")?;
        r.skip(segments * SEGMENT_LEN, "segments")?;
        let dofs = r.count(8, "dofs")?;
        r.skip(dofs * 8 + 4 + 4 + 12, "dofs")?;
        let events = r.count(STR_MIN_LEN, "events")?;
        for _ in 0..events {
            r.str()?;
        }
        bodies.push(BodyShape { markers, segments, dofs, events });
    }

    let unidentified_markers = r.count(MARKER_LEN, "unidentified markers")?;
    r.skip(unidentified_markers * MARKER_LEN, "unidentified markers")?;

    let (channel_count, samples_per_channel) = r.dims(2, "analog samples")?;
    r.skip(channel_count * samples_per_channel * 2, "analog samples")?;
    let (force_plate_count, samples_per_plate) = r.dims(FORCE_LEN, "force samples")?;
    r.skip(force_plate_count * samples_per_plate * FORCE_LEN, "force samples")?;
    let (encoder_count, samples_per_encoder) = r.dims(8, "encoder samples")?;
    r.skip(encoder_count * samples_per_encoder * 8, "encoder samples")?;

    r.skip(9, "recording status")?;
    r.str()?;

    let standard = r.u8()?;
    if TimeCodeStandard::from_u8(standard).is_none() {
        return Err(CortexError::protocol("frame", format!("unknown timecode standard {}", standard)));
    }
    r.skip(4, "timecode")?;

    Ok(FrameShape {
        bodies,
        unidentified_markers,
        analog: AnalogShape {
            channel_count,
            samples_per_channel,
            force_plate_count,
            samples_per_plate,
            encoder_count,
            samples_per_encoder,
        },
    })
}

/// Decode a frame payload into `frame`, reusing its allocations.
///
/// On error `frame` holds its previous contents.
pub fn decode_frame_into(payload: &[u8], frame: &mut Frame) -> Result<()> {
    let shape = scan_frame(payload)?;
    frame.reshape(&shape)?;

    let mut r = Reader::new(payload, "frame");
    frame.frame_number = r.i32()?;
    frame.delay = r.f32()?;

    r.u32()?;
    for body in frame.bodies.iter_mut() {
        let name = r.str()?;
        body.name.clear();
        body.name.push_str(name);

        r.u32()?;
        for marker in body.markers.iter_mut() {
            *marker = r.marker()?;
        }
        body.avg_marker_residual = r.f32()?;

        r.u32()?;
        for segment in body.segments.iter_mut() {
            *segment = get_segment(&mut r)?;
        }

        r.u32()?;
        for dof in body.dofs.iter_mut() {
            *dof = r.f64()?;
        }
        body.avg_dof_residual = r.f32()?;
        body.iterations = r.i32()?;
        body.encoders.zoom = r.i32()?;
        body.encoders.focus = r.i32()?;
        body.encoders.iris = r.i32()?;

        r.u32()?;
        for event in body.events.iter_mut() {
            let text = r.str()?;
            event.clear();
            event.push_str(text);
        }
    }

    r.u32()?;
    for marker in frame.unidentified_markers.iter_mut() {
        *marker = r.f32x3()?;
    }

    let analog = &mut frame.analog;
    r.skip(8, "analog dimensions")?;
    for sample in analog.samples.iter_mut() {
        *sample = r.i16()?;
    }
    r.skip(8, "force dimensions")?;
    for force in analog.forces.iter_mut() {
        force.position = r.f32x3()?;
        force.force = r.f32x3()?;
        force.moment_z = r.f32()?;
    }
    r.skip(8, "encoder dimensions")?;
    for angle in analog.encoder_angles.iter_mut() {
        *angle = r.f64()?;
    }

    frame.recording.recording = r.u8()? != 0;
    frame.recording.first_frame = r.i32()?;
    frame.recording.last_frame = r.i32()?;
    let filename = r.str()?;
    frame.recording.filename.clear();
    frame.recording.filename.push_str(filename);

    frame.timecode.standard = TimeCodeStandard::from_u8(r.u8()?).unwrap_or_default();
    frame.timecode.hours = r.u8()?;
    frame.timecode.minutes = r.u8()?;
    frame.timecode.seconds = r.u8()?;
    frame.timecode.frames = r.u8()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Body definitions
// ---------------------------------------------------------------------------

pub fn encode_body_defs(defs: &BodyDefinitionSet, buf: &mut BytesMut) -> Result<()> {
    put_count(buf, defs.bodies.len())?;
    for body in &defs.bodies {
        put_str(buf, &body.name)?;
        put_strs(buf, &body.marker_names)?;
        put_strs(buf, body.hierarchy.names())?;
        for parent in body.hierarchy.raw_parents() {
            buf.put_i32(parent);
        }
        put_strs(buf, &body.dof_names)?;
    }

    put_strs(buf, &defs.analog_channel_names)?;
    buf.put_u32(defs.force_plate_count);
    match defs.analog_bit_depth {
        Some(depth) => {
            buf.put_u8(1);
            buf.put_u32(depth);
        }
        None => buf.put_u8(0),
    }

    match &defs.analog_voltage_ranges {
        Some(ranges) => {
            if ranges.len() != defs.analog_channel_names.len() {
                return Err(CortexError::protocol(
                    "encoding body definitions",
                    format!("{} voltage ranges for {} channels", ranges.len(), defs.analog_channel_names.len()),
                ));
            }
            buf.put_u8(1);
            for range in ranges {
                buf.put_f32(range.low);
                buf.put_f32(range.high);
            }
        }
        None => buf.put_u8(0),
    }
    Ok(())
}

pub fn decode_body_defs(payload: &[u8]) -> Result<BodyDefinitionSet> {
    let mut r = Reader::new(payload, "body definitions");

    let body_count = r.count(STR_MIN_LEN + 12, "bodies")?;
    let mut bodies = Vec::with_capacity(body_count);
    for _ in 0..body_count {
        let name = r.str()?.to_owned();
        let marker_names = get_strs(&mut r, "marker names")?;

        let segment_names = get_strs(&mut r, "segment names")?;
        r.check_fits(segment_names.len(), 4, "segment parents")?;
        let mut parents = Vec::with_capacity(segment_names.len());
        for _ in 0..segment_names.len() {
            parents.push(r.i32()?);
        }
        let hierarchy = Hierarchy::from_raw_parents(segment_names, &parents)
            .map_err(|e| CortexError::protocol("body definitions", format!("body '{}': {}", name, e)))?;

        let dof_names = get_strs(&mut r, "dof names")?;
        bodies.push(BodyDefinition { name, marker_names, hierarchy, dof_names });
    }

    let analog_channel_names = get_strs(&mut r, "analog channel names")?;
    let force_plate_count = r.u32()?;
    let analog_bit_depth = if r.u8()? != 0 { Some(r.u32()?) } else { None };

    let analog_voltage_ranges = if r.u8()? != 0 {
        r.check_fits(analog_channel_names.len(), 8, "voltage ranges")?;
        let mut ranges = Vec::with_capacity(analog_channel_names.len());
        for _ in 0..analog_channel_names.len() {
            ranges.push(VoltageRange { low: r.f32()?, high: r.f32()? });
        }
        Some(ranges)
    } else {
        None
    };

    Ok(BodyDefinitionSet { bodies, analog_channel_names, force_plate_count, analog_bit_depth, analog_voltage_ranges })
}

// ---------------------------------------------------------------------------
// Host identity, Sky returns, skeleton pushes
// ---------------------------------------------------------------------------

pub fn encode_host_info(info: &HostInfo, buf: &mut BytesMut) -> Result<()> {
    put_str(buf, &info.machine_name)?;
    buf.put_slice(&info.machine_address.octets());
    put_str(buf, &info.program_name)?;
    buf.put_slice(&info.program_version);
    Ok(())
}

/// Decode a discovery reply. Liveness fields are left at their defaults.
pub fn decode_host_info(payload: &[u8]) -> Result<HostInfo> {
    let mut r = Reader::new(payload, "host info");
    let machine_name = r.str()?.to_owned();
    let machine_address = Ipv4Addr::new(r.u8()?, r.u8()?, r.u8()?, r.u8()?);
    let program_name = r.str()?.to_owned();
    let program_version = [r.u8()?, r.u8()?, r.u8()?, r.u8()?];
    Ok(HostInfo { machine_name, machine_address, program_name, program_version, ..Default::default() })
}

pub fn encode_sky_return(ret: &SkyReturn, buf: &mut BytesMut) -> Result<()> {
    buf.put_u8(ret.code.as_u8());
    buf.put_u8(ret.return_type() as u8);
    match &ret.value {
        SkyValue::Void => {}
        SkyValue::String(s) => put_str(buf, s)?,
        SkyValue::Bool(v) => buf.put_u8(*v as u8),
        SkyValue::Char(v) => buf.put_i8(*v),
        SkyValue::Short(v) => buf.put_i16(*v),
        SkyValue::Int(v) => buf.put_i32(*v),
        SkyValue::Long(v) => buf.put_i64(*v),
        SkyValue::Float(v) => buf.put_f32(*v),
        SkyValue::Double(v) => buf.put_f64(*v),
    }
    Ok(())
}

pub fn decode_sky_return(payload: &[u8]) -> Result<SkyReturn> {
    let mut r = Reader::new(payload, "sky return");
    let code = ReturnCode::from_u8(r.u8()?);
    let tag = r.u8()?;
    let kind = SkyReturnType::from_u8(tag)
        .ok_or_else(|| CortexError::protocol("sky return", format!("unknown return type {}", tag)))?;

    let value = match kind {
        SkyReturnType::Void => SkyValue::Void,
        SkyReturnType::String => SkyValue::String(r.str()?.to_owned()),
        SkyReturnType::Bool => SkyValue::Bool(r.u8()? != 0),
        SkyReturnType::Char => SkyValue::Char(r.u8()? as i8),
        SkyReturnType::Short => SkyValue::Short(r.i16()?),
        SkyReturnType::Int => SkyValue::Int(r.i32()?),
        SkyReturnType::Long => SkyValue::Long(r.i64()?),
        SkyReturnType::Float => SkyValue::Float(r.f32()?),
        SkyReturnType::Double => SkyValue::Double(r.f64()?),
    };
    Ok(SkyReturn { code, value })
}

/// Append a skeleton push: one named segment per hierarchy entry.
pub fn encode_htr(hierarchy: &Hierarchy, segments: &[SegmentData], buf: &mut BytesMut) -> Result<()> {
    if segments.len() != hierarchy.len() {
        return Err(CortexError::api_misuse(format!(
            "{} segment transforms for a hierarchy of {} segments",
            segments.len(),
            hierarchy.len()
        )));
    }

    put_count(buf, segments.len())?;
    for ((name, parent), segment) in hierarchy.names().iter().zip(hierarchy.raw_parents()).zip(segments) {
        put_str(buf, name)?;
        buf.put_i32(parent);
        put_segment(buf, segment);
    }
    Ok(())
}

pub fn decode_htr(payload: &[u8]) -> Result<(Hierarchy, Vec<SegmentData>)> {
    let mut r = Reader::new(payload, "skeleton");
    let count = r.count(STR_MIN_LEN + 4 + SEGMENT_LEN, "segments")?;

    let mut names = Vec::with_capacity(count);
    let mut parents = Vec::with_capacity(count);
    let mut segments = Vec::with_capacity(count);
    for _ in 0..count {
        names.push(r.str()?.to_owned());
        parents.push(r.i32()?);
        segments.push(get_segment(&mut r)?);
    }

    let hierarchy = Hierarchy::from_raw_parents(names, &parents)
        .map_err(|e| CortexError::protocol("skeleton", e.to_string()))?;
    Ok((hierarchy, segments))
}

/// Request, Sky command and error texts are the whole payload.
pub fn decode_text(payload: &[u8]) -> Result<&str> {
    std::str::from_utf8(payload).map_err(|e| CortexError::protocol("command text", format!("invalid UTF-8: {}", e)))
}
