//! Wire codec for frame messages.
//!
//! ## Envelope Layout
//!
//! 1. **Magic** (2 bytes) - `b"FL"`
//! 2. **Schema** (u16 LE) - major in the high byte, minor in the low byte
//! 3. **Kind** (u8) - `0` video frame, `1` end of stream
//! 4. **Fields** - repeated `[tag u8][len u32 LE][value]` until the end of the buffer
//!
//! Readers accept every minor revision of a known major: newer minors only add
//! optional fields, and unknown field tags are skipped. Missing optional fields take
//! their defaults (`dts`, `duration`, `codec` absent, `keyframe` true, no tags,
//! no payload).
//!
//! Decoding is pure: the same bytes always produce the same message or the same
//! [`DecodeError`].
//!
//! ```rust
//! use framelane::codec::{decode, encode};
//! use framelane::FrameMessage;
//!
//! let frame = FrameMessage::builder("cam1", 100)
//!     .framerate("25/1")
//!     .resolution(640, 480)
//!     .inline(vec![0x00, 0x01])
//!     .build()
//!     .unwrap();
//!
//! let bytes = encode(&frame);
//! assert_eq!(decode(&bytes).unwrap(), frame);
//! ```

mod reader;

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::trace;

use crate::types::{ExternalFrame, FrameMessage, FrameParts, FramePayload, TagValue};
use crate::types::check_frame_fields;
use crate::DecodeError;
use reader::Reader;

/// Envelope magic bytes.
pub const MAGIC: [u8; 2] = *b"FL";

/// Schema written by this version of the codec.
pub const SCHEMA: SchemaVersion = SchemaVersion { major: 1, minor: 0 };

/// Largest value a single field may carry.
pub const MAX_FIELD_LEN: usize = u32::MAX as usize;

const HEADER_LEN: usize = 5;

const KIND_FRAME: u8 = 0;
const KIND_END_OF_STREAM: u8 = 1;

const TAG_SOURCE_ID: u8 = 1;
const TAG_PTS: u8 = 2;
const TAG_FRAMERATE: u8 = 3;
const TAG_WIDTH: u8 = 4;
const TAG_HEIGHT: u8 = 5;
const TAG_DTS: u8 = 6;
const TAG_DURATION: u8 = 7;
const TAG_CODEC: u8 = 8;
const TAG_KEYFRAME: u8 = 9;
const TAG_FRAME: u8 = 10;
const TAG_METADATA: u8 = 11;
const TAG_TAGS: u8 = 12;

/// Schema identifier carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaVersion {
    pub major: u8,
    pub minor: u8,
}

impl SchemaVersion {
    pub fn to_wire(self) -> u16 {
        u16::from(self.major) << 8 | u16::from(self.minor)
    }

    pub fn from_wire(raw: u16) -> Self {
        Self { major: (raw >> 8) as u8, minor: (raw & 0xff) as u8 }
    }

    /// Whether a reader of `self` understands envelopes written as `other`.
    pub fn can_read(self, other: SchemaVersion) -> bool {
        self.major == other.major
    }
}

/// Any message that can travel in an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Frame(FrameMessage),
    /// The source finished its stream; a restarted source may reuse lower frame ids.
    EndOfStream { source_id: String },
}

impl WireMessage {
    pub fn source_id(&self) -> &str {
        match self {
            WireMessage::Frame(frame) => frame.source_id(),
            WireMessage::EndOfStream { source_id } => source_id,
        }
    }
}

/// Encode a frame message.
pub fn encode(frame: &FrameMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + frame.payload().inline_len());
    put_header(&mut buf, KIND_FRAME);

    put_field(&mut buf, TAG_SOURCE_ID, frame.source_id().as_bytes());
    put_field(&mut buf, TAG_PTS, &frame.frame_id().to_le_bytes());
    put_field(&mut buf, TAG_FRAMERATE, frame.framerate().as_bytes());
    put_field(&mut buf, TAG_WIDTH, &frame.width().to_le_bytes());
    put_field(&mut buf, TAG_HEIGHT, &frame.height().to_le_bytes());
    if let Some(dts) = frame.decode_timestamp() {
        put_field(&mut buf, TAG_DTS, &dts.to_le_bytes());
    }
    if let Some(duration) = frame.duration() {
        put_field(&mut buf, TAG_DURATION, &duration.to_le_bytes());
    }
    if let Some(codec) = frame.codec() {
        put_field(&mut buf, TAG_CODEC, codec.as_bytes());
    }
    if !frame.keyframe() {
        put_field(&mut buf, TAG_KEYFRAME, &[0]);
    }
    if !matches!(frame.payload(), FramePayload::Absent) {
        put_field(&mut buf, TAG_FRAME, &encode_payload(frame.payload()));
    }
    if let Some(metadata) = frame.metadata() {
        // Value serialization only fails for non-string map keys, which Value cannot hold.
        let json = serde_json::to_vec(metadata).unwrap_or_default();
        put_field(&mut buf, TAG_METADATA, &json);
    }
    if !frame.tags().is_empty() {
        put_field(&mut buf, TAG_TAGS, &encode_tags(frame.tags()));
    }

    trace!(source_id = frame.source_id(), frame_id = frame.frame_id(), len = buf.len(), "encoded frame");
    buf.freeze()
}

/// Encode an end-of-stream announcement for `source_id`.
pub fn encode_end_of_stream(source_id: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 5 + source_id.len());
    put_header(&mut buf, KIND_END_OF_STREAM);
    put_field(&mut buf, TAG_SOURCE_ID, source_id.as_bytes());
    buf.freeze()
}

/// Encode any wire message.
pub fn encode_message(message: &WireMessage) -> Bytes {
    match message {
        WireMessage::Frame(frame) => encode(frame),
        WireMessage::EndOfStream { source_id } => encode_end_of_stream(source_id),
    }
}

/// Decode a frame message. End-of-stream envelopes are reported as
/// [`DecodeError::UnexpectedKind`]; use [`decode_envelope`] to accept both.
pub fn decode(bytes: &[u8]) -> Result<FrameMessage, DecodeError> {
    match decode_envelope(bytes)? {
        WireMessage::Frame(frame) => Ok(frame),
        WireMessage::EndOfStream { .. } => Err(DecodeError::UnexpectedKind { found: "end of stream" }),
    }
}

/// Decode any wire message.
pub fn decode_envelope(bytes: &[u8]) -> Result<WireMessage, DecodeError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.take(2)?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic { found: [magic[0], magic[1]] });
    }
    let schema = SchemaVersion::from_wire(reader.u16_le()?);
    if !SCHEMA.can_read(schema) {
        return Err(DecodeError::UnsupportedSchema { major: schema.major, minor: schema.minor });
    }
    let kind = reader.u8()?;
    if kind != KIND_FRAME && kind != KIND_END_OF_STREAM {
        return Err(DecodeError::UnknownKind { kind });
    }

    let fields = FieldSet::read(&mut reader)?;

    if kind == KIND_END_OF_STREAM {
        let source_id = fields.required_string(TAG_SOURCE_ID, "source_id")?;
        if source_id.is_empty() {
            return Err(DecodeError::invalid("source_id", "must not be empty"));
        }
        return Ok(WireMessage::EndOfStream { source_id });
    }

    let source_id = fields.required_string(TAG_SOURCE_ID, "source_id")?;
    let frame_id = fields.required_i64(TAG_PTS, "pts")?;
    let framerate = fields.required_string(TAG_FRAMERATE, "framerate")?;
    let width = fields.required_i32(TAG_WIDTH, "width")?;
    let height = fields.required_i32(TAG_HEIGHT, "height")?;
    check_frame_fields(&source_id, width, height)
        .map_err(|(field, details)| DecodeError::InvalidField { field, details })?;

    let keyframe = match fields.get(TAG_KEYFRAME) {
        None => true,
        Some(mut value) => {
            expect_len(&value, 1, "keyframe")?;
            match value.u8()? {
                0 => false,
                1 => true,
                other => return Err(DecodeError::invalid("keyframe", format!("bad flag {}", other))),
            }
        }
    };

    let payload = match fields.get(TAG_FRAME) {
        None => FramePayload::Absent,
        Some(value) => decode_payload(value)?,
    };

    let metadata = match fields.get(TAG_METADATA) {
        None => None,
        Some(mut value) => Some(
            serde_json::from_slice(value.rest())
                .map_err(|e| DecodeError::invalid("metadata", e.to_string()))?,
        ),
    };

    let tags = match fields.get(TAG_TAGS) {
        None => BTreeMap::new(),
        Some(value) => decode_tags(value)?,
    };

    Ok(WireMessage::Frame(FrameMessage::from_parts(FrameParts {
        source_id,
        frame_id,
        framerate,
        width,
        height,
        decode_timestamp: fields.optional_i64(TAG_DTS, "dts")?,
        duration: fields.optional_i64(TAG_DURATION, "duration")?,
        codec: fields.optional_string(TAG_CODEC, "codec")?,
        keyframe,
        payload,
        metadata,
        tags,
    })))
}

fn put_header(buf: &mut BytesMut, kind: u8) {
    buf.put_slice(&MAGIC);
    buf.put_u16_le(SCHEMA.to_wire());
    buf.put_u8(kind);
}

fn put_field(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

fn encode_payload(payload: &FramePayload) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(payload.variant());
    match payload {
        FramePayload::Absent => {}
        FramePayload::Inline(data) => buf.put_slice(data),
        FramePayload::External(external) => {
            buf.put_u16_le(external.method.len() as u16);
            buf.put_slice(external.method.as_bytes());
            match &external.location {
                Some(location) => {
                    buf.put_u8(1);
                    buf.put_slice(location.as_bytes());
                }
                None => buf.put_u8(0),
            }
        }
    }
    buf
}

fn decode_payload(mut value: Reader<'_>) -> Result<FramePayload, DecodeError> {
    let variant = value.u8()?;
    match variant {
        0 => {
            if !value.is_empty() {
                return Err(DecodeError::PayloadMismatch { variant, len: value.remaining() });
            }
            Ok(FramePayload::Absent)
        }
        1 => Ok(FramePayload::Inline(Bytes::copy_from_slice(value.rest()))),
        2 => {
            let trailing = value.remaining();
            decode_external(&mut value).map_err(|e| match e {
                DecodeError::Truncated { .. } => DecodeError::PayloadMismatch { variant, len: trailing },
                other => other,
            })
        }
        other => Err(DecodeError::malformed(format!("unknown payload variant {}", other))),
    }
}

fn decode_external(value: &mut Reader<'_>) -> Result<FramePayload, DecodeError> {
    let method_len = value.u16_le()? as usize;
    let method = value.utf8(method_len, "frame.method")?;
    let location = match value.u8()? {
        0 if value.is_empty() => None,
        0 => return Err(DecodeError::PayloadMismatch { variant: 2, len: value.remaining() }),
        1 => {
            let len = value.remaining();
            Some(value.utf8(len, "frame.location")?)
        }
        other => return Err(DecodeError::invalid("frame", format!("bad location flag {}", other))),
    };
    Ok(FramePayload::External(ExternalFrame { method, location }))
}

fn encode_tags(tags: &BTreeMap<String, TagValue>) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(tags.len() as u32);
    for (key, value) in tags {
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u8(value.kind());
        match value {
            TagValue::String(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            TagValue::Bool(b) => buf.put_u8(u8::from(*b)),
            TagValue::Int(i) => buf.put_i64_le(*i),
            TagValue::Double(d) => buf.put_f64_le(*d),
        }
    }
    buf
}

fn decode_tags(mut value: Reader<'_>) -> Result<BTreeMap<String, TagValue>, DecodeError> {
    let count = value.u32_le()?;
    let mut tags = BTreeMap::new();
    for _ in 0..count {
        let key_len = value.u16_le()? as usize;
        let key = value.utf8(key_len, "tags")?;
        let tag = match value.u8()? {
            0 => {
                let len = value.u32_le()? as usize;
                TagValue::String(value.utf8(len, "tags")?)
            }
            1 => TagValue::Bool(value.u8()? != 0),
            2 => TagValue::Int(value.i64_le()?),
            3 => TagValue::Double(value.f64_le()?),
            other => return Err(DecodeError::invalid("tags", format!("unknown value kind {}", other))),
        };
        if tags.insert(key.clone(), tag).is_some() {
            return Err(DecodeError::malformed(format!("duplicate tag key '{}'", key)));
        }
    }
    if !value.is_empty() {
        return Err(DecodeError::malformed(format!("{} trailing bytes after tags", value.remaining())));
    }
    Ok(tags)
}

fn expect_len(value: &Reader<'_>, len: usize, field: &'static str) -> Result<(), DecodeError> {
    if value.remaining() != len {
        return Err(DecodeError::malformed(format!(
            "field '{}' has length {}, expected {}",
            field,
            value.remaining(),
            len
        )));
    }
    Ok(())
}

/// Field values of one envelope, indexed by tag. Unknown tags are skipped.
struct FieldSet<'a> {
    slots: [Option<Reader<'a>>; TAG_TAGS as usize + 1],
}

impl<'a> FieldSet<'a> {
    fn read(reader: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let mut slots = [None; TAG_TAGS as usize + 1];
        while !reader.is_empty() {
            let tag = reader.u8()?;
            let len = reader.u32_le()? as usize;
            let value = reader.sub(len)?;
            let index = tag as usize;
            if index == 0 || index >= slots.len() {
                trace!(tag, len, "skipping unknown field");
                continue;
            }
            if slots[index].is_some() {
                return Err(DecodeError::malformed(format!("field tag {} repeated", tag)));
            }
            slots[index] = Some(value);
        }
        Ok(Self { slots })
    }

    fn get(&self, tag: u8) -> Option<Reader<'a>> {
        self.slots[tag as usize]
    }

    fn required_string(&self, tag: u8, field: &'static str) -> Result<String, DecodeError> {
        self.optional_string(tag, field)?.ok_or(DecodeError::MissingField { field })
    }

    fn optional_string(&self, tag: u8, field: &'static str) -> Result<Option<String>, DecodeError> {
        match self.get(tag) {
            None => Ok(None),
            Some(mut value) => {
                let len = value.remaining();
                value.utf8(len, field).map(Some)
            }
        }
    }

    fn required_i64(&self, tag: u8, field: &'static str) -> Result<i64, DecodeError> {
        self.optional_i64(tag, field)?.ok_or(DecodeError::MissingField { field })
    }

    fn optional_i64(&self, tag: u8, field: &'static str) -> Result<Option<i64>, DecodeError> {
        match self.get(tag) {
            None => Ok(None),
            Some(mut value) => {
                expect_len(&value, 8, field)?;
                value.i64_le().map(Some)
            }
        }
    }

    fn required_i32(&self, tag: u8, field: &'static str) -> Result<i32, DecodeError> {
        match self.get(tag) {
            None => Err(DecodeError::MissingField { field }),
            Some(mut value) => {
                expect_len(&value, 4, field)?;
                Ok(value.u32_le()? as i32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cam1() -> FrameMessage {
        FrameMessage::builder("cam1", 100)
            .framerate("25/1")
            .resolution(1280, 720)
            .inline(vec![0x00, 0x01])
            .build()
            .unwrap()
    }

    /// Hand-assemble an envelope from `(tag, value)` pairs.
    fn envelope(schema: u16, kind: u8, fields: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u16_le(schema);
        buf.put_u8(kind);
        for (tag, value) in fields {
            put_field(&mut buf, *tag, value);
        }
        buf.to_vec()
    }

    fn required_fields() -> Vec<(u8, Vec<u8>)> {
        vec![
            (TAG_SOURCE_ID, b"cam1".to_vec()),
            (TAG_PTS, 7i64.to_le_bytes().to_vec()),
            (TAG_FRAMERATE, b"30/1".to_vec()),
            (TAG_WIDTH, 640i32.to_le_bytes().to_vec()),
            (TAG_HEIGHT, 480i32.to_le_bytes().to_vec()),
        ]
    }

    prop_compose! {
        fn arb_payload()(
            variant in 0..3u8,
            data in prop::collection::vec(any::<u8>(), 0..64),
            method in "[a-z]{1,8}",
            location in prop::option::of("[a-z0-9/._-]{0,24}")
        ) -> FramePayload {
            match variant {
                0 => FramePayload::Absent,
                1 => FramePayload::Inline(Bytes::from(data)),
                _ => FramePayload::External(ExternalFrame::new(method, location)),
            }
        }
    }

    fn arb_tag_value() -> impl Strategy<Value = TagValue> {
        prop_oneof![
            ".{0,16}".prop_map(TagValue::String),
            any::<bool>().prop_map(TagValue::Bool),
            any::<i64>().prop_map(TagValue::Int),
            (-1.0e12f64..1.0e12f64).prop_map(TagValue::Double),
        ]
    }

    fn arb_metadata() -> impl Strategy<Value = serde_json::Value> {
        let number = prop_oneof![
            any::<f64>().prop_filter("JSON numbers are finite", |v| v.is_finite()).prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            any::<u64>().prop_map(serde_json::Value::from),
        ];
        (
            "[a-z]{1,8}",
            number,
            prop::collection::vec(any::<f64>().prop_filter("finite", |v| v.is_finite()), 0..4),
        )
            .prop_map(|(label, score, bbox)| {
                serde_json::json!({ "objects": [{ "label": label, "score": score, "bbox": bbox }] })
            })
    }

    prop_compose! {
        fn arb_frame()(
            source_id in "[a-z][a-z0-9-]{0,15}",
            frame_id in any::<i64>(),
            framerate in "[1-9][0-9]{0,2}/[1-9]",
            width in 1..8192i32,
            height in 1..8192i32,
            dts in prop::option::of(any::<i64>()),
            duration in prop::option::of(any::<i64>()),
            codec in prop::option::of("h264|hevc|jpeg|raw-rgba"),
            keyframe in any::<bool>(),
            payload in arb_payload(),
            metadata in prop::option::of(arb_metadata()),
            tags in prop::collection::btree_map("[a-z_]{1,8}", arb_tag_value(), 0..6)
        ) -> FrameMessage {
            let mut builder = FrameMessage::builder(source_id, frame_id)
                .framerate(framerate)
                .resolution(width, height)
                .keyframe(keyframe)
                .payload(payload);
            if let Some(dts) = dts {
                builder = builder.decode_timestamp(dts);
            }
            if let Some(duration) = duration {
                builder = builder.duration(duration);
            }
            if let Some(codec) = codec {
                builder = builder.codec(codec);
            }
            if let Some(metadata) = metadata {
                builder = builder.metadata(metadata);
            }
            for (key, value) in tags {
                builder = builder.tag(key, value);
            }
            builder.build().unwrap()
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip_preserves_every_field(frame in arb_frame()) {
            let bytes = encode(&frame);
            prop_assert_eq!(decode(&bytes).unwrap(), frame);
        }

        #[test]
        fn prop_decoding_prefixes_is_deterministic(frame in arb_frame(), cut in 0usize..64) {
            let bytes = encode(&frame);
            let cut = cut.min(bytes.len().saturating_sub(1));
            let first = decode(&bytes[..cut]);
            if cut < HEADER_LEN {
                prop_assert!(first.is_err());
            }
            prop_assert_eq!(first, decode(&bytes[..cut]));
        }
    }

    #[test]
    fn metadata_floats_survive_to_the_last_bit() {
        for score in [1.0715660391465826e-75, 0.1 + 0.2, f64::MIN_POSITIVE, 5e-324, 1.7976931348623157e308, -2.5e-8] {
            let frame = FrameMessage::builder("cam1", 1)
                .framerate("25/1")
                .resolution(64, 64)
                .metadata(serde_json::json!({ "score": score }))
                .build()
                .unwrap();
            let decoded = decode(&encode(&frame)).unwrap();
            let got = decoded.metadata().and_then(|m| m["score"].as_f64()).unwrap();
            assert_eq!(got.to_bits(), score.to_bits(), "{score:e}");
        }
    }

    #[test]
    fn minimal_encoding_yields_defaults() {
        let bytes = envelope(SCHEMA.to_wire(), KIND_FRAME, &required_fields());
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.source_id(), "cam1");
        assert_eq!(frame.frame_id(), 7);
        assert_eq!(frame.decode_timestamp(), None);
        assert_eq!(frame.duration(), None);
        assert_eq!(frame.codec(), None);
        assert!(frame.keyframe());
        assert!(frame.tags().is_empty());
        assert_eq!(frame.payload(), &FramePayload::Absent);
        assert_eq!(frame.metadata(), None);
    }

    #[test]
    fn unknown_fields_and_newer_minor_are_accepted() {
        let mut fields = required_fields();
        fields.push((200, b"from the future".to_vec()));
        let bytes = envelope(SchemaVersion { major: 1, minor: 7 }.to_wire(), KIND_FRAME, &fields);
        assert_eq!(decode(&bytes).unwrap().framerate(), "30/1");
    }

    #[test]
    fn unknown_major_is_rejected() {
        let bytes = envelope(SchemaVersion { major: 2, minor: 0 }.to_wire(), KIND_FRAME, &required_fields());
        assert_eq!(decode(&bytes), Err(DecodeError::UnsupportedSchema { major: 2, minor: 0 }));
    }

    #[test]
    fn missing_required_field_is_reported() {
        let fields: Vec<_> = required_fields().into_iter().filter(|(tag, _)| *tag != TAG_PTS).collect();
        let bytes = envelope(SCHEMA.to_wire(), KIND_FRAME, &fields);
        assert_eq!(decode(&bytes), Err(DecodeError::MissingField { field: "pts" }));
    }

    #[test]
    fn truncated_buffer_is_reported() {
        let bytes = encode(&cam1());
        assert!(matches!(decode(&bytes[..bytes.len() - 1]), Err(DecodeError::Truncated { .. })));
        assert!(matches!(decode(&bytes[..3]), Err(DecodeError::Truncated { .. })));
        assert!(matches!(decode(&[]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn payload_tag_must_match_trailing_bytes() {
        let mut absent_with_bytes = required_fields();
        absent_with_bytes.push((TAG_FRAME, vec![0, 9, 9]));
        let bytes = envelope(SCHEMA.to_wire(), KIND_FRAME, &absent_with_bytes);
        assert_eq!(decode(&bytes), Err(DecodeError::PayloadMismatch { variant: 0, len: 2 }));

        let mut short_external = required_fields();
        short_external.push((TAG_FRAME, vec![2, 10, 0, b's']));
        let bytes = envelope(SCHEMA.to_wire(), KIND_FRAME, &short_external);
        assert_eq!(decode(&bytes), Err(DecodeError::PayloadMismatch { variant: 2, len: 3 }));
    }

    #[test]
    fn non_positive_resolution_is_invalid() {
        let mut fields = required_fields();
        fields[3] = (TAG_WIDTH, 0i32.to_le_bytes().to_vec());
        let bytes = envelope(SCHEMA.to_wire(), KIND_FRAME, &fields);
        assert!(matches!(decode(&bytes), Err(DecodeError::InvalidField { field: "width", .. })));
    }

    #[test]
    fn repeated_field_is_malformed() {
        let mut fields = required_fields();
        fields.push((TAG_PTS, 8i64.to_le_bytes().to_vec()));
        let bytes = envelope(SCHEMA.to_wire(), KIND_FRAME, &fields);
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = encode(&cam1()).to_vec();
        bytes[0] = b'X';
        assert_eq!(decode(&bytes), Err(DecodeError::BadMagic { found: [b'X', b'L'] }));
    }

    #[test]
    fn end_of_stream_round_trips_through_envelope() {
        let bytes = encode_end_of_stream("cam1");
        assert_eq!(
            decode_envelope(&bytes).unwrap(),
            WireMessage::EndOfStream { source_id: "cam1".into() }
        );
        assert_eq!(decode(&bytes), Err(DecodeError::UnexpectedKind { found: "end of stream" }));
    }

    #[test]
    fn encoding_is_deterministic() {
        let frame = cam1().with_tag("b", 2i64).with_tag("a", true);
        assert_eq!(encode(&frame), encode(&frame.clone()));
    }
}
