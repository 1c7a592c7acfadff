//! Frame message, the unit of exchange

use bytes::Bytes;
use std::collections::BTreeMap;

use super::{ExternalFrame, FramePayload, TagValue};
use crate::{Result, TransportError};

/// A video frame plus its metadata.
///
/// `(source_id, frame_id)` is the identity of a frame. A message is never mutated
/// after it is built; [`FrameMessage::with_tag`] and friends return a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    source_id: String,
    frame_id: i64,
    framerate: String,
    width: i32,
    height: i32,
    decode_timestamp: Option<i64>,
    duration: Option<i64>,
    codec: Option<String>,
    keyframe: bool,
    payload: FramePayload,
    metadata: Option<serde_json::Value>,
    tags: BTreeMap<String, TagValue>,
}

impl FrameMessage {
    /// Start building a frame for `source_id` with the given presentation id.
    pub fn builder(source_id: impl Into<String>, frame_id: i64) -> FrameMessageBuilder {
        FrameMessageBuilder {
            source_id: source_id.into(),
            frame_id,
            framerate: None,
            width: None,
            height: None,
            decode_timestamp: None,
            duration: None,
            codec: None,
            keyframe: true,
            payload: FramePayload::Absent,
            metadata: None,
            tags: BTreeMap::new(),
        }
    }

    /// Logical stream identity.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Presentation id, `pts` on the wire.
    pub fn frame_id(&self) -> i64 {
        self.frame_id
    }

    pub fn framerate(&self) -> &str {
        &self.framerate
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn decode_timestamp(&self) -> Option<i64> {
        self.decode_timestamp
    }

    /// Frame duration in nanoseconds.
    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    pub fn codec(&self) -> Option<&str> {
        self.codec.as_deref()
    }

    /// Whether a decoder may start the stream at this frame.
    pub fn keyframe(&self) -> bool {
        self.keyframe
    }

    pub fn payload(&self) -> &FramePayload {
        &self.payload
    }

    /// Pipeline-defined metadata, opaque to the transport.
    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    /// Frames per second parsed from the rational framerate, if well-formed.
    pub fn fps(&self) -> Option<f64> {
        let (num, den) = self.framerate.split_once('/')?;
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den == 0.0 { None } else { Some(num / den) }
    }

    /// Return a copy of this message with one tag added or replaced.
    pub fn with_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> FrameMessage {
        let mut enriched = self.clone();
        enriched.tags.insert(key.into(), value.into());
        enriched
    }

    /// Return a copy of this message carrying `metadata`.
    pub fn with_metadata(&self, metadata: serde_json::Value) -> FrameMessage {
        FrameMessage { metadata: Some(metadata), ..self.clone() }
    }

    pub(crate) fn from_parts(parts: FrameParts) -> FrameMessage {
        FrameMessage {
            source_id: parts.source_id,
            frame_id: parts.frame_id,
            framerate: parts.framerate,
            width: parts.width,
            height: parts.height,
            decode_timestamp: parts.decode_timestamp,
            duration: parts.duration,
            codec: parts.codec,
            keyframe: parts.keyframe,
            payload: parts.payload,
            metadata: parts.metadata,
            tags: parts.tags,
        }
    }
}

/// Field set shared by the builder and the decoder.
pub(crate) struct FrameParts {
    pub source_id: String,
    pub frame_id: i64,
    pub framerate: String,
    pub width: i32,
    pub height: i32,
    pub decode_timestamp: Option<i64>,
    pub duration: Option<i64>,
    pub codec: Option<String>,
    pub keyframe: bool,
    pub payload: FramePayload,
    pub metadata: Option<serde_json::Value>,
    pub tags: BTreeMap<String, TagValue>,
}

/// Identity rules every frame must satisfy, returned as `(field, details)`.
pub(crate) fn check_frame_fields(
    source_id: &str,
    width: i32,
    height: i32,
) -> std::result::Result<(), (&'static str, String)> {
    if source_id.is_empty() {
        return Err(("source_id", "must not be empty".to_string()));
    }
    if width <= 0 {
        return Err(("width", format!("must be positive, got {}", width)));
    }
    if height <= 0 {
        return Err(("height", format!("must be positive, got {}", height)));
    }
    Ok(())
}

/// Length prefixes on the wire are u32 for values and u16 for names.
fn check_wire_limits(payload: &FramePayload, tags: &BTreeMap<String, TagValue>) -> Result<()> {
    if payload.inline_len() > crate::codec::MAX_FIELD_LEN {
        return Err(TransportError::InvalidMessage {
            field: "payload",
            details: format!("{} bytes exceeds the field limit", payload.inline_len()),
        });
    }
    if let FramePayload::External(external) = payload {
        if external.method.len() > usize::from(u16::MAX) {
            return Err(TransportError::InvalidMessage {
                field: "payload",
                details: "external method name too long".to_string(),
            });
        }
    }
    if let Some(key) = tags.keys().find(|key| key.len() > usize::from(u16::MAX)) {
        return Err(TransportError::InvalidMessage {
            field: "tags",
            details: format!("tag key of {} bytes too long", key.len()),
        });
    }
    Ok(())
}

/// Builder for [`FrameMessage`].
#[derive(Debug, Clone)]
pub struct FrameMessageBuilder {
    source_id: String,
    frame_id: i64,
    framerate: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    decode_timestamp: Option<i64>,
    duration: Option<i64>,
    codec: Option<String>,
    keyframe: bool,
    payload: FramePayload,
    metadata: Option<serde_json::Value>,
    tags: BTreeMap<String, TagValue>,
}

impl FrameMessageBuilder {
    pub fn framerate(mut self, framerate: impl Into<String>) -> Self {
        self.framerate = Some(framerate.into());
        self
    }

    pub fn resolution(mut self, width: i32, height: i32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn decode_timestamp(mut self, dts: i64) -> Self {
        self.decode_timestamp = Some(dts);
        self
    }

    pub fn duration(mut self, duration_ns: i64) -> Self {
        self.duration = Some(duration_ns);
        self
    }

    pub fn codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn inline(mut self, data: impl Into<Bytes>) -> Self {
        self.payload = FramePayload::Inline(data.into());
        self
    }

    pub fn external(mut self, external: ExternalFrame) -> Self {
        self.payload = FramePayload::External(external);
        self
    }

    pub fn payload(mut self, payload: FramePayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Validate and build the message.
    pub fn build(self) -> Result<FrameMessage> {
        let framerate = self.framerate.ok_or(TransportError::InvalidMessage {
            field: "framerate",
            details: "not set".to_string(),
        })?;
        let (width, height) = match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            _ => {
                return Err(TransportError::InvalidMessage {
                    field: "resolution",
                    details: "not set".to_string(),
                });
            }
        };
        check_frame_fields(&self.source_id, width, height)
            .map_err(|(field, details)| TransportError::InvalidMessage { field, details })?;
        check_wire_limits(&self.payload, &self.tags)?;

        Ok(FrameMessage::from_parts(FrameParts {
            source_id: self.source_id,
            frame_id: self.frame_id,
            framerate,
            width,
            height,
            decode_timestamp: self.decode_timestamp,
            duration: self.duration,
            codec: self.codec,
            keyframe: self.keyframe,
            payload: self.payload,
            metadata: self.metadata,
            tags: self.tags,
        }))
    }
}
