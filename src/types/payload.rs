//! Frame payload variants and tag values

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content carried by a frame message. Exactly one arm is active.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FramePayload {
    /// Metadata-only message.
    #[default]
    Absent,
    /// Encoded frame bytes carried in the message.
    Inline(Bytes),
    /// Frame stored elsewhere; the consumer resolves it out of band.
    External(ExternalFrame),
}

impl FramePayload {
    /// Wire discriminant of this variant.
    pub fn variant(&self) -> u8 {
        match self {
            FramePayload::Absent => 0,
            FramePayload::Inline(_) => 1,
            FramePayload::External(_) => 2,
        }
    }

    /// Number of inline bytes (zero for other variants).
    pub fn inline_len(&self) -> usize {
        match self {
            FramePayload::Inline(data) => data.len(),
            FramePayload::Absent | FramePayload::External(_) => 0,
        }
    }
}

/// Reference to a frame held outside the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFrame {
    /// How to fetch the frame, e.g. `"s3"` or `"http"`.
    pub method: String,
    /// Location understood by `method`, if any.
    pub location: Option<String>,
}

impl ExternalFrame {
    pub fn new(method: impl Into<String>, location: Option<String>) -> Self {
        Self { method: method.into(), location }
    }
}

/// Scalar tag value. Tags never nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl TagValue {
    /// Wire discriminant of this kind.
    pub fn kind(&self) -> u8 {
        match self {
            TagValue::String(_) => 0,
            TagValue::Bool(_) => 1,
            TagValue::Int(_) => 2,
            TagValue::Double(_) => 3,
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::String(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::String(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Double(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_have_distinct_discriminants() {
        let payloads = [
            FramePayload::Absent,
            FramePayload::Inline(Bytes::from_static(b"\x00\x01")),
            FramePayload::External(ExternalFrame::new("s3", Some("bucket/key".into()))),
        ];
        let variants: Vec<u8> = payloads.iter().map(FramePayload::variant).collect();
        assert_eq!(variants, vec![0, 1, 2]);
        assert_eq!(payloads[1].inline_len(), 2);
        assert_eq!(payloads[2].inline_len(), 0);
    }

    #[test]
    fn tag_values_deserialize_from_yaml_scalars() {
        let parsed: std::collections::BTreeMap<String, TagValue> =
            serde_yaml_ng::from_str("a: true\nb: 7\nc: 0.25\nd: lobby\n").unwrap();
        assert_eq!(parsed["a"], TagValue::Bool(true));
        assert_eq!(parsed["b"], TagValue::Int(7));
        assert_eq!(parsed["c"], TagValue::Double(0.25));
        assert_eq!(parsed["d"], TagValue::String("lobby".into()));
    }
}
