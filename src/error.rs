//! Error types for the frame transport.
//!
//! Errors fall into two groups. Per-message failures ([`TransportError::Decode`],
//! [`TransportError::FilterRejected`], [`TransportError::DuplicateOrStale`],
//! [`TransportError::QueueFull`]) are local: the message is discarded and counted,
//! and processing of every other message and lane continues. Configuration and
//! startup failures ([`TransportError::ConfigInvalid`]) are fatal for the endpoint
//! they concern.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use framelane::TransportError;
//!
//! let error = TransportError::disconnected("tcp://10.0.0.5:5555", "connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// Failure to decode a wire envelope.
///
/// Decoding is pure, so the same bytes always produce the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("truncated envelope: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated { offset: usize, needed: usize, available: usize },

    #[error("bad envelope magic {found:02x?}")]
    BadMagic { found: [u8; 2] },

    #[error("unsupported schema {major}.{minor}")]
    UnsupportedSchema { major: u8, minor: u8 },

    #[error("unknown message kind {kind}")]
    UnknownKind { kind: u8 },

    #[error("expected a video frame, found {found}")]
    UnexpectedKind { found: &'static str },

    #[error("required field '{field}' is missing")]
    MissingField { field: &'static str },

    #[error("field '{field}' is invalid: {details}")]
    InvalidField { field: &'static str, details: String },

    #[error("payload variant {variant} is inconsistent with its {len} trailing bytes")]
    PayloadMismatch { variant: u8, len: usize },

    #[error("malformed envelope: {details}")]
    Malformed { details: String },
}

impl DecodeError {
    pub(crate) fn malformed(details: impl Into<String>) -> Self {
        DecodeError::Malformed { details: details.into() }
    }

    pub(crate) fn invalid(field: &'static str, details: impl Into<String>) -> Self {
        DecodeError::InvalidField { field, details: details.into() }
    }
}

/// Main error type for transport operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("source '{source_id}' rejected by endpoint filters")]
    FilterRejected { source_id: String },

    #[error("stale frame {frame_id} for source '{source_id}' (last sequenced {last_frame_id})")]
    DuplicateOrStale { source_id: String, frame_id: i64, last_frame_id: i64 },

    #[error("queue for '{lane}' is full ({capacity} messages)")]
    QueueFull { lane: String, capacity: usize },

    #[error("endpoint {address} disconnected: {reason}")]
    EndpointDisconnected {
        address: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("invalid frame message field '{field}': {details}")]
    InvalidMessage { field: &'static str, details: String },

    #[error("peer rejected message: {reason}")]
    Rejected { reason: String },

    #[error("unknown lane '{source_id}'")]
    UnknownLane { source_id: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("transport is shutting down")]
    Shutdown,

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::EndpointDisconnected { .. } => true,
            TransportError::Timeout { .. } => true,
            TransportError::QueueFull { .. } => true,
            TransportError::Io { .. } => true,
            TransportError::Decode(_) => false,
            TransportError::FilterRejected { .. } => false,
            TransportError::DuplicateOrStale { .. } => false,
            TransportError::ConfigInvalid { .. } => false,
            TransportError::InvalidMessage { .. } => false,
            TransportError::Rejected { .. } => false,
            TransportError::UnknownLane { .. } => false,
            TransportError::Shutdown => false,
        }
    }

    /// Returns true for failures that concern a single message only.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            TransportError::Decode(_)
                | TransportError::FilterRejected { .. }
                | TransportError::DuplicateOrStale { .. }
                | TransportError::QueueFull { .. }
                | TransportError::Rejected { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            TransportError::Decode(_) => vec![
                "Check that producer and consumer use compatible schema majors",
                "Verify nothing else writes to the endpoint address",
            ],
            TransportError::FilterRejected { .. } => vec![
                "Check the endpoint source_id and source_id_prefix filters",
                "Verify the producer is configured with the expected source id",
            ],
            TransportError::DuplicateOrStale { .. } => vec![
                "Ensure the producer emits non-decreasing frame ids per source",
                "Send an end-of-stream message before restarting a source",
            ],
            TransportError::QueueFull { .. } => vec![
                "Increase queue_max_size for the endpoint",
                "Speed up the consuming pipeline stage",
                "Switch the endpoint to drop-oldest admission if loss is acceptable",
            ],
            TransportError::EndpointDisconnected { .. } => vec![
                "Verify the peer process is running",
                "Check the endpoint address and network reachability",
                "Inspect reconnect counters in the health report",
            ],
            TransportError::ConfigInvalid { .. } => vec![
                "Check endpoint address schemes (tcp://, ipc://, inproc://)",
                "Check that the socket pattern matches the endpoint direction",
                "Check that source filters do not conflict",
            ],
            TransportError::InvalidMessage { .. } => vec![
                "Set source_id, framerate, width and height before building a frame",
                "Width and height must be positive",
            ],
            TransportError::Rejected { .. } => vec![
                "Inspect the receiving endpoint's filters and logs",
            ],
            TransportError::UnknownLane { .. } => vec![
                "Call list_sources() to discover active lanes",
                "The lane may have been reaped after its idle timeout",
            ],
            TransportError::Timeout { .. } => vec![
                "Increase ack_timeout_ms",
                "Check consumer throughput on the receiving side",
            ],
            TransportError::Shutdown => vec!["Create a new supervisor to resume transport"],
            TransportError::Io { .. } => vec![
                "Check socket permissions and address availability",
                "Check system resource limits",
            ],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        TransportError::ConfigInvalid { reason: reason.into() }
    }

    /// Helper constructor for disconnect errors.
    pub fn disconnected(address: impl Into<String>, reason: impl Into<String>) -> Self {
        TransportError::EndpointDisconnected {
            address: address.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Helper constructor for disconnect errors with source.
    pub fn disconnected_with_source(
        address: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TransportError::EndpointDisconnected {
            address: address.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        TransportError::Io { context: context.into(), source }
    }

    /// Helper constructor for peer rejections.
    pub fn rejected(reason: impl Into<String>) -> Self {
        TransportError::Rejected { reason: reason.into() }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io { context: "<unknown>".to_string(), source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                source_id in "[a-z][a-z0-9-]{0,15}",
                frame_id in any::<i64>(),
                last in any::<i64>(),
                reason in ".*"
            ) {
                let stale = TransportError::DuplicateOrStale {
                    source_id: source_id.clone(),
                    frame_id,
                    last_frame_id: last,
                };
                let msg = stale.to_string();
                prop_assert!(msg.contains(&source_id));
                prop_assert!(msg.contains(&frame_id.to_string()));

                let config = TransportError::config(reason.clone());
                prop_assert!(config.to_string().contains(&reason));
                prop_assert!(!config.is_retryable());
            }
        }
    }

    #[test]
    fn decode_errors_convert_and_are_per_message() {
        let err: TransportError = DecodeError::MissingField { field: "pts" }.into();
        assert!(matches!(err, TransportError::Decode(DecodeError::MissingField { field: "pts" })));
        assert!(err.is_per_message());
        assert!(!err.is_retryable());
    }

    #[test]
    fn disconnect_is_retryable_and_chains_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TransportError::disconnected_with_source("tcp://127.0.0.1:1", "dial", Box::new(io));
        assert!(err.is_retryable());
        assert!(!err.is_per_message());
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("refused"));
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<TransportError>();
        assert_send_sync_static::<DecodeError>();
    }

    #[test]
    fn every_variant_has_suggestions() {
        let errors = vec![
            TransportError::Decode(DecodeError::malformed("x")),
            TransportError::FilterRejected { source_id: "a".into() },
            TransportError::DuplicateOrStale { source_id: "a".into(), frame_id: 1, last_frame_id: 2 },
            TransportError::QueueFull { lane: "a".into(), capacity: 1 },
            TransportError::disconnected("inproc://x", "gone"),
            TransportError::config("bad"),
            TransportError::InvalidMessage { field: "width", details: "0".into() },
            TransportError::rejected("no"),
            TransportError::UnknownLane { source_id: "a".into() },
            TransportError::Timeout { duration: Duration::from_secs(1) },
            TransportError::Shutdown,
            TransportError::io("bind", std::io::Error::other("x")),
        ];
        for error in errors {
            assert!(!error.recovery_suggestions().is_empty(), "{error}");
        }
    }
}
