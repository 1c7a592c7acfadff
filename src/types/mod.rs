//! Core types for frame exchange.
//!
//! - [`FrameMessage`] is the unit of exchange: a frame plus structured metadata,
//!   identified by `(source_id, frame_id)`
//! - [`FramePayload`] is the three-way payload sum type (absent, inline, external)
//! - [`TagValue`] restricts tag values to the four scalar kinds
//! - [`SocketPattern`], [`SocketRole`] and [`AdmissionPolicy`] describe endpoints
//!
//! ## Usage Example
//!
//! ```rust
//! use framelane::types::{FrameMessage, FramePayload, TagValue};
//!
//! let frame = FrameMessage::builder("cam1", 100)
//!     .framerate("25/1")
//!     .resolution(1920, 1080)
//!     .codec("h264")
//!     .inline(vec![0x00, 0x01])
//!     .tag("zone", "lobby")
//!     .build()
//!     .unwrap();
//!
//! assert!(frame.keyframe());
//! assert!(matches!(frame.payload(), FramePayload::Inline(_)));
//! assert_eq!(frame.tag("zone"), Some(&TagValue::String("lobby".into())));
//! ```

mod frame;
mod payload;
mod socket;

pub use frame::{FrameMessage, FrameMessageBuilder};
pub(crate) use frame::{FrameParts, check_frame_fields};
pub use payload::{ExternalFrame, FramePayload, TagValue};
pub use socket::{AdmissionPolicy, Direction, SocketPattern, SocketRole};
