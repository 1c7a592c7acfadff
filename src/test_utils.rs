//! Test utilities shared by unit tests, integration tests and benchmarks
//!
//! Frame fixtures with realistic field values, unique in-process addresses so
//! concurrently running tests never collide, and a tracing initializer.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{ExternalFrame, FrameMessage};

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(1);

/// A 720p keyframe of `source_id` with a two-byte inline payload.
pub fn frame(source_id: &str, frame_id: i64) -> FrameMessage {
    FrameMessage::builder(source_id, frame_id)
        .framerate("25/1")
        .resolution(1280, 720)
        .keyframe(true)
        .inline(vec![0u8, 1])
        .build()
        .unwrap_or_else(|e| panic!("fixture frame for {source_id} is invalid: {e}"))
}

/// A fully populated frame with `payload_len` inline bytes.
pub fn frame_with_payload(source_id: &str, frame_id: i64, payload_len: usize) -> FrameMessage {
    FrameMessage::builder(source_id, frame_id)
        .framerate("30000/1001")
        .resolution(1920, 1080)
        .decode_timestamp(frame_id - 1)
        .duration(33_366_666)
        .codec("h264")
        .keyframe(frame_id % 30 == 0)
        .inline((0..payload_len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
        .tag("camera", "north-gate")
        .tag("sequence", frame_id)
        .build()
        .unwrap_or_else(|e| panic!("fixture frame for {source_id} is invalid: {e}"))
}

/// A frame whose pixels live elsewhere.
pub fn external_frame(source_id: &str, frame_id: i64) -> FrameMessage {
    FrameMessage::builder(source_id, frame_id)
        .framerate("25/1")
        .resolution(640, 480)
        .external(ExternalFrame::new("shm", Some(format!("/dev/shm/{source_id}-{frame_id}"))))
        .build()
        .unwrap_or_else(|e| panic!("fixture frame for {source_id} is invalid: {e}"))
}

/// An `inproc://` address no other caller in this process receives.
pub fn unique_inproc(prefix: &str) -> String {
    format!("inproc://{}-{}", prefix, NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed))
}

/// Install a fmt subscriber once per process; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
