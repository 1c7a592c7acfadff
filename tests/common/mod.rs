//! Helpers shared by the integration tests.

#![allow(dead_code)]

use framelane::{EndpointSpec, FrameMessage, SocketPattern, SocketRole, TransportConfig, TransportSupervisor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT: AtomicU64 = AtomicU64::new(1);

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn inproc(prefix: &str) -> String {
    format!("inproc://{}-{}", prefix, NEXT.fetch_add(1, Ordering::Relaxed))
}

pub fn frame(source_id: &str, frame_id: i64) -> FrameMessage {
    FrameMessage::builder(source_id, frame_id)
        .framerate("25/1")
        .resolution(1280, 720)
        .keyframe(true)
        .inline(vec![0u8, 1])
        .build()
        .expect("valid fixture frame")
}

/// Quick timings so reconnects, health and shutdown stay fast under test.
pub fn fast_config() -> TransportConfig {
    let mut config = TransportConfig { health_interval_ms: 50, shutdown_grace_ms: 200, ..TransportConfig::default() };
    config.reconnect.initial_ms = 10;
    config.reconnect.max_ms = 50;
    config
}

pub fn spec(pattern: SocketPattern, role: SocketRole, address: &str) -> EndpointSpec {
    EndpointSpec::new(pattern, role, address).expect("valid endpoint")
}

/// A receiving and a sending supervisor sharing nothing but the address.
pub async fn pair(
    receiver: TransportConfig,
    sender: TransportConfig,
) -> (TransportSupervisor, TransportSupervisor) {
    let receiver = TransportSupervisor::start(receiver).await.expect("receiver starts");
    let context = receiver.context().clone();
    let sender = TransportSupervisor::start_with_context(sender, context).await.expect("sender starts");
    (receiver, sender)
}

/// Poll until `expected` frames of `source_id` arrived; returns their ids.
pub async fn collect(supervisor: &TransportSupervisor, source_id: &str, expected: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(expected);
    while ids.len() < expected {
        match supervisor.poll(source_id, WAIT).await.expect("poll") {
            Some(frame) => ids.push(frame.frame_id()),
            None => panic!("timed out after {} of {} frames from {}", ids.len(), expected, source_id),
        }
    }
    ids
}
