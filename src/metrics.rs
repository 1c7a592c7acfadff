//! Counters, snapshots and health reporting

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::types::{Direction, SocketPattern};

/// Live counters of one endpoint binding.
#[derive(Debug, Default)]
pub struct EndpointCounters {
    received: AtomicU64,
    sent: AtomicU64,
    decode_errors: AtomicU64,
    filter_rejections: AtomicU64,
    duplicates: AtomicU64,
    egress_drops: AtomicU64,
    discarded: AtomicU64,
    reconnects: AtomicU64,
    connected_peers: AtomicUsize,
}

impl EndpointCounters {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filter_rejection(&self) {
        self.filter_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_egress_drop(&self) {
        self.egress_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages that left a queue but were lost before reaching the next one,
    /// for example a link backlog cut off by shutdown.
    pub fn record_discarded(&self, count: usize) {
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_connected(&self) {
        self.connected_peers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        let _ = self
            .connected_peers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn filter_rejections(&self) -> u64 {
        self.filter_rejections.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn egress_drops(&self) -> u64 {
        self.egress_drops.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of one lane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneSnapshot {
    pub source_id: String,
    pub endpoint: String,
    pub depth: usize,
    pub capacity: usize,
    pub admitted: u64,
    pub dropped: u64,
    pub duplicates: u64,
    /// Producer waits on a full queue so far.
    pub blocked: u64,
    pub last_frame_id: Option<i64>,
    pub ended: bool,
    pub idle_ms: u64,
}

impl LaneSnapshot {
    pub fn is_saturated(&self) -> bool {
        self.depth >= self.capacity
    }
}

/// Point-in-time view of one endpoint binding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSnapshot {
    pub name: String,
    pub pattern: SocketPattern,
    #[serde(serialize_with = "serialize_direction")]
    pub direction: Direction,
    pub received: u64,
    pub sent: u64,
    pub decode_errors: u64,
    pub filter_rejections: u64,
    pub duplicates: u64,
    pub egress_drops: u64,
    /// Messages lost in flight rather than in a queue.
    pub discarded: u64,
    pub reconnects: u64,
    pub connected_peers: usize,
    /// Messages waiting in an egress outbox.
    pub outbox_depth: usize,
    pub outbox_dropped: u64,
}

fn serialize_direction<S: serde::Serializer>(direction: &Direction, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(match direction {
        Direction::Ingress => "ingress",
        Direction::Egress => "egress",
    })
}

impl EndpointSnapshot {
    pub(crate) fn capture(
        name: &str,
        pattern: SocketPattern,
        counters: &EndpointCounters,
        outbox: Option<(usize, u64)>,
    ) -> Self {
        let (outbox_depth, outbox_dropped) = outbox.unwrap_or_default();
        Self {
            name: name.to_string(),
            pattern,
            direction: pattern.direction(),
            received: counters.received(),
            sent: counters.sent(),
            decode_errors: counters.decode_errors(),
            filter_rejections: counters.filter_rejections(),
            duplicates: counters.duplicates(),
            egress_drops: counters.egress_drops(),
            discarded: counters.discarded(),
            reconnects: counters.reconnects(),
            connected_peers: counters.connected_peers(),
            outbox_depth,
            outbox_dropped,
        }
    }
}

/// Aggregated counters across lanes and endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub lanes: Vec<LaneSnapshot>,
    pub endpoints: Vec<EndpointSnapshot>,
}

impl MetricsSnapshot {
    pub fn lane(&self, source_id: &str) -> Option<&LaneSnapshot> {
        self.lanes.iter().find(|lane| lane.source_id == source_id)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointSnapshot> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    pub fn total_admitted(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.admitted).sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.lanes.iter().map(|lane| lane.dropped).sum()
    }

    pub fn total_reconnects(&self) -> u64 {
        self.endpoints.iter().map(|endpoint| endpoint.reconnects).sum()
    }

    fn total_traffic(&self) -> u64 {
        self.endpoints.iter().map(|endpoint| endpoint.received + endpoint.sent).sum()
    }
}

/// Periodic health summary published by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub uptime_ms: u64,
    /// Messages received plus sent per second since the previous report.
    pub throughput: f64,
    pub saturated_lanes: Vec<String>,
    /// Endpoints that currently have no connected peer.
    pub disconnected_endpoints: Vec<String>,
    pub metrics: MetricsSnapshot,
}

impl HealthReport {
    pub(crate) fn build(uptime: Duration, elapsed: Duration, previous: Option<&MetricsSnapshot>, metrics: MetricsSnapshot) -> Self {
        let delta = metrics.total_traffic().saturating_sub(previous.map_or(0, MetricsSnapshot::total_traffic));
        let seconds = elapsed.as_secs_f64();
        let throughput = if seconds > 0.0 { delta as f64 / seconds } else { 0.0 };

        Self {
            uptime_ms: uptime.as_millis() as u64,
            throughput,
            saturated_lanes: metrics
                .lanes
                .iter()
                .filter(|lane| lane.is_saturated())
                .map(|lane| lane.source_id.clone())
                .collect(),
            disconnected_endpoints: metrics
                .endpoints
                .iter()
                .filter(|endpoint| endpoint.connected_peers == 0)
                .map(|endpoint| endpoint.name.clone())
                .collect(),
            metrics,
        }
    }

    /// No saturated lane and every endpoint has a peer.
    pub fn is_healthy(&self) -> bool {
        self.saturated_lanes.is_empty() && self.disconnected_endpoints.is_empty()
    }
}

/// Discrete transport events, fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum HealthEvent {
    EndpointConnected { endpoint: String, address: String },
    EndpointDisconnected { endpoint: String, address: String, reason: String, attempt: u32 },
    LaneCreated { endpoint: String, source_id: String },
    LaneEnded { endpoint: String, source_id: String },
    LaneReaped { endpoint: String, source_id: String },
    ShutdownStarted,
    ShutdownComplete { discarded: usize },
}

/// One throughput measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpsReading {
    pub frames: u64,
    pub elapsed: Duration,
}

impl FpsReading {
    pub fn fps(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 { self.frames as f64 / seconds } else { 0.0 }
    }
}

/// Per-source frame rate meter.
///
/// A reading is produced every `period_frames` frames or once `period` has passed
/// since the previous reading, whichever comes first.
#[derive(Debug)]
pub struct FpsMeter {
    period_frames: u64,
    period: Option<Duration>,
    window_start: Instant,
    window_frames: u64,
    total_frames: u64,
}

impl FpsMeter {
    pub fn new(period_frames: u64, period: Option<Duration>, now: Instant) -> Self {
        Self { period_frames, period, window_start: now, window_frames: 0, total_frames: 0 }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Count one frame, returning a reading when a period completes.
    pub fn record(&mut self, now: Instant) -> Option<FpsReading> {
        self.window_frames += 1;
        self.total_frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        let by_frames = self.period_frames > 0 && self.window_frames >= self.period_frames;
        let by_time = matches!(self.period, Some(period) if elapsed >= period);
        if !(by_frames || by_time) {
            return None;
        }

        let reading = FpsReading { frames: self.window_frames, elapsed };
        self.window_start = now;
        self.window_frames = 0;
        Some(reading)
    }

    /// Record and log completed readings for `source_id`.
    pub fn record_and_log(&mut self, source_id: &str, now: Instant) {
        if let Some(reading) = self.record(now) {
            info!(
                source_id,
                frames = reading.frames,
                total = self.total_frames,
                "Processed {} frames, {:.2} FPS",
                reading.frames,
                reading.fps()
            );
        }
    }
}
