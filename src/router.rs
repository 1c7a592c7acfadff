//! Per-source demultiplexing into ordered lanes
//!
//! A [`SourceRouter`] belongs to one ingress endpoint. It applies the endpoint's
//! source filter, creates a [`SourceLane`] the first time a source is seen, and
//! admits frames into that lane's queue. Duplicate detection happens inside the
//! queue under the same lock as the append.
//!
//! Lanes are reaped when they have been idle past a timeout with an empty queue,
//! or immediately after an end-of-stream once drained. A lane is never reaped while
//! an admission into it is in progress.
//!
//! Reaping forgets the lane's sequencing state along with the lane. A frame that
//! arrives after its lane was reaped starts a fresh lane and is admitted whatever its
//! `frame_id`, so a late re-delivery of an old frame is only caught as a duplicate
//! while its lane is alive. The idle timeout should therefore exceed the longest
//! redelivery delay of the producers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SourceFilter;
use crate::metrics::{FpsMeter, HealthEvent, LaneSnapshot};
use crate::queue::{Admission, BoundedQueue};
use crate::types::{AdmissionPolicy, FrameMessage};
use crate::{Result, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered queue plus sequencing state of one source.
pub struct SourceLane {
    source_id: String,
    endpoint: String,
    queue: BoundedQueue<FrameMessage>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    ended: AtomicBool,
    retired: AtomicBool,
    fps: Mutex<FpsMeter>,
}

impl SourceLane {
    fn new(source_id: &str, endpoint: &str, settings: &LaneSettings, dequeued: &Arc<Notify>, now: Instant) -> Self {
        Self {
            source_id: source_id.to_string(),
            endpoint: endpoint.to_string(),
            queue: BoundedQueue::new(source_id, settings.capacity, settings.policy)
                .with_dequeue_signal(Arc::clone(dequeued)),
            created_at: now,
            last_activity: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            fps: Mutex::new(FpsMeter::new(settings.fps_period_frames, settings.fps_period, now)),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn queue(&self) -> &BoundedQueue<FrameMessage> {
        &self.queue
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Last sequenced frame id, `None` after creation or end-of-stream.
    pub fn last_frame_id(&self) -> Option<i64> {
        self.queue.last_key()
    }

    /// Whether the source announced the end of its stream.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Whether the lane was reaped and no longer receives frames.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn touch(&self, now: Instant) {
        *lock(&self.last_activity) = now;
    }

    fn reapable(&self, now: Instant, idle_timeout: Duration) -> bool {
        if self.in_flight.load(Ordering::Acquire) > 0 || !self.queue.is_empty() {
            return false;
        }
        self.is_ended() || now.saturating_duration_since(self.last_activity()) >= idle_timeout
    }

    pub fn snapshot(&self, now: Instant) -> LaneSnapshot {
        let counters = self.queue.counters();
        LaneSnapshot {
            source_id: self.source_id.clone(),
            endpoint: self.endpoint.clone(),
            depth: counters.depth(),
            capacity: self.queue.capacity(),
            admitted: counters.admitted(),
            dropped: counters.dropped(),
            duplicates: counters.duplicates(),
            blocked: counters.blocked(),
            last_frame_id: self.last_frame_id(),
            ended: self.is_ended(),
            idle_ms: now.saturating_duration_since(self.last_activity()).as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for SourceLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceLane")
            .field("source_id", &self.source_id)
            .field("endpoint", &self.endpoint)
            .field("depth", &self.queue.len())
            .field("last_frame_id", &self.last_frame_id())
            .finish()
    }
}

/// Marks an admission in progress so the reaper leaves the lane alone.
struct InFlight(Arc<SourceLane>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lane parameters taken from the endpoint configuration.
#[derive(Debug, Clone)]
pub struct LaneSettings {
    pub capacity: usize,
    pub policy: AdmissionPolicy,
    pub fps_period_frames: u64,
    pub fps_period: Option<Duration>,
}

impl LaneSettings {
    pub fn new(capacity: usize, policy: AdmissionPolicy) -> Self {
        Self { capacity, policy, fps_period_frames: 0, fps_period: None }
    }
}

/// Routes frames of one ingress endpoint into per-source lanes.
pub struct SourceRouter {
    endpoint: String,
    filter: SourceFilter,
    settings: LaneSettings,
    lanes: Mutex<HashMap<String, Arc<SourceLane>>>,
    lane_created: Arc<Notify>,
    dequeued: Arc<Notify>,
    accepting: AtomicBool,
    events: broadcast::Sender<HealthEvent>,
}

impl SourceRouter {
    pub fn new(
        endpoint: impl Into<String>,
        filter: SourceFilter,
        settings: LaneSettings,
        events: broadcast::Sender<HealthEvent>,
    ) -> Self {
        Self::with_notify(endpoint, filter, settings, events, Arc::new(Notify::new()))
    }

    /// Share a lane-creation signal with other routers so a consumer can wait on all of them.
    pub(crate) fn with_notify(
        endpoint: impl Into<String>,
        filter: SourceFilter,
        settings: LaneSettings,
        events: broadcast::Sender<HealthEvent>,
        lane_created: Arc<Notify>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            filter,
            settings,
            lanes: Mutex::new(HashMap::new()),
            lane_created,
            dequeued: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
            events,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn filter(&self) -> &SourceFilter {
        &self.filter
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn check_filter(&self, source_id: &str) -> Result<()> {
        if self.filter.matches(source_id) {
            Ok(())
        } else {
            Err(TransportError::FilterRejected { source_id: source_id.to_string() })
        }
    }

    /// Resolve the lane of `source_id`, creating it if the filters admit the source.
    pub fn route(&self, source_id: &str) -> Result<Arc<SourceLane>> {
        self.check_filter(source_id)?;
        if !self.is_accepting() {
            return Err(TransportError::Shutdown);
        }
        Ok(self.lane_entry(source_id, false).0)
    }

    /// Look up or create a lane under the map lock, optionally registering an admission.
    fn lane_entry(&self, source_id: &str, admit: bool) -> (Arc<SourceLane>, Option<InFlight>) {
        let mut lanes = lock(&self.lanes);
        let lane = match lanes.get(source_id) {
            Some(lane) => Arc::clone(lane),
            None => {
                let lane = Arc::new(SourceLane::new(source_id, &self.endpoint, &self.settings, &self.dequeued, Instant::now()));
                lanes.insert(source_id.to_string(), Arc::clone(&lane));
                debug!(endpoint = %self.endpoint, source_id, "lane created");
                let _ = self.events.send(HealthEvent::LaneCreated {
                    endpoint: self.endpoint.clone(),
                    source_id: source_id.to_string(),
                });
                self.lane_created.notify_waiters();
                lane
            }
        };
        let guard = admit.then(|| {
            lane.in_flight.fetch_add(1, Ordering::AcqRel);
            InFlight(Arc::clone(&lane))
        });
        (lane, guard)
    }

    /// Filter, sequence and enqueue one frame.
    ///
    /// Suspends while a blocking lane is full. Only the frame's own lane is affected.
    pub async fn admit(&self, frame: FrameMessage) -> Result<Admission> {
        let (lane, guard) = self.begin_admission(frame.source_id())?;
        let frame_id = frame.frame_id();
        let result = lane.queue.enqueue_sequenced(frame, Some(frame_id)).await;
        Self::finish_admission(&lane, guard, frame_id, result)
    }

    /// Like [`SourceRouter::admit`] but never waits.
    ///
    /// A full blocking lane yields [`TransportError::QueueFull`] and the frame is not
    /// sequenced, so the same frame can be offered again later.
    pub fn try_admit(&self, frame: FrameMessage) -> Result<Admission> {
        let (lane, guard) = self.begin_admission(frame.source_id())?;
        let frame_id = frame.frame_id();
        let result = lane.queue.try_enqueue(frame, Some(frame_id));
        Self::finish_admission(&lane, guard, frame_id, result)
    }

    fn begin_admission(&self, source_id: &str) -> Result<(Arc<SourceLane>, Option<InFlight>)> {
        self.check_filter(source_id)?;
        if !self.is_accepting() {
            return Err(TransportError::Shutdown);
        }
        Ok(self.lane_entry(source_id, true))
    }

    fn finish_admission(
        lane: &SourceLane,
        guard: Option<InFlight>,
        frame_id: i64,
        result: Result<Admission>,
    ) -> Result<Admission> {
        let now = Instant::now();
        lane.touch(now);
        if result.is_ok() {
            lane.ended.store(false, Ordering::Release);
            lock(&lane.fps).record_and_log(&lane.source_id, now);
        }
        drop(guard);

        if let Ok(Admission::DisplacedOldest) = result {
            debug!(source_id = %lane.source_id, frame_id, "lane full, oldest frame dropped");
        }
        result
    }

    /// Handle an end-of-stream announcement for `source_id`.
    ///
    /// The lane forgets its sequencing state and is reaped once drained.
    pub fn end_of_stream(&self, source_id: &str) -> Result<()> {
        self.check_filter(source_id)?;
        let lane = lock(&self.lanes).get(source_id).cloned();
        match lane {
            Some(lane) => {
                lane.ended.store(true, Ordering::Release);
                lane.queue.reset_sequence();
                lane.touch(Instant::now());
                info!(endpoint = %self.endpoint, source_id, "end of stream");
                let _ = self.events.send(HealthEvent::LaneEnded {
                    endpoint: self.endpoint.clone(),
                    source_id: source_id.to_string(),
                });
            }
            None => debug!(endpoint = %self.endpoint, source_id, "end of stream for unknown lane"),
        }
        Ok(())
    }

    pub fn lane(&self, source_id: &str) -> Option<Arc<SourceLane>> {
        lock(&self.lanes).get(source_id).cloned()
    }

    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.lanes).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshots(&self, now: Instant) -> Vec<LaneSnapshot> {
        let lanes: Vec<Arc<SourceLane>> = lock(&self.lanes).values().cloned().collect();
        let mut snapshots: Vec<LaneSnapshot> = lanes.iter().map(|lane| lane.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        snapshots
    }

    /// Remove lanes that are drained and either ended or idle past `idle_timeout`.
    pub fn reap_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<String> {
        let reaped: Vec<Arc<SourceLane>> = {
            let mut lanes = lock(&self.lanes);
            let ids: Vec<String> = lanes
                .iter()
                .filter(|(_, lane)| lane.reapable(now, idle_timeout))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| lanes.remove(id)).collect()
        };

        reaped
            .into_iter()
            .map(|lane| {
                lane.retired.store(true, Ordering::Release);
                lane.queue.close();
                debug!(endpoint = %self.endpoint, source_id = %lane.source_id, "lane reaped");
                let _ = self.events.send(HealthEvent::LaneReaped {
                    endpoint: self.endpoint.clone(),
                    source_id: lane.source_id.clone(),
                });
                lane.source_id.clone()
            })
            .collect()
    }

    /// Stop admitting frames; queued frames stay available to consumers.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
        for lane in lock(&self.lanes).values() {
            lane.queue.stop_accepting();
        }
        self.lane_created.notify_waiters();
    }

    /// Frames still queued across all lanes.
    pub fn queued(&self) -> usize {
        lock(&self.lanes).values().map(|lane| lane.queue.len()).sum()
    }

    /// Wait until consumers have taken every queued frame, or until `deadline`.
    pub async fn wait_drained(&self, deadline: Instant) -> bool {
        loop {
            let notified = self.dequeued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.queued() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.queued() == 0;
            }
        }
    }

    /// Close every lane, discarding what remains. Returns the discard count.
    pub fn close(&self) -> usize {
        self.stop_accepting();
        let discarded: usize = lock(&self.lanes).values().map(|lane| lane.queue.close()).sum();
        if discarded > 0 {
            warn!(endpoint = %self.endpoint, discarded, "discarded queued frames on close");
        }
        discarded
    }

    /// Wait up to `timeout` for the next frame of `source_id`.
    pub async fn poll(self: &Arc<Self>, source_id: &str, timeout: Duration) -> Result<Option<FrameMessage>> {
        poll_routers(std::slice::from_ref(self), &self.lane_created, source_id, timeout).await
    }
}

/// Wait for the next frame of `source_id` from whichever router owns its lane.
///
/// If no lane exists yet, waits for one to be created within `timeout`. A lane that
/// is reaped while being polled is looked up again.
pub(crate) async fn poll_routers(
    routers: &[Arc<SourceRouter>],
    lane_created: &Notify,
    source_id: &str,
    timeout: Duration,
) -> Result<Option<FrameMessage>> {
    let deadline = Instant::now() + timeout;
    loop {
        let lane = loop {
            let notified = lane_created.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lane) = routers.iter().find_map(|router| router.lane(source_id)) {
                break lane;
            }
            if !routers.iter().any(|router| router.is_accepting()) {
                return Err(TransportError::Shutdown);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match lane.queue.poll(remaining).await {
            Err(TransportError::Shutdown) if lane.is_retired() => continue,
            other => return other,
        }
    }
}
