//! Transport supervisor: owns endpoints and lanes for one process.
//!
//! [`TransportSupervisor::start`] brings up every configured endpoint, then runs two
//! background tasks: a reaper that retires idle lanes and a health task that
//! publishes a [`HealthReport`] every `health_interval`. Consumers read frames with
//! [`poll`](TransportSupervisor::poll) or [`lane_stream`](TransportSupervisor::lane_stream);
//! producers send with [`publish`](TransportSupervisor::publish).
//!
//! Shutdown is ordered: stop accepting, drain within the grace period, then close
//! links and discard what is left. It runs once no matter how often it is requested,
//! and a [`ShutdownHandle`] can request it from synchronous code such as a signal
//! handler.

use futures::{Stream, StreamExt};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, OnceCell, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::endpoint::{Ack, EndpointBinding, lane_settings};
use crate::metrics::{HealthEvent, HealthReport, MetricsSnapshot};
use crate::router::{SourceRouter, poll_routers};
use crate::transport::TransportContext;
use crate::types::FrameMessage;
use crate::{Result, TransportError};

const EVENT_CAPACITY: usize = 256;

/// How long [`TransportSupervisor::lane_stream`] waits per poll before checking again.
const STREAM_POLL: Duration = Duration::from_millis(500);

struct Inner {
    config: TransportConfig,
    context: TransportContext,
    ingress: Vec<EndpointBinding>,
    egress: Vec<EndpointBinding>,
    routers: Vec<Arc<SourceRouter>>,
    lane_created: Arc<Notify>,
    events: broadcast::Sender<HealthEvent>,
    health: watch::Sender<Option<Arc<HealthReport>>>,
    started: Instant,
    tasks: TaskTracker,
    cancel: CancellationToken,
    shutdown_requested: CancellationToken,
    shutdown: OnceCell<usize>,
}

/// Owner of all endpoint bindings and lanes.
pub struct TransportSupervisor {
    inner: Arc<Inner>,
}

/// Requests shutdown of a supervisor from any thread, without awaiting.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: CancellationToken,
}

impl ShutdownHandle {
    /// Ask the supervisor to shut down. Safe to call repeatedly.
    pub fn trigger(&self) {
        self.requested.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.is_cancelled()
    }
}

impl TransportSupervisor {
    /// Start every endpoint of `config` with a fresh transport context.
    pub async fn start(config: TransportConfig) -> Result<Self> {
        Self::start_with_context(config, TransportContext::new()).await
    }

    /// Start with an existing context, sharing its in-process names.
    pub async fn start_with_context(config: TransportConfig, context: TransportContext) -> Result<Self> {
        config.validate()?;
        info!(
            ingress = config.ingress.len(),
            egress = config.egress.len(),
            "Starting transport supervisor"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let lane_created = Arc::new(Notify::new());

        let mut ingress = Vec::with_capacity(config.ingress.len());
        let mut routers = Vec::with_capacity(config.ingress.len());
        for spec in &config.ingress {
            let router = Arc::new(SourceRouter::with_notify(
                spec.label(),
                spec.filter.clone(),
                lane_settings(spec, &config),
                events.clone(),
                Arc::clone(&lane_created),
            ));
            match EndpointBinding::ingress(spec.clone(), Arc::clone(&router), &context, &config, events.clone()).await {
                Ok(binding) => {
                    routers.push(router);
                    ingress.push(binding);
                }
                Err(e) => {
                    abandon(&ingress).await;
                    return Err(e);
                }
            }
        }

        let mut egress = Vec::with_capacity(config.egress.len());
        for spec in &config.egress {
            match EndpointBinding::egress(spec.clone(), &context, &config, events.clone()).await {
                Ok(binding) => egress.push(binding),
                Err(e) => {
                    abandon(&ingress).await;
                    abandon(&egress).await;
                    return Err(e);
                }
            }
        }

        let (health, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            config,
            context,
            ingress,
            egress,
            routers,
            lane_created,
            events,
            health,
            started: Instant::now(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
            shutdown_requested: CancellationToken::new(),
            shutdown: OnceCell::new(),
        });

        inner.tasks.spawn(reaper(Arc::clone(&inner)));
        inner.tasks.spawn(health_reporter(Arc::clone(&inner)));
        inner.tasks.spawn(shutdown_watcher(
            Arc::downgrade(&inner),
            inner.shutdown_requested.clone(),
            inner.cancel.clone(),
        ));

        info!("Transport supervisor running");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &TransportContext {
        &self.inner.context
    }

    pub fn ingress(&self) -> &[EndpointBinding] {
        &self.inner.ingress
    }

    pub fn egress(&self) -> &[EndpointBinding] {
        &self.inner.egress
    }

    /// Find an endpoint by label.
    pub fn endpoint(&self, label: &str) -> Option<&EndpointBinding> {
        self.inner.ingress.iter().chain(&self.inner.egress).find(|binding| binding.label() == label)
    }

    /// Bound (or dialed) addresses of every endpoint, ephemeral ports resolved.
    pub fn local_addresses(&self) -> Vec<(String, Vec<String>)> {
        self.inner
            .ingress
            .iter()
            .chain(&self.inner.egress)
            .map(|binding| (binding.label().to_string(), binding.local_addresses().to_vec()))
            .collect()
    }

    /// Wait up to `timeout` for the next frame of `source_id`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time, including when the source has
    /// not been seen yet. Returns [`TransportError::Shutdown`] once shutting down and
    /// the lane has nothing left.
    pub async fn poll(&self, source_id: &str, timeout: Duration) -> Result<Option<FrameMessage>> {
        if self.inner.routers.is_empty() {
            return Err(TransportError::config("no ingress endpoints configured"));
        }
        poll_routers(&self.inner.routers, &self.inner.lane_created, source_id, timeout).await
    }

    /// Source ids with a live lane on any ingress endpoint.
    pub fn list_sources(&self) -> BTreeSet<String> {
        self.inner.routers.iter().flat_map(|router| router.source_ids()).collect()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }

    /// Frames of `source_id` as a stream, ending at shutdown.
    pub fn lane_stream(&self, source_id: impl Into<String>) -> impl Stream<Item = FrameMessage> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let source_id = source_id.into();
        futures::stream::unfold((inner, source_id), |(inner, source_id)| async move {
            loop {
                match poll_routers(&inner.routers, &inner.lane_created, &source_id, STREAM_POLL).await {
                    Ok(Some(frame)) => return Some((frame, (inner, source_id))),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(source_id = %source_id, "Lane stream ended: {}", e);
                        return None;
                    }
                }
            }
        })
    }

    /// Publish `frame` on every egress endpoint.
    ///
    /// Returns `Ack::Confirmed` if an acknowledging endpoint confirmed it, otherwise
    /// `Ack::Queued`. The first endpoint error is returned.
    pub async fn publish(&self, frame: &FrameMessage) -> Result<Ack> {
        let bindings = self.egress_bindings()?;
        let mut outcome = Ack::Queued;
        for binding in bindings {
            let ack = binding.publish(frame).await?;
            if ack.is_confirmed() {
                outcome = ack;
            }
        }
        Ok(outcome)
    }

    /// Publish on one egress endpoint.
    pub async fn publish_to(&self, label: &str, frame: &FrameMessage) -> Result<Ack> {
        self.egress_binding(label)?.publish(frame).await
    }

    /// Announce the end of `source_id`'s stream on every egress endpoint.
    pub async fn publish_end_of_stream(&self, source_id: &str) -> Result<()> {
        for binding in self.egress_bindings()? {
            binding.publish_end_of_stream(source_id).await?;
        }
        Ok(())
    }

    fn egress_bindings(&self) -> Result<&[EndpointBinding]> {
        if self.inner.egress.is_empty() {
            return Err(TransportError::config("no egress endpoints configured"));
        }
        Ok(&self.inner.egress)
    }

    fn egress_binding(&self, label: &str) -> Result<&EndpointBinding> {
        self.inner
            .egress
            .iter()
            .find(|binding| binding.label() == label)
            .ok_or_else(|| TransportError::config(format!("no egress endpoint named {}", label)))
    }

    /// Subscribe to discrete transport events.
    pub fn events(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    /// Health reports as they are published, starting with the latest one.
    pub fn health(&self) -> impl Stream<Item = Arc<HealthReport>> + Send + 'static {
        WatchStream::new(self.inner.health.subscribe()).filter_map(|report| async move { report })
    }

    /// Most recent health report, if one was published yet.
    pub fn latest_health(&self) -> Option<Arc<HealthReport>> {
        self.inner.health.borrow().clone()
    }

    /// Build a report now instead of waiting for the next interval.
    pub fn health_now(&self) -> HealthReport {
        HealthReport::build(self.inner.started.elapsed(), Duration::ZERO, None, self.metrics())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { requested: self.inner.shutdown_requested.clone() }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.initialized()
    }

    /// Stop accepting, drain within the grace period, then close everything.
    ///
    /// Returns the number of queued messages discarded. Later calls wait for the
    /// first shutdown and return the same count.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown().await
    }
}

impl Drop for TransportSupervisor {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for TransportSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSupervisor")
            .field("ingress", &self.inner.ingress)
            .field("egress", &self.inner.egress)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Inner {
    fn metrics(&self) -> MetricsSnapshot {
        let now = Instant::now();
        MetricsSnapshot {
            lanes: self.routers.iter().flat_map(|router| router.snapshots(now)).collect(),
            endpoints: self.ingress.iter().chain(&self.egress).map(EndpointBinding::snapshot).collect(),
        }
    }

    async fn shutdown(&self) -> usize {
        *self.shutdown.get_or_init(|| self.run_shutdown()).await
    }

    async fn run_shutdown(&self) -> usize {
        let grace = self.config.shutdown_grace();
        info!(grace_ms = grace.as_millis() as u64, "Shutting down transport");
        self.shutdown_requested.cancel();
        let _ = self.events.send(HealthEvent::ShutdownStarted);
        let deadline = Instant::now() + grace;

        for binding in &self.egress {
            binding.stop_accepting();
        }
        for binding in &self.egress {
            if !binding.drain(deadline).await {
                warn!(endpoint = binding.label(), "Outbox not drained within the grace period");
            }
        }

        for binding in &self.ingress {
            binding.stop_accepting();
        }
        for binding in &self.ingress {
            if !binding.drain(deadline).await {
                warn!(endpoint = binding.label(), "Lanes not drained within the grace period");
            }
        }

        self.cancel.cancel();
        let mut discarded = 0;
        for binding in self.egress.iter().chain(&self.ingress) {
            discarded += binding.close().await;
        }

        self.tasks.close();
        let _ = self.events.send(HealthEvent::ShutdownComplete { discarded });
        info!(discarded, "Transport shut down");
        discarded
    }
}

/// Close bindings that started before a later endpoint failed.
async fn abandon(bindings: &[EndpointBinding]) {
    for binding in bindings {
        binding.close().await;
    }
}

async fn reaper(inner: Arc<Inner>) {
    let idle_timeout = inner.config.lane_idle_timeout();
    let mut ticker = tokio::time::interval(inner.config.reap_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        for router in &inner.routers {
            let reaped = router.reap_idle(now, idle_timeout);
            if !reaped.is_empty() {
                debug!(endpoint = router.endpoint(), count = reaped.len(), "Reaped lanes");
            }
        }
    }
}

async fn health_reporter(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.health_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    let mut previous: Option<MetricsSnapshot> = None;
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let metrics = inner.metrics();
        let report = HealthReport::build(
            inner.started.elapsed(),
            now.saturating_duration_since(last),
            previous.as_ref(),
            metrics.clone(),
        );
        last = now;
        previous = Some(metrics);

        if report.saturated_lanes.is_empty() {
            info!(
                lanes = report.metrics.lanes.len(),
                throughput = format_args!("{:.1}", report.throughput),
                reconnects = report.metrics.total_reconnects(),
                "Transport health"
            );
        } else {
            warn!(saturated = ?report.saturated_lanes, "Lanes at capacity");
        }
        inner.health.send_replace(Some(Arc::new(report)));
    }
}

async fn shutdown_watcher(inner: Weak<Inner>, requested: CancellationToken, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = requested.cancelled() => {}
    }
    if let Some(inner) = inner.upgrade() {
        inner.shutdown().await;
    }
}
