//! Endpoint bindings.
//!
//! An [`EndpointBinding`] turns an [`EndpointSpec`] into live links. Every address of
//! the endpoint is either bound (an accept loop serves any number of peers) or connected
//! (a connector keeps one link alive with bounded exponential backoff). All links of
//! an endpoint feed one logical endpoint:
//!
//! - ingress bindings (`router`, `sub`, `pull`) decode what arrives and admit it into
//!   the endpoint's [`SourceRouter`]
//! - egress bindings (`dealer`, `pub`, `push`) own an outbox drained by a dispatcher
//!   that applies the pattern's delivery rules
//!
//! Link failures never surface on the encode/decode path: they are retried by the
//! driver and reported as [`HealthEvent`]s and reconnect counters.

mod egress;
mod ingress;

pub use egress::Ack;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec;
use crate::config::{EndpointSpec, TransportConfig};
use crate::driver::{Driver, LinkHandler};
use crate::link::check_packet_size;
use crate::metrics::{EndpointCounters, EndpointSnapshot, HealthEvent};
use crate::queue::BoundedQueue;
use crate::router::{LaneSettings, SourceRouter};
use crate::transport::TransportContext;
use crate::types::{Direction, FrameMessage, SocketRole};
use crate::{Result, TransportError};
use egress::{Dispatcher, EgressHandler, Outgoing};
use ingress::IngressHandler;

enum Flow {
    Ingress {
        router: Arc<SourceRouter>,
    },
    Egress {
        outbox: Arc<BoundedQueue<Outgoing>>,
        finished: CancellationToken,
    },
}

/// One configured endpoint with its live links.
pub struct EndpointBinding {
    spec: EndpointSpec,
    label: String,
    counters: Arc<EndpointCounters>,
    flow: Flow,
    local_addresses: Vec<String>,
    driver: Driver,
    cancel: CancellationToken,
}

impl EndpointBinding {
    /// Bind or connect an ingress endpoint feeding `router`.
    pub async fn ingress(
        spec: EndpointSpec,
        router: Arc<SourceRouter>,
        context: &TransportContext,
        config: &TransportConfig,
        events: broadcast::Sender<HealthEvent>,
    ) -> Result<Self> {
        spec.validate_for(Direction::Ingress)?;
        let counters = Arc::new(EndpointCounters::default());
        let handler = IngressHandler::new(
            Arc::clone(&router),
            Arc::clone(&counters),
            spec.pattern.acknowledges(),
            spec.queue_max_size,
        );
        Self::establish(spec, Flow::Ingress { router }, Arc::new(handler), counters, context, config, events).await
    }

    /// Bind or connect an egress endpoint and start its dispatcher.
    pub async fn egress(
        spec: EndpointSpec,
        context: &TransportContext,
        config: &TransportConfig,
        events: broadcast::Sender<HealthEvent>,
    ) -> Result<Self> {
        spec.validate_for(Direction::Egress)?;
        let counters = Arc::new(EndpointCounters::default());
        let label = spec.label();
        let outbox = Arc::new(BoundedQueue::new(label.clone(), spec.queue_max_size, spec.admission_policy()));
        let (links_tx, links_rx) = mpsc::channel(16);
        let finished = CancellationToken::new();

        let flow = Flow::Egress { outbox: Arc::clone(&outbox), finished: finished.clone() };
        let handler = Arc::new(EgressHandler::new(links_tx));
        let binding = Self::establish(spec, flow, handler, Arc::clone(&counters), context, config, events).await?;

        let dispatcher = Dispatcher {
            endpoint: label,
            pattern: binding.spec.pattern,
            outbox,
            links: links_rx,
            counters,
            ack_timeout: config.ack_timeout(),
            busy_retry: config.busy_retry(),
            linger: config.shutdown_grace(),
            cancel: binding.cancel.clone(),
            finished,
        };
        binding.driver.tracker().spawn(dispatcher.run());
        Ok(binding)
    }

    async fn establish(
        spec: EndpointSpec,
        flow: Flow,
        handler: Arc<dyn LinkHandler>,
        counters: Arc<EndpointCounters>,
        context: &TransportContext,
        config: &TransportConfig,
        events: broadcast::Sender<HealthEvent>,
    ) -> Result<Self> {
        let label = spec.label();
        let cancel = CancellationToken::new();
        let driver = Driver::new(
            label.clone(),
            context.clone(),
            config.link_buffer,
            config.reconnect,
            Arc::clone(&counters),
            events,
            handler,
            cancel.clone(),
        );

        let mut local_addresses = Vec::with_capacity(spec.addresses.len());
        for address in &spec.addresses {
            match spec.role {
                SocketRole::Bind => match driver.bind(address).await {
                    Ok(local) => local_addresses.push(local),
                    Err(e) => {
                        cancel.cancel();
                        return Err(e);
                    }
                },
                SocketRole::Connect => {
                    driver.connect(address.clone());
                    local_addresses.push(address.to_string());
                }
            }
        }

        info!(
            endpoint = %label,
            pattern = %spec.pattern,
            role = ?spec.role,
            "Endpoint ready on {}",
            local_addresses.join(",")
        );
        Ok(Self { spec, label, counters, flow, local_addresses, driver, cancel })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    pub fn counters(&self) -> &EndpointCounters {
        &self.counters
    }

    /// Addresses as bound (ephemeral ports resolved) or dialed.
    pub fn local_addresses(&self) -> &[String] {
        &self.local_addresses
    }

    pub fn router(&self) -> Option<&Arc<SourceRouter>> {
        match &self.flow {
            Flow::Ingress { router } => Some(router),
            Flow::Egress { .. } => None,
        }
    }

    pub fn is_egress(&self) -> bool {
        matches!(self.flow, Flow::Egress { .. })
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let outbox = match &self.flow {
            Flow::Egress { outbox, .. } => Some((outbox.len(), outbox.counters().dropped())),
            Flow::Ingress { .. } => None,
        };
        EndpointSnapshot::capture(&self.label, self.spec.pattern, &self.counters, outbox)
    }

    /// Encode and queue `frame` for the peers of this egress endpoint.
    pub async fn publish(&self, frame: &FrameMessage) -> Result<Ack> {
        self.send(codec::encode(frame), frame.source_id()).await
    }

    /// Announce the end of `source_id`'s stream to the peers.
    pub async fn publish_end_of_stream(&self, source_id: &str) -> Result<Ack> {
        if source_id.is_empty() {
            return Err(TransportError::InvalidMessage { field: "source_id", details: "must not be empty".into() });
        }
        self.send(codec::encode_end_of_stream(source_id), source_id).await
    }

    async fn send(&self, body: bytes::Bytes, source_id: &str) -> Result<Ack> {
        let Flow::Egress { outbox, .. } = &self.flow else {
            return Err(TransportError::config(format!(
                "endpoint {} is an ingress endpoint and cannot publish",
                self.label
            )));
        };
        check_packet_size(&body)?;

        if !self.spec.pattern.acknowledges() {
            outbox.enqueue(Outgoing { source_id: source_id.to_string(), body, reply: None }).await?;
            return Ok(Ack::Queued);
        }

        let (reply, response) = oneshot::channel();
        outbox.enqueue(Outgoing { source_id: source_id.to_string(), body, reply: Some(reply) }).await?;
        match response.await {
            Ok(result) => result,
            Err(_) if !outbox.is_accepting() || self.cancel.is_cancelled() => Err(TransportError::Shutdown),
            // Reply dropped without an answer: evicted by drop-oldest admission.
            Err(_) => Err(TransportError::QueueFull { lane: self.label.clone(), capacity: outbox.capacity() }),
        }
    }

    /// Stop taking new work. Queued frames and outbox messages remain.
    pub fn stop_accepting(&self) {
        match &self.flow {
            Flow::Ingress { router } => router.stop_accepting(),
            Flow::Egress { outbox, .. } => outbox.stop_accepting(),
        }
    }

    /// Wait until everything pending has been consumed or sent, up to `deadline`.
    pub async fn drain(&self, deadline: Instant) -> bool {
        match &self.flow {
            Flow::Egress { finished, .. } => {
                tokio::time::timeout_at(deadline, finished.cancelled()).await.is_ok()
            }
            Flow::Ingress { router } => router.wait_drained(deadline).await,
        }
    }

    /// Stop all tasks and close links.
    ///
    /// Returns how many messages were discarded: what is left in the lanes or the
    /// outbox plus what was lost in flight (see [`EndpointCounters::discarded`]).
    pub async fn close(&self) -> usize {
        self.stop_accepting();
        self.cancel.cancel();
        let tracker = self.driver.tracker();
        tracker.close();
        if tokio::time::timeout(Duration::from_secs(1), tracker.wait()).await.is_err() {
            debug!(endpoint = %self.label, "Some link tasks did not stop within 1s");
        }
        let queued = match &self.flow {
            Flow::Ingress { router } => router.close(),
            Flow::Egress { outbox, .. } => outbox.close(),
        };
        let discarded = queued + self.counters.discarded() as usize;
        info!(endpoint = %self.label, discarded, "Endpoint closed");
        discarded
    }
}

impl Drop for EndpointBinding {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for EndpointBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointBinding")
            .field("label", &self.label)
            .field("pattern", &self.spec.pattern)
            .field("role", &self.spec.role)
            .field("local_addresses", &self.local_addresses)
            .finish()
    }
}

/// Router settings derived from an ingress endpoint and the runtime configuration.
pub(crate) fn lane_settings(spec: &EndpointSpec, config: &TransportConfig) -> LaneSettings {
    LaneSettings {
        capacity: spec.queue_max_size,
        policy: spec.admission_policy(),
        fps_period_frames: config.fps_period_frames,
        fps_period: config.fps_period(),
    }
}
