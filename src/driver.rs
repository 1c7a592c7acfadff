//! Driver spawns and manages link tasks

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::{Address, BackoffConfig};
use crate::link::Link;
use crate::metrics::{EndpointCounters, HealthEvent};
use crate::transport::{Acceptor, TransportContext};
use crate::Result;

/// Failed attempts logged at `warn!` before escalating to `error!`.
const QUIET_ATTEMPTS: u32 = 5;

/// What an endpoint does with each established link.
#[async_trait::async_trait]
pub trait LinkHandler: Send + Sync + 'static {
    /// Serve `link` until it closes or `cancel` fires.
    async fn serve(&self, link: Link, cancel: CancellationToken);
}

/// Driver establishes links for one endpoint and runs a handler on each
///
/// Bound addresses get an accept loop that serves every peer in its own task.
/// Connected addresses get a connector task that dials, serves the link until it
/// drops, and redials with bounded exponential backoff. All tasks stop when the
/// driver's cancellation token fires.
pub struct Driver {
    endpoint: String,
    context: TransportContext,
    buffer: usize,
    backoff: BackoffConfig,
    counters: Arc<EndpointCounters>,
    events: broadcast::Sender<HealthEvent>,
    handler: Arc<dyn LinkHandler>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: impl Into<String>,
        context: TransportContext,
        buffer: usize,
        backoff: BackoffConfig,
        counters: Arc<EndpointCounters>,
        events: broadcast::Sender<HealthEvent>,
        handler: Arc<dyn LinkHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            context,
            buffer,
            backoff,
            counters,
            events,
            handler,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Bind `address` and spawn its accept loop. Returns the bound address.
    ///
    /// Bind failures are returned immediately: an address that cannot be owned is
    /// a startup error for the endpoint.
    pub async fn bind(&self, address: &Address) -> Result<String> {
        let acceptor = self.context.listen(address, self.buffer).await?;
        let local = acceptor.local_address();
        let task = AcceptLoop {
            endpoint: self.endpoint.clone(),
            counters: Arc::clone(&self.counters),
            handler: Arc::clone(&self.handler),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        };
        self.tracker.spawn(task.run(acceptor));
        Ok(local)
    }

    /// Spawn a connector task that keeps a link to `address` alive.
    pub fn connect(&self, address: Address) {
        let task = Connector {
            endpoint: self.endpoint.clone(),
            context: self.context.clone(),
            buffer: self.buffer,
            backoff: self.backoff,
            counters: Arc::clone(&self.counters),
            events: self.events.clone(),
            handler: Arc::clone(&self.handler),
            cancel: self.cancel.clone(),
        };
        self.tracker.spawn(task.run(address));
    }
}

struct AcceptLoop {
    endpoint: String,
    counters: Arc<EndpointCounters>,
    handler: Arc<dyn LinkHandler>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self, mut acceptor: Box<dyn Acceptor>) {
        let local = acceptor.local_address();
        info!(endpoint = %self.endpoint, "Accept loop started on {}", local);
        let mut peer_count = 0u64;
        let mut error_count = 0u32;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = acceptor.accept() => result,
            };

            match result {
                Ok(link) => {
                    peer_count += 1;
                    error_count = 0;
                    debug!(endpoint = %self.endpoint, peer = %link.peer(), "Peer connected");

                    let counters = Arc::clone(&self.counters);
                    let handler = Arc::clone(&self.handler);
                    let cancel = self.cancel.child_token();
                    let endpoint = self.endpoint.clone();
                    counters.peer_connected();
                    self.tracker.spawn(async move {
                        let peer = link.peer().to_string();
                        handler.serve(link, cancel).await;
                        counters.peer_disconnected();
                        debug!(endpoint = %endpoint, peer = %peer, "Peer disconnected");
                    });
                }
                Err(e) => {
                    error_count += 1;
                    if error_count > QUIET_ATTEMPTS {
                        error!(endpoint = %self.endpoint, "Accept error ({}): {}", error_count, e);
                    } else {
                        warn!(endpoint = %self.endpoint, "Accept error ({}): {}", error_count, e);
                    }

                    // Exponential backoff: 50ms, 100ms, 200ms, ...
                    let backoff = std::time::Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(endpoint = %self.endpoint, "Accept loop on {} ended (served {} peers)", local, peer_count);
    }
}

struct Connector {
    endpoint: String,
    context: TransportContext,
    buffer: usize,
    backoff: BackoffConfig,
    counters: Arc<EndpointCounters>,
    events: broadcast::Sender<HealthEvent>,
    handler: Arc<dyn LinkHandler>,
    cancel: CancellationToken,
}

impl Connector {
    fn report_disconnect(&self, address: &Address, reason: String, attempt: u32) {
        self.counters.record_reconnect();
        let _ = self.events.send(HealthEvent::EndpointDisconnected {
            endpoint: self.endpoint.clone(),
            address: address.to_string(),
            reason,
            attempt,
        });
    }

    async fn run(self, address: Address) {
        info!(endpoint = %self.endpoint, "Connector for {} started", address);
        let mut attempt = 0u32;
        let mut link_count = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.context.dial(&address, self.buffer) => result,
            };

            let delay = match result {
                Ok(link) => {
                    link_count += 1;
                    attempt = 0;
                    self.counters.peer_connected();
                    let _ = self.events.send(HealthEvent::EndpointConnected {
                        endpoint: self.endpoint.clone(),
                        address: address.to_string(),
                    });
                    info!(endpoint = %self.endpoint, "Connected to {}", address);

                    self.handler.serve(link, self.cancel.child_token()).await;
                    self.counters.peer_disconnected();
                    if self.cancel.is_cancelled() {
                        break;
                    }

                    warn!(endpoint = %self.endpoint, "Link to {} lost, reconnecting", address);
                    self.report_disconnect(&address, "link closed".to_string(), 0);
                    self.backoff.delay(0)
                }
                Err(e) if !e.is_retryable() => {
                    error!(endpoint = %self.endpoint, "Cannot connect to {}: {}", address, e);
                    self.report_disconnect(&address, e.to_string(), attempt + 1);
                    break;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if attempt > QUIET_ATTEMPTS {
                        error!(endpoint = %self.endpoint, "Connect to {} failed ({}): {}", address, attempt, e);
                    } else {
                        debug!(endpoint = %self.endpoint, "Connect to {} failed ({}): {}", address, attempt, e);
                    }
                    self.report_disconnect(&address, e.to_string(), attempt);
                    self.backoff.delay(attempt - 1)
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(endpoint = %self.endpoint, "Connector for {} ended ({} links)", address, link_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{AckStatus, Packet};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Forwards every received packet to a channel.
    struct Forward(mpsc::UnboundedSender<Packet>);

    #[async_trait::async_trait]
    impl LinkHandler for Forward {
        async fn serve(&self, mut link: Link, cancel: CancellationToken) {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = link.recv() => match packet {
                        Some(packet) => { let _ = self.0.send(packet); }
                        None => break,
                    },
                }
            }
        }
    }

    /// Sends one packet and then holds the link open.
    struct Greet;

    #[async_trait::async_trait]
    impl LinkHandler for Greet {
        async fn serve(&self, link: Link, cancel: CancellationToken) {
            let _ = link.send(Packet::Ack { id: 1, status: AckStatus::Admitted }).await;
            let closed = link.closed_token();
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = closed.cancelled() => {}
            }
        }
    }

    fn driver(context: &TransportContext, handler: Arc<dyn LinkHandler>) -> (Driver, broadcast::Receiver<HealthEvent>) {
        let (events, rx) = broadcast::channel(64);
        let backoff = BackoffConfig { initial_ms: 10, max_ms: 40, multiplier: 2.0 };
        let driver = Driver::new(
            "test",
            context.clone(),
            4,
            backoff,
            Arc::new(EndpointCounters::default()),
            events,
            handler,
            CancellationToken::new(),
        );
        (driver, rx)
    }

    #[tokio::test]
    async fn connector_retries_until_the_address_is_bound() {
        let context = TransportContext::new();
        let address = Address::Inproc("late-bind".into());

        let (connector, mut events) = driver(&context, Arc::new(Greet));
        connector.connect(address.clone());

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap() {
            HealthEvent::EndpointDisconnected { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(connector.counters.reconnects() >= 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (server, _) = driver(&context, Arc::new(Forward(tx)));
        server.bind(&address).await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(packet, Some(Packet::Ack { id: 1, status: AckStatus::Admitted }));
        assert_eq!(server.counters.connected_peers(), 1);

        connector.cancel.cancel();
        server.cancel.cancel();
        connector.tracker.close();
        server.tracker.close();
        tokio::time::timeout(Duration::from_secs(2), connector.tracker.wait()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), server.tracker.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn connector_redials_after_link_loss() {
        let context = TransportContext::new();
        let address = Address::Inproc("flaky".into());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (server, _) = driver(&context, Arc::new(Forward(tx)));
        server.bind(&address).await.unwrap();

        let (connector, mut events) = driver(&context, Arc::new(Greet));
        connector.connect(address.clone());
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();

        // Dropping every server-side link forces the connector to dial again.
        server.cancel.cancel();
        server.tracker.close();
        tokio::time::timeout(Duration::from_secs(2), server.tracker.wait()).await.unwrap();

        let mut saw_loss = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            if let HealthEvent::EndpointDisconnected { reason, .. } = event {
                saw_loss |= reason == "link closed";
                if saw_loss {
                    break;
                }
            }
        }
        assert!(saw_loss);
        connector.cancel.cancel();
    }

    #[tokio::test]
    async fn bind_conflicts_fail_fast() {
        let context = TransportContext::new();
        let address = Address::Inproc("taken".into());
        let (first, _) = driver(&context, Arc::new(Greet));
        first.bind(&address).await.unwrap();
        let (second, _) = driver(&context, Arc::new(Greet));
        assert!(second.bind(&address).await.is_err());
    }
}
