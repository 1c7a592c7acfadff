//! Egress dispatch: outbox to peers
//!
//! One dispatcher task per egress endpoint takes messages from the outbox and hands
//! them to connected peers according to the socket pattern:
//!
//! - `pub` offers every message to every peer without waiting; a peer whose buffer
//!   is full misses the message and the drop is counted
//! - `push` gives each message to one peer, round-robin, waiting for buffer space
//! - `dealer` does the same but waits for the receiver's acknowledgement before
//!   moving on, and reports the verdict to the publisher
//!
//! With no connected peer the dispatcher stops taking from the outbox, so messages
//! accumulate there under the endpoint's admission policy.
//!
//! A dealer whose receiver answers [`AckStatus::Busy`] parks the message and every
//! later message of the same source, then retries after a short delay. Messages of
//! other sources keep flowing meanwhile.
//!
//! When the dispatcher ends it flushes its links; whatever could not be written is
//! counted as discarded.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::driver::LinkHandler;
use crate::link::{AckStatus, Link, Packet};
use crate::metrics::EndpointCounters;
use crate::queue::BoundedQueue;
use crate::types::SocketPattern;
use crate::{Result, TransportError};

/// Publisher-visible outcome of [`crate::supervisor::TransportSupervisor::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Accepted into the outbox; `pub` and `push` give no per-message confirmation.
    Queued,
    /// The receiving router admitted the message (or had already admitted it).
    Confirmed(AckStatus),
}

impl Ack {
    pub fn is_confirmed(self) -> bool {
        matches!(self, Ack::Confirmed(_))
    }
}

/// One message waiting in an outbox.
pub(crate) struct Outgoing {
    pub source_id: String,
    pub body: Bytes,
    pub reply: Option<oneshot::Sender<Result<Ack>>>,
}

impl Outgoing {
    fn respond(self, result: Result<Ack>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// Hands each established link to the dispatcher and holds it until it closes.
pub(crate) struct EgressHandler {
    links: mpsc::Sender<Link>,
}

impl EgressHandler {
    pub fn new(links: mpsc::Sender<Link>) -> Self {
        Self { links }
    }
}

#[async_trait::async_trait]
impl LinkHandler for EgressHandler {
    async fn serve(&self, link: Link, cancel: CancellationToken) {
        let closed = link.closed_token();
        if self.links.send(link).await.is_err() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = closed.cancelled() => {}
        }
    }
}

/// Outcome of offering one message to the peers.
enum Delivery {
    Done,
    /// No usable peer; keep the message and wait for one.
    Retry(Outgoing),
    /// The receiver's lane is full; try this source again later.
    Busy(Outgoing),
    /// Cancelled with the message still undelivered.
    Stop(Outgoing),
}

struct ParkedSource {
    retry_at: Instant,
    messages: VecDeque<Outgoing>,
}

/// Dealer messages held back per source after a busy answer, in publish order.
#[derive(Default)]
struct Parked {
    sources: HashMap<String, ParkedSource>,
    len: usize,
}

impl Parked {
    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn holds(&self, source_id: &str) -> bool {
        self.sources.contains_key(source_id)
    }

    /// Put a message refused as busy back at the head of its source.
    fn park(&mut self, message: Outgoing, retry_at: Instant) {
        let source = self
            .sources
            .entry(message.source_id.clone())
            .or_insert_with(|| ParkedSource { retry_at, messages: VecDeque::new() });
        source.retry_at = retry_at;
        source.messages.push_front(message);
        self.len += 1;
    }

    /// Queue a message behind the parked messages of its source.
    fn push_back(&mut self, message: Outgoing) {
        if let Some(source) = self.sources.get_mut(&message.source_id) {
            source.messages.push_back(message);
            self.len += 1;
        }
    }

    fn next_retry(&self) -> Option<Instant> {
        self.sources.values().map(|source| source.retry_at).min()
    }

    /// Oldest message of the source whose retry is most overdue.
    fn take_due(&mut self, now: Instant) -> Option<Outgoing> {
        let source_id = self
            .sources
            .iter()
            .filter(|(_, source)| source.retry_at <= now)
            .min_by_key(|(_, source)| source.retry_at)
            .map(|(id, _)| id.clone())?;
        let source = self.sources.get_mut(&source_id)?;
        let message = source.messages.pop_front();
        if source.messages.is_empty() {
            self.sources.remove(&source_id);
        }
        if message.is_some() {
            self.len -= 1;
        }
        message
    }

    fn take_all(&mut self) -> Vec<Outgoing> {
        self.len = 0;
        self.sources.drain().flat_map(|(_, source)| source.messages).collect()
    }
}

pub(crate) struct Dispatcher {
    pub endpoint: String,
    pub pattern: SocketPattern,
    pub outbox: Arc<BoundedQueue<Outgoing>>,
    pub links: mpsc::Receiver<Link>,
    pub counters: Arc<EndpointCounters>,
    pub ack_timeout: Duration,
    /// Pause before resending to a receiver that answered busy.
    pub busy_retry: Duration,
    /// How long links may take to flush when the outbox has drained.
    pub linger: Duration,
    pub cancel: CancellationToken,
    /// Cancelled when the dispatcher exits.
    pub finished: CancellationToken,
}

impl Dispatcher {
    pub async fn run(mut self) {
        info!(endpoint = %self.endpoint, pattern = %self.pattern, "Dispatcher started");
        let mut peers: Vec<Link> = Vec::new();
        let mut next_peer = 0usize;
        let mut next_id = 0u64;
        let mut pending: Option<Outgoing> = None;
        let mut parked = Parked::default();
        let mut outbox_open = true;
        let mut links_open = true;

        loop {
            self.prune(&mut peers).await;

            if peers.is_empty() {
                let link = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    link = self.links.recv(), if links_open => link,
                };
                match link {
                    Some(link) => peers.push(link),
                    None => break,
                }
                continue;
            }

            let message = if let Some(message) = pending.take() {
                message
            } else if let Some(message) = parked.take_due(Instant::now()) {
                message
            } else {
                if !outbox_open && parked.is_empty() {
                    break;
                }
                let has_room = outbox_open && parked.len() < self.outbox.capacity();
                let retry_at = parked.next_retry().unwrap_or_else(|| Instant::now() + self.busy_retry);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    link = self.links.recv(), if links_open => {
                        match link {
                            Some(link) => peers.push(link),
                            None => links_open = false,
                        }
                        continue;
                    }
                    _ = tokio::time::sleep_until(retry_at), if !parked.is_empty() => continue,
                    message = self.outbox.dequeue(), if has_room => match message {
                        Ok(message) if parked.holds(&message.source_id) => {
                            parked.push_back(message);
                            continue;
                        }
                        Ok(message) => message,
                        Err(_) => {
                            outbox_open = false;
                            continue;
                        }
                    },
                }
            };

            next_id = next_id.wrapping_add(1);
            let delivery = match self.pattern {
                SocketPattern::Pub => self.broadcast(&peers, next_id, message),
                SocketPattern::Dealer => self.request(&mut peers, &mut next_peer, next_id, message).await,
                _ => self.distribute(&peers, &mut next_peer, next_id, message).await,
            };
            match delivery {
                Delivery::Done => {}
                Delivery::Retry(message) => pending = Some(message),
                Delivery::Busy(message) => parked.park(message, Instant::now() + self.busy_retry),
                Delivery::Stop(message) => {
                    pending = Some(message);
                    break;
                }
            }
        }

        let mut unanswered = parked.take_all();
        unanswered.extend(pending);
        if !unanswered.is_empty() {
            warn!(endpoint = %self.endpoint, count = unanswered.len(), "Dropping messages that were never delivered");
            self.counters.record_discarded(unanswered.len());
        }
        for message in unanswered {
            message.respond(Err(TransportError::Shutdown));
        }

        let linger = if self.cancel.is_cancelled() { Duration::ZERO } else { self.linger };
        let unsent: usize = futures::future::join_all(peers.iter().map(|peer| peer.flush(linger))).await.into_iter().sum();
        if unsent > 0 {
            warn!(endpoint = %self.endpoint, unsent, "Links closed before writing everything");
            self.counters.record_discarded(unsent);
        }
        self.finished.cancel();
        info!(endpoint = %self.endpoint, "Dispatcher ended");
    }

    /// Drop closed peers, counting what their links never wrote.
    async fn prune(&self, peers: &mut Vec<Link>) {
        if peers.iter().all(|peer| !peer.is_closed()) {
            return;
        }
        let (closed, open): (Vec<Link>, Vec<Link>) = peers.drain(..).partition(Link::is_closed);
        *peers = open;
        for peer in closed {
            let unsent = peer.flush(Duration::ZERO).await;
            if unsent > 0 {
                warn!(endpoint = %self.endpoint, peer = %peer.peer(), unsent, "Link lost with messages unwritten");
                self.counters.record_discarded(unsent);
            }
        }
    }

    fn broadcast(&self, peers: &[Link], id: u64, message: Outgoing) -> Delivery {
        let mut delivered = 0usize;
        for peer in peers {
            let packet = Packet::Data { id, want_ack: false, body: message.body.clone() };
            match peer.try_send(packet) {
                Ok(true) => delivered += 1,
                Ok(false) => {
                    self.counters.record_egress_drop();
                    trace!(endpoint = %self.endpoint, peer = %peer.peer(), "Peer buffer full, message dropped");
                }
                Err(_) => trace!(endpoint = %self.endpoint, peer = %peer.peer(), "Peer gone"),
            }
        }
        if delivered == 0 && peers.iter().all(Link::is_closed) {
            return Delivery::Retry(message);
        }
        if delivered > 0 {
            self.counters.record_sent();
        }
        message.respond(Ok(Ack::Queued));
        Delivery::Done
    }

    /// Index of the next open peer in round-robin order.
    fn pick(peers: &[Link], next_peer: &mut usize) -> Option<usize> {
        let len = peers.len();
        let start = *next_peer;
        for offset in 0..len {
            let index = (start + offset) % len;
            if !peers[index].is_closed() {
                *next_peer = (index + 1) % len;
                return Some(index);
            }
        }
        None
    }

    async fn distribute(&self, peers: &[Link], next_peer: &mut usize, id: u64, message: Outgoing) -> Delivery {
        let Some(index) = Self::pick(peers, next_peer) else {
            return Delivery::Retry(message);
        };
        let peer = &peers[index];
        let packet = Packet::Data { id, want_ack: false, body: message.body.clone() };
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Delivery::Stop(message),
            sent = peer.send(packet) => sent,
        };
        match sent {
            Ok(()) => {
                self.counters.record_sent();
                message.respond(Ok(Ack::Queued));
                Delivery::Done
            }
            Err(_) => Delivery::Retry(message),
        }
    }

    async fn request(&self, peers: &mut [Link], next_peer: &mut usize, id: u64, message: Outgoing) -> Delivery {
        let Some(index) = Self::pick(peers, next_peer) else {
            return Delivery::Retry(message);
        };
        let peer = &mut peers[index];

        let packet = Packet::Data { id, want_ack: true, body: message.body.clone() };
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Delivery::Stop(message),
            sent = peer.send(packet) => sent,
        };
        if sent.is_err() {
            return Delivery::Retry(message);
        }
        self.counters.record_sent();

        let waited = tokio::select! {
            _ = self.cancel.cancelled() => return Delivery::Stop(message),
            waited = tokio::time::timeout(self.ack_timeout, wait_for_ack(peer, id)) => waited,
        };
        match waited {
            Ok(Some(status)) if status.is_delivered() => {
                trace!(endpoint = %self.endpoint, id, status = status.as_str(), "Acknowledged");
                message.respond(Ok(Ack::Confirmed(status)));
                Delivery::Done
            }
            Ok(Some(AckStatus::Busy)) => {
                debug!(endpoint = %self.endpoint, source_id = %message.source_id, "Receiver busy, parking source");
                Delivery::Busy(message)
            }
            Ok(Some(status)) => {
                debug!(endpoint = %self.endpoint, id, status = status.as_str(), "Message rejected by peer");
                message.respond(Err(TransportError::rejected(status.as_str())));
                Delivery::Done
            }
            // The receiver deduplicates by frame id, so resending after a lost link is safe.
            Ok(None) => {
                warn!(endpoint = %self.endpoint, peer = %peer.peer(), "Link lost awaiting ack, resending");
                Delivery::Retry(message)
            }
            Err(_) => {
                warn!(endpoint = %self.endpoint, id, "No ack within {:?}", self.ack_timeout);
                message.respond(Err(TransportError::Timeout { duration: self.ack_timeout }));
                Delivery::Done
            }
        }
    }
}

/// Wait for the ack of packet `id`, skipping stale acks. `None` if the link closes.
async fn wait_for_ack(peer: &mut Link, id: u64) -> Option<AckStatus> {
    loop {
        match peer.recv().await? {
            Packet::Ack { id: acked, status } if acked == id => return Some(status),
            Packet::Ack { id: acked, .. } => trace!(acked, expected = id, "Skipping stale ack"),
            Packet::Data { .. } => trace!("Ignoring data on egress link"),
        }
    }
}
