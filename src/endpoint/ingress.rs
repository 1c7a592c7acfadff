//! Ingress link handling: decode, route, admit, acknowledge
//!
//! Many sources usually share one link, so a full lane must not stop the link from
//! being read. Acknowledging links admit without waiting and answer
//! [`AckStatus::Busy`] for a full lane; the sender resends later. Other links hand
//! each frame to an admission flow owned by its source, through a bounded hand-off
//! as deep as the lane itself. Only when a source's lane and hand-off are both full
//! does the reader wait, which is the backpressure a push or sub sender receives.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{self, WireMessage};
use crate::driver::LinkHandler;
use crate::link::{AckStatus, Link, Packet};
use crate::metrics::EndpointCounters;
use crate::router::SourceRouter;
use crate::types::FrameMessage;
use crate::{Result, TransportError};

/// Work handed from a link reader to a source's admission flow.
enum Handoff {
    Frame(FrameMessage),
    EndOfStream,
}

/// Router plus counters; everything needed to admit and account for a message.
#[derive(Clone)]
struct Admitter {
    router: Arc<SourceRouter>,
    counters: Arc<EndpointCounters>,
}

impl Admitter {
    fn decode(&self, body: &Bytes) -> Option<WireMessage> {
        self.counters.record_received();
        match codec::decode_envelope(body) {
            Ok(message) => Some(message),
            Err(e) => {
                self.counters.record_decode_error();
                warn!(endpoint = self.router.endpoint(), bytes = body.len(), "Discarding undecodable message: {}", e);
                None
            }
        }
    }

    fn record(&self, result: &Result<()>) {
        let endpoint = self.router.endpoint();
        match result {
            Ok(()) => {}
            Err(TransportError::FilterRejected { source_id }) => {
                self.counters.record_filter_rejection();
                warn!(endpoint, source_id = %source_id, "Source rejected by filters");
            }
            Err(TransportError::DuplicateOrStale { source_id, frame_id, last_frame_id }) => {
                self.counters.record_duplicate();
                warn!(endpoint, source_id = %source_id, frame_id, last_frame_id, "Dropping duplicate or stale frame");
            }
            Err(TransportError::QueueFull { lane, .. }) => trace!(endpoint, lane = %lane, "Lane full, sender asked to retry"),
            Err(e) => debug!(endpoint, "Frame not admitted: {}", e),
        }
    }

    /// Admit without waiting and report the verdict for an acknowledgement.
    fn admit_now(&self, body: &Bytes) -> AckStatus {
        let Some(message) = self.decode(body) else {
            return AckStatus::DecodeFailed;
        };
        let result = match message {
            WireMessage::EndOfStream { source_id } => self.router.end_of_stream(&source_id),
            WireMessage::Frame(frame) => {
                trace!(source_id = frame.source_id(), frame_id = frame.frame_id(), "Frame received");
                self.router.try_admit(frame).map(|_| ())
            }
        };
        self.record(&result);
        AckStatus::from_outcome(&result)
    }

    /// Admission flow of one source on one link.
    async fn run_flow(self, source_id: String, mut handoffs: mpsc::Receiver<Handoff>, cancel: CancellationToken) {
        loop {
            let handoff = tokio::select! {
                _ = cancel.cancelled() => break,
                handoff = handoffs.recv() => match handoff {
                    Some(handoff) => handoff,
                    None => return,
                },
            };
            let result = match handoff {
                Handoff::EndOfStream => self.router.end_of_stream(&source_id),
                Handoff::Frame(frame) => tokio::select! {
                    _ = cancel.cancelled() => Err(TransportError::Shutdown),
                    admitted = self.router.admit(frame) => admitted.map(|_| ()),
                },
            };
            if matches!(result, Err(TransportError::Shutdown)) {
                self.counters.record_discarded(1);
            }
            self.record(&result);
        }

        handoffs.close();
        let mut lost = 0usize;
        while let Ok(handoff) = handoffs.try_recv() {
            if matches!(handoff, Handoff::Frame(_)) {
                lost += 1;
            }
        }
        if lost > 0 {
            debug!(endpoint = self.router.endpoint(), source_id = %source_id, lost, "Hand-off cut short");
            self.counters.record_discarded(lost);
        }
    }
}

/// Per-source admission flows of one link.
struct LaneFlows {
    admitter: Admitter,
    depth: usize,
    senders: HashMap<String, mpsc::Sender<Handoff>>,
    tasks: JoinSet<()>,
}

impl LaneFlows {
    fn new(admitter: Admitter, depth: usize) -> Self {
        Self { admitter, depth: depth.max(1), senders: HashMap::new(), tasks: JoinSet::new() }
    }

    fn sender(&mut self, source_id: &str, cancel: &CancellationToken) -> mpsc::Sender<Handoff> {
        if let Some(sender) = self.senders.get(source_id) {
            return sender.clone();
        }
        let (sender, receiver) = mpsc::channel(self.depth);
        self.tasks.spawn(self.admitter.clone().run_flow(source_id.to_string(), receiver, cancel.clone()));
        self.senders.insert(source_id.to_string(), sender.clone());
        sender
    }

    /// Queue one decoded message on its source's flow. `false` once the link should stop.
    async fn hand_off(&mut self, message: WireMessage, cancel: &CancellationToken) -> bool {
        let (source_id, handoff) = match message {
            WireMessage::Frame(frame) => (frame.source_id().to_string(), Handoff::Frame(frame)),
            WireMessage::EndOfStream { source_id } => (source_id, Handoff::EndOfStream),
        };
        if !self.admitter.router.filter().matches(&source_id) {
            self.admitter.record(&Err(TransportError::FilterRejected { source_id }));
            return true;
        }

        let is_frame = matches!(handoff, Handoff::Frame(_));
        let sender = self.sender(&source_id, cancel);
        match sender.try_send(handoff) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(handoff)) => {
                debug!(endpoint = self.admitter.router.endpoint(), source_id = %source_id, "Hand-off full, pausing link");
                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = sender.send(handoff) => sent.is_ok(),
                };
                if !sent && is_frame {
                    self.admitter.counters.record_discarded(1);
                }
                sent
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if is_frame {
                    self.admitter.counters.record_discarded(1);
                }
                false
            }
        }
    }

    /// Let every flow admit what it was handed, then wait for it to end.
    async fn finish(mut self) {
        self.senders.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(endpoint = self.admitter.router.endpoint(), "Admission flow failed: {}", e);
            }
        }
    }
}

/// Serves the links of one ingress endpoint.
pub(crate) struct IngressHandler {
    admitter: Admitter,
    acknowledges: bool,
    handoff_depth: usize,
}

impl IngressHandler {
    pub fn new(
        router: Arc<SourceRouter>,
        counters: Arc<EndpointCounters>,
        acknowledges: bool,
        handoff_depth: usize,
    ) -> Self {
        Self { admitter: Admitter { router, counters }, acknowledges, handoff_depth }
    }
}

#[async_trait::async_trait]
impl LinkHandler for IngressHandler {
    async fn serve(&self, mut link: Link, cancel: CancellationToken) {
        let mut flows = LaneFlows::new(self.admitter.clone(), self.handoff_depth);
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = link.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            match packet {
                Packet::Data { id, want_ack: true, body } if self.acknowledges => {
                    let status = self.admitter.admit_now(&body);
                    if link.send(Packet::Ack { id, status }).await.is_err() {
                        break;
                    }
                }
                Packet::Data { body, .. } => {
                    let Some(message) = self.admitter.decode(&body) else {
                        continue;
                    };
                    if !flows.hand_off(message, &cancel).await {
                        break;
                    }
                }
                Packet::Ack { id, .. } => trace!(peer = %link.peer(), id, "Ignoring ack on ingress link"),
            }
        }
        flows.finish().await;
    }
}
