//! Links: one connected peer of an endpoint
//!
//! A [`Link`] is a pair of packet channels plus a close signal, whatever carries it.
//! Stream transports (TCP, Unix sockets) are adapted by two pump tasks that move
//! length-delimited packets between the socket and the channels; in-process links
//! are bare channel pairs.
//!
//! Packet layout: `[type u8][id u64 LE]` followed by the envelope for data packets
//! or a status byte for acks.
//!
//! Dropping a stream link aborts it, losing whatever the writer had not yet put on
//! the socket. [`Link::flush`] writes the backlog out first and reports what could
//! not be written before the linger period ended.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::DecodeError;
use crate::codec::MAX_FIELD_LEN;
use crate::{Result, TransportError};

const PACKET_DATA_ACK: u8 = 0;
const PACKET_DATA: u8 = 1;
const PACKET_ACK: u8 = 2;
const PACKET_HEADER_LEN: usize = 9;

/// Largest packet a stream link accepts.
pub const MAX_PACKET_LEN: usize = 256 * 1024 * 1024;

/// Receiver's verdict on one data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckStatus {
    Admitted = 0,
    /// Already sequenced; the frame was delivered once before.
    Duplicate = 1,
    FilterRejected = 2,
    DecodeFailed = 3,
    ShuttingDown = 4,
    /// The source's lane is full; resend the same message later.
    Busy = 5,
}

impl AckStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AckStatus::Admitted),
            1 => Some(AckStatus::Duplicate),
            2 => Some(AckStatus::FilterRejected),
            3 => Some(AckStatus::DecodeFailed),
            4 => Some(AckStatus::ShuttingDown),
            5 => Some(AckStatus::Busy),
            _ => None,
        }
    }

    /// Whether the sender may consider the message delivered.
    pub fn is_delivered(self) -> bool {
        matches!(self, AckStatus::Admitted | AckStatus::Duplicate)
    }

    /// Status for the outcome of handling an ingress message.
    pub fn from_outcome<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => AckStatus::Admitted,
            Err(TransportError::DuplicateOrStale { .. }) => AckStatus::Duplicate,
            Err(TransportError::FilterRejected { .. }) => AckStatus::FilterRejected,
            Err(TransportError::Decode(_)) => AckStatus::DecodeFailed,
            Err(TransportError::QueueFull { .. }) => AckStatus::Busy,
            Err(_) => AckStatus::ShuttingDown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Admitted => "admitted",
            AckStatus::Duplicate => "duplicate",
            AckStatus::FilterRejected => "filter-rejected",
            AckStatus::DecodeFailed => "decode-failed",
            AckStatus::ShuttingDown => "shutting-down",
            AckStatus::Busy => "busy",
        }
    }
}

/// Unit carried by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data { id: u64, want_ack: bool, body: Bytes },
    Ack { id: u64, status: AckStatus },
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        match self {
            Packet::Data { id, want_ack, body } => {
                let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + body.len());
                buf.put_u8(if *want_ack { PACKET_DATA_ACK } else { PACKET_DATA });
                buf.put_u64_le(*id);
                buf.extend_from_slice(body);
                buf.freeze()
            }
            Packet::Ack { id, status } => {
                let mut buf = BytesMut::with_capacity(PACKET_HEADER_LEN + 1);
                buf.put_u8(PACKET_ACK);
                buf.put_u64_le(*id);
                buf.put_u8(*status as u8);
                buf.freeze()
            }
        }
    }

    pub fn decode(mut raw: Bytes) -> std::result::Result<Packet, DecodeError> {
        if raw.len() < PACKET_HEADER_LEN {
            return Err(DecodeError::Truncated { offset: 0, needed: PACKET_HEADER_LEN, available: raw.len() });
        }
        let header = raw.split_to(PACKET_HEADER_LEN);
        let mut id = [0u8; 8];
        id.copy_from_slice(&header[1..PACKET_HEADER_LEN]);
        let id = u64::from_le_bytes(id);

        match header[0] {
            PACKET_DATA_ACK => Ok(Packet::Data { id, want_ack: true, body: raw }),
            PACKET_DATA => Ok(Packet::Data { id, want_ack: false, body: raw }),
            PACKET_ACK => {
                if raw.len() != 1 {
                    return Err(DecodeError::malformed(format!("ack packet with {} status bytes", raw.len())));
                }
                let status = AckStatus::from_u8(raw[0])
                    .ok_or_else(|| DecodeError::malformed(format!("unknown ack status {}", raw[0])))?;
                Ok(Packet::Ack { id, status })
            }
            other => Err(DecodeError::malformed(format!("unknown packet type {}", other))),
        }
    }
}

/// Writer-side state of a link carried by a byte stream.
struct StreamWriter {
    /// Asks the write pump to write its backlog and stop.
    finish: CancellationToken,
    /// Cancelled once the write pump has exited.
    flushed: CancellationToken,
    /// Data packets the write pump gave up on.
    unsent: Arc<AtomicUsize>,
}

/// One connected peer.
///
/// Dropping a link closes it; the peer observes the closure on its next receive.
pub struct Link {
    peer: String,
    tx: mpsc::Sender<Packet>,
    rx: mpsc::Receiver<Packet>,
    closed: CancellationToken,
    writer: Option<StreamWriter>,
}

impl Link {
    /// Connected pair of in-process links sharing one close signal.
    pub fn pair(a: impl Into<String>, b: impl Into<String>, buffer: usize) -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::channel(buffer.max(1));
        let (b_tx, a_rx) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();
        (
            Link { peer: b.into(), tx: a_tx, rx: a_rx, closed: closed.clone(), writer: None },
            Link { peer: a.into(), tx: b_tx, rx: b_rx, closed, writer: None },
        )
    }

    /// Adapt a byte stream into a link by spawning reader and writer pumps.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, buffer: usize) -> Link
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (in_tx, in_rx) = mpsc::channel(buffer.max(1));
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();

        let codec = || LengthDelimitedCodec::builder().max_frame_length(MAX_PACKET_LEN).new_codec();
        let reader = FramedRead::new(read_half, codec());
        let writer = FramedWrite::new(write_half, codec());

        let state = StreamWriter {
            finish: CancellationToken::new(),
            flushed: CancellationToken::new(),
            unsent: Arc::new(AtomicUsize::new(0)),
        };
        tokio::spawn(read_pump(reader, in_tx, closed.clone(), peer.clone()));
        tokio::spawn(
            WritePump {
                writer,
                out_rx,
                closed: closed.clone(),
                finish: state.finish.clone(),
                flushed: state.flushed.clone(),
                unsent: Arc::clone(&state.unsent),
                peer: peer.clone(),
            }
            .run(),
        );

        Link { peer, tx: out_tx, rx: in_rx, closed, writer: Some(state) }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Token cancelled when the link closes from either side.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::disconnected(&self.peer, "link closed"));
        }
        self.tx.send(packet).await.map_err(|_| TransportError::disconnected(&self.peer, "link closed"))
    }

    /// Send without waiting. `Ok(false)` means the peer's buffer is full.
    pub fn try_send(&self, packet: Packet) -> Result<bool> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::disconnected(&self.peer, "link closed"))
            }
        }
    }

    /// Write out every packet already handed to this link, then close it.
    ///
    /// Waits at most `linger`; packets still unwritten after that are dropped.
    /// Returns the number of data packets that never reached the socket. In-process
    /// links hand packets straight to the peer and always return zero.
    pub async fn flush(&self, linger: Duration) -> usize {
        let Some(state) = &self.writer else {
            return 0;
        };
        state.finish.cancel();
        if tokio::time::timeout(linger, state.flushed.cancelled()).await.is_err() {
            debug!(peer = %self.peer, ?linger, "link did not flush in time, aborting");
            self.closed.cancel();
            state.flushed.cancelled().await;
        }
        state.unsent.load(Ordering::Acquire)
    }

    /// Next packet from the peer, or `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        tokio::select! {
            packet = self.rx.recv() => packet,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).field("closed", &self.is_closed()).finish()
    }
}

async fn read_pump<R>(
    mut reader: FramedRead<R, LengthDelimitedCodec>,
    in_tx: mpsc::Sender<Packet>,
    closed: CancellationToken,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(raw)) => match Packet::decode(raw.freeze()) {
                Ok(packet) => {
                    let delivered = tokio::select! {
                        _ = closed.cancelled() => false,
                        sent = in_tx.send(packet) => sent.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
                Err(e) => warn!(peer = %peer, "dropping undecodable packet: {}", e),
            },
            Some(Err(e)) => {
                debug!(peer = %peer, "link read failed: {}", e);
                break;
            }
            None => {
                trace!(peer = %peer, "peer closed the stream");
                break;
            }
        }
    }
    closed.cancel();
}

struct WritePump<W> {
    writer: FramedWrite<W, LengthDelimitedCodec>,
    out_rx: mpsc::Receiver<Packet>,
    closed: CancellationToken,
    finish: CancellationToken,
    flushed: CancellationToken,
    unsent: Arc<AtomicUsize>,
    peer: String,
}

impl<W: AsyncWrite + Unpin> WritePump<W> {
    async fn run(mut self) {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                packet = self.out_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = self.finish.cancelled() => match self.out_rx.try_recv() {
                    Ok(packet) => packet,
                    Err(_) => break,
                },
            };
            if !self.write(packet).await {
                break;
            }
        }

        self.out_rx.close();
        let mut unsent = 0usize;
        while let Ok(packet) = self.out_rx.try_recv() {
            if matches!(packet, Packet::Data { .. }) {
                unsent += 1;
            }
        }
        if unsent > 0 {
            warn!(peer = %self.peer, unsent, "link closed with packets still queued");
            self.unsent.fetch_add(unsent, Ordering::AcqRel);
        }

        if !self.closed.is_cancelled() {
            tokio::select! {
                _ = self.closed.cancelled() => {}
                _ = SinkExt::<Bytes>::close(&mut self.writer) => {}
            }
        }
        self.closed.cancel();
        self.flushed.cancel();
    }

    /// Put one packet on the socket. `false` once the link is unusable.
    async fn write(&mut self, packet: Packet) -> bool {
        let is_data = matches!(packet, Packet::Data { .. });
        let written = tokio::select! {
            _ = self.closed.cancelled() => Err(None),
            written = self.writer.send(packet.encode()) => written.map_err(Some),
        };
        match written {
            Ok(()) => true,
            Err(e) => {
                if let Some(e) = e {
                    debug!(peer = %self.peer, "link write failed: {}", e);
                }
                if is_data {
                    self.unsent.fetch_add(1, Ordering::AcqRel);
                }
                false
            }
        }
    }
}

/// Largest envelope that fits a packet.
pub(crate) fn check_packet_size(body: &Bytes) -> Result<()> {
    let limit = MAX_PACKET_LEN.min(MAX_FIELD_LEN) - PACKET_HEADER_LEN;
    if body.len() > limit {
        return Err(TransportError::InvalidMessage {
            field: "payload",
            details: format!("encoded message of {} bytes exceeds the {} byte packet limit", body.len(), limit),
        });
    }
    Ok(())
}
