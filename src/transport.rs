//! Transport trait for link-producing address schemes

use std::sync::Arc;

use crate::config::Address;
use crate::link::Link;
use crate::transports::{InprocHub, IpcTransport, TcpTransport};
use crate::Result;

/// Trait for address schemes that produce links
///
/// Transports abstract over TCP, Unix domain sockets and in-process channels.
/// Binding yields an [`Acceptor`] that hands out one link per connecting peer;
/// dialing yields a single link to the peer that owns the address.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Take ownership of `address` and start accepting peers.
    async fn listen(&self, address: &Address, buffer: usize) -> Result<Box<dyn Acceptor>>;

    /// Attach to `address`, owned elsewhere.
    ///
    /// Fails with `EndpointDisconnected` when nobody is listening yet; callers retry
    /// with backoff.
    async fn dial(&self, address: &Address, buffer: usize) -> Result<Link>;
}

/// Source of inbound links for a bound address.
#[async_trait::async_trait]
pub trait Acceptor: Send + 'static {
    /// Wait for the next peer.
    ///
    /// Returns:
    /// - `Ok(link)` - a peer connected
    /// - `Err(e)` - accepting failed; the acceptor may still be usable
    async fn accept(&mut self) -> Result<Link>;

    /// Address actually bound, e.g. with an ephemeral TCP port resolved.
    fn local_address(&self) -> String;
}

/// Transports available to one supervisor.
///
/// The in-process hub lives here rather than in a process-wide registry, so two
/// supervisors never see each other's `inproc://` names unless they share a context.
#[derive(Clone, Default)]
pub struct TransportContext {
    inproc: Arc<InprocHub>,
}

impl TransportContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inproc(&self) -> &InprocHub {
        &self.inproc
    }

    /// Transport serving `address`'s scheme.
    pub fn transport_for(&self, address: &Address) -> Arc<dyn Transport> {
        match address {
            Address::Tcp { .. } => Arc::new(TcpTransport),
            Address::Ipc(_) => Arc::new(IpcTransport),
            Address::Inproc(_) => Arc::clone(&self.inproc) as Arc<dyn Transport>,
        }
    }

    pub async fn listen(&self, address: &Address, buffer: usize) -> Result<Box<dyn Acceptor>> {
        self.transport_for(address).listen(address, buffer).await
    }

    pub async fn dial(&self, address: &Address, buffer: usize) -> Result<Link> {
        self.transport_for(address).dial(address, buffer).await
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext").field("inproc", &self.inproc.names()).finish()
    }
}
