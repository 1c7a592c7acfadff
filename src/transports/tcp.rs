//! TCP transport

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::Address;
use crate::link::Link;
use crate::transport::{Acceptor, Transport};
use crate::{Result, TransportError};

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

fn target(address: &Address) -> Result<String> {
    address
        .socket_target()
        .ok_or_else(|| TransportError::config(format!("{} is not a tcp address", address)))
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, address: &Address, buffer: usize) -> Result<Box<dyn Acceptor>> {
        let target = target(address)?;
        let listener = TcpListener::bind(&target)
            .await
            .map_err(|e| TransportError::io(format!("binding {}", address), e))?;
        let local = listener.local_addr().map(|a| format!("tcp://{}", a)).unwrap_or_else(|_| address.to_string());
        info!("Listening on {}", local);
        Ok(Box::new(TcpAcceptor { listener, local, buffer }))
    }

    async fn dial(&self, address: &Address, buffer: usize) -> Result<Link> {
        let target = target(address)?;
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|e| TransportError::disconnected_with_source(address.to_string(), "connect failed", Box::new(e)))?;
        let _ = stream.set_nodelay(true);
        debug!("Connected to {}", address);
        Ok(Link::from_stream(stream, address.to_string(), buffer))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local: String,
    buffer: usize,
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Link> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::io(format!("accepting on {}", self.local), e))?;
        let _ = stream.set_nodelay(true);
        Ok(Link::from_stream(stream, format!("tcp://{}", peer), self.buffer))
    }

    fn local_address(&self) -> String {
        self.local.clone()
    }
}
