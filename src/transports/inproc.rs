//! In-process transport

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Address;
use crate::link::Link;
use crate::transport::{Acceptor, Transport};
use crate::{Result, TransportError};

const BACKLOG: usize = 16;

/// Registry of bound `inproc://` names, owned by one transport context.
#[derive(Default)]
pub struct InprocHub {
    bound: Arc<Mutex<HashMap<String, mpsc::Sender<Link>>>>,
}

impl InprocHub {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<Link>>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names currently bound.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn name(address: &Address) -> Result<&str> {
        match address {
            Address::Inproc(name) => Ok(name),
            other => Err(TransportError::config(format!("{} is not an inproc address", other))),
        }
    }
}

#[async_trait::async_trait]
impl Transport for InprocHub {
    async fn listen(&self, address: &Address, _buffer: usize) -> Result<Box<dyn Acceptor>> {
        let name = Self::name(address)?;
        let mut bound = self.lock();
        if bound.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::io(
                format!("binding {}", address),
                std::io::Error::from(std::io::ErrorKind::AddrInUse),
            ));
        }
        let (tx, rx) = mpsc::channel(BACKLOG);
        bound.insert(name.to_string(), tx);
        debug!("Bound {}", address);
        Ok(Box::new(InprocAcceptor { name: name.to_string(), rx, hub: Arc::downgrade(&self.bound) }))
    }

    async fn dial(&self, address: &Address, buffer: usize) -> Result<Link> {
        let name = Self::name(address)?;
        let acceptor = self
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::disconnected(address.to_string(), "no such inproc endpoint"))?;

        let (client, server) = Link::pair(format!("{} client", address), address.to_string(), buffer);
        acceptor
            .send(server)
            .await
            .map_err(|_| TransportError::disconnected(address.to_string(), "inproc endpoint closed"))?;
        Ok(client)
    }
}

struct InprocAcceptor {
    name: String,
    rx: mpsc::Receiver<Link>,
    hub: Weak<Mutex<HashMap<String, mpsc::Sender<Link>>>>,
}

#[async_trait::async_trait]
impl Acceptor for InprocAcceptor {
    async fn accept(&mut self) -> Result<Link> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| TransportError::disconnected(format!("inproc://{}", self.name), "acceptor closed"))
    }

    fn local_address(&self) -> String {
        format!("inproc://{}", self.name)
    }
}

impl Drop for InprocAcceptor {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(hub) = self.hub.upgrade() {
            let mut bound = hub.lock().unwrap_or_else(PoisonError::into_inner);
            if bound.get(&self.name).is_some_and(mpsc::Sender::is_closed) {
                bound.remove(&self.name);
            }
        }
    }
}
