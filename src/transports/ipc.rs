//! Unix domain socket transport

use crate::config::Address;
use crate::link::Link;
use crate::transport::{Acceptor, Transport};
use crate::{Result, TransportError};

#[derive(Debug, Clone, Copy, Default)]
pub struct IpcTransport;

#[cfg(unix)]
mod unix {
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};
    use tracing::{debug, info, warn};

    use super::*;

    pub(super) fn path(address: &Address) -> Result<&Path> {
        match address {
            Address::Ipc(path) => Ok(path),
            other => Err(TransportError::config(format!("{} is not an ipc address", other))),
        }
    }

    pub(super) async fn listen(address: &Address, buffer: usize) -> Result<Box<dyn Acceptor>> {
        let path = path(address)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TransportError::io(format!("creating {}", parent.display()), e))?;
        }
        // A socket file left by a crashed owner blocks bind; a live owner still answers.
        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(TransportError::io(
                    format!("binding {}", address),
                    std::io::Error::from(std::io::ErrorKind::AddrInUse),
                ));
            }
            warn!("Removing stale socket {}", path.display());
            let _ = std::fs::remove_file(path);
        }
        let listener =
            UnixListener::bind(path).map_err(|e| TransportError::io(format!("binding {}", address), e))?;
        info!("Listening on {}", address);
        Ok(Box::new(IpcAcceptor { listener, path: path.to_path_buf(), label: address.to_string(), buffer }))
    }

    pub(super) async fn dial(address: &Address, buffer: usize) -> Result<Link> {
        let path = path(address)?;
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| TransportError::disconnected_with_source(address.to_string(), "connect failed", Box::new(e)))?;
        debug!("Connected to {}", address);
        Ok(Link::from_stream(stream, address.to_string(), buffer))
    }

    struct IpcAcceptor {
        listener: UnixListener,
        path: PathBuf,
        label: String,
        buffer: usize,
    }

    #[async_trait::async_trait]
    impl Acceptor for IpcAcceptor {
        async fn accept(&mut self) -> Result<Link> {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| TransportError::io(format!("accepting on {}", self.label), e))?;
            Ok(Link::from_stream(stream, format!("{} peer", self.label), self.buffer))
        }

        fn local_address(&self) -> String {
            self.label.clone()
        }
    }

    impl Drop for IpcAcceptor {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait::async_trait]
impl Transport for IpcTransport {
    async fn listen(&self, address: &Address, buffer: usize) -> Result<Box<dyn Acceptor>> {
        #[cfg(unix)]
        {
            unix::listen(address, buffer).await
        }
        #[cfg(not(unix))]
        {
            let _ = buffer;
            Err(TransportError::config(format!("{} requires Unix domain sockets", address)))
        }
    }

    async fn dial(&self, address: &Address, buffer: usize) -> Result<Link> {
        #[cfg(unix)]
        {
            unix::dial(address, buffer).await
        }
        #[cfg(not(unix))]
        {
            let _ = buffer;
            Err(TransportError::config(format!("{} requires Unix domain sockets", address)))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::link::{AckStatus, Packet};

    #[tokio::test]
    async fn socket_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("input-video.ipc");
        let address = Address::Ipc(path.clone());

        let mut acceptor = IpcTransport.listen(&address, 4).await.unwrap();
        assert!(path.exists());

        let client = IpcTransport.dial(&address, 4).await.unwrap();
        let mut server = acceptor.accept().await.unwrap();
        client.send(Packet::Ack { id: 1, status: AckStatus::Admitted }).await.unwrap();
        assert!(server.recv().await.is_some());

        assert!(IpcTransport.listen(&address, 4).await.is_err(), "live owner keeps the address");

        drop(acceptor);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.ipc");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let address = Address::Ipc(path);
        assert!(IpcTransport.listen(&address, 4).await.is_ok());
    }

    #[tokio::test]
    async fn dialing_without_owner_is_a_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::Ipc(dir.path().join("absent.ipc"));
        assert!(matches!(
            IpcTransport.dial(&address, 4).await,
            Err(TransportError::EndpointDisconnected { .. })
        ));
    }
}
