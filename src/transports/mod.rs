//! Transport implementations
//!
//! - [`TcpTransport`]: `tcp://host:port`
//! - [`IpcTransport`]: `ipc:///path`, Unix domain sockets
//! - [`InprocHub`]: `inproc://name`, channel pairs within one process

mod inproc;
mod ipc;
mod tcp;

pub use inproc::InprocHub;
pub use ipc::IpcTransport;
pub use tcp::TcpTransport;
