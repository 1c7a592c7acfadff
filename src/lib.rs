//! Per-source video frame exchange over message-queue style sockets.
//!
//! Framelane moves encoded video frames between pipeline stages. Producers publish
//! [`FrameMessage`]s on egress endpoints; ingress endpoints demultiplex what arrives
//! into one bounded, ordered lane per source, which consumers drain independently.
//!
//! # Features
//!
//! - **Socket patterns**: router/dealer with acknowledgements, pub/sub fan-out,
//!   push/pull load distribution
//! - **Transports**: `tcp://`, `ipc://` (Unix domain sockets) and `inproc://`
//! - **Per-source lanes**: source filters, duplicate and stale frame rejection,
//!   blocking or drop-oldest backpressure without head-of-line blocking across sources
//! - **Operations**: reconnect with bounded backoff, health reports and events,
//!   ordered idempotent shutdown
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use framelane::{FrameMessage, TransportConfig, TransportSupervisor};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransportConfig::from_yaml_str(
//!         "
//! ingress:
//!   - addresses: tcp://*:5555
//!     role: bind
//!     pattern: router
//! ",
//!     )?;
//!     let transport = TransportSupervisor::start(config).await?;
//!
//!     while let Some(frame) = transport.poll("cam1", Duration::from_secs(1)).await? {
//!         println!("{} #{} {}x{}", frame.source_id(), frame.frame_id(), frame.width(), frame.height());
//!     }
//!
//!     transport.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Wire format
pub mod codec;
pub mod link;

// Configuration and observability
pub mod config;
pub mod logging;
pub mod metrics;

// Lanes
pub mod queue;
pub mod router;

// Links and endpoints
pub mod driver;
pub mod endpoint;
pub mod supervisor;
pub mod transport;
pub mod transports;

// Core exports
pub use error::*;
pub use types::*;

pub use codec::{WireMessage, decode, decode_envelope, encode};
pub use config::{Address, EndpointSpec, SourceFilter, TransportConfig};
pub use endpoint::{Ack, EndpointBinding};
pub use link::AckStatus;
pub use metrics::{HealthEvent, HealthReport, MetricsSnapshot};
pub use supervisor::{ShutdownHandle, TransportSupervisor};
pub use transport::TransportContext;
