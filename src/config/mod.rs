//! Transport configuration.
//!
//! [`TransportConfig`] is the supervisor's input: ingress and egress endpoints plus
//! the timing knobs of the runtime. It deserializes from YAML with a default for
//! every optional key; durations are integer milliseconds under `*_ms` keys.
//!
//! ```rust
//! use framelane::config::TransportConfig;
//!
//! let config = TransportConfig::from_yaml_str(
//!     "
//! ingress:
//!   - addresses: tcp://*:5555
//!     role: bind
//!     pattern: router
//!     source_id_prefix: cam
//! lane_idle_timeout_ms: 30000
//! ",
//! )
//! .unwrap();
//!
//! assert_eq!(config.ingress.len(), 1);
//! assert_eq!(config.lane_idle_timeout().as_secs(), 30);
//! ```

mod address;
mod endpoint;
mod params;

pub use address::Address;
pub use endpoint::{DEFAULT_QUEUE_MAX_SIZE, EndpointSpec, SourceFilter};
pub use params::{DefaultsSource, EnvSource, MapSource, ParameterResolver, ParameterSource};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::Direction;
use crate::{Result, TransportError};

/// Bounded exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_ms: 100, max_ms: 5_000, multiplier: 2.0 }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let millis = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Runtime configuration of a transport supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoints feeding lanes (router, sub, pull).
    pub ingress: Vec<EndpointSpec>,
    /// Endpoints emitting frames (dealer, pub, push).
    pub egress: Vec<EndpointSpec>,
    /// How long a dealer waits for the router's acknowledgement.
    pub ack_timeout_ms: u64,
    /// Delay before a dealer resends a frame the router answered busy.
    pub busy_retry_ms: u64,
    pub reconnect: BackoffConfig,
    pub health_interval_ms: u64,
    /// Time allowed for draining queues on shutdown.
    pub shutdown_grace_ms: u64,
    /// Lanes idle this long with an empty queue are reaped.
    pub lane_idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
    /// Packets buffered per link in each direction.
    pub link_buffer: usize,
    /// Throughput is logged every this many frames per lane (0 disables).
    pub fps_period_frames: u64,
    /// Throughput is logged at least this often per lane (0 disables).
    pub fps_period_ms: u64,
    /// Parameter source names, highest priority first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolution_order: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ingress: Vec::new(),
            egress: Vec::new(),
            ack_timeout_ms: 5_000,
            busy_retry_ms: 10,
            reconnect: BackoffConfig::default(),
            health_interval_ms: 5_000,
            shutdown_grace_ms: 2_000,
            lane_idle_timeout_ms: 60_000,
            reap_interval_ms: 1_000,
            link_buffer: 64,
            fps_period_frames: 1_000,
            fps_period_ms: 10_000,
            resolution_order: Vec::new(),
        }
    }
}

impl TransportConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: TransportConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| TransportError::config(format!("transport YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| TransportError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn with_ingress(mut self, spec: EndpointSpec) -> Self {
        self.ingress.push(spec);
        self
    }

    pub fn with_egress(mut self, spec: EndpointSpec) -> Self {
        self.egress.push(spec);
        self
    }

    /// Check every endpoint against its declared direction and the timing values.
    pub fn validate(&self) -> Result<()> {
        for spec in &self.ingress {
            spec.validate_for(Direction::Ingress)?;
        }
        for spec in &self.egress {
            spec.validate_for(Direction::Egress)?;
        }
        if self.link_buffer == 0 {
            return Err(TransportError::config("link_buffer must be positive"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(TransportError::config("ack_timeout_ms must be positive"));
        }
        if self.reconnect.initial_ms == 0 || self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(TransportError::config("reconnect backoff needs 0 < initial_ms <= max_ms"));
        }
        Ok(())
    }

    /// Apply `resolution_order` to a resolver.
    pub fn order_parameters(&self, resolver: ParameterResolver) -> Result<ParameterResolver> {
        if self.resolution_order.is_empty() {
            Ok(resolver)
        } else {
            resolver.with_order(&self.resolution_order)
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn busy_retry(&self) -> Duration {
        Duration::from_millis(self.busy_retry_ms.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn lane_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.lane_idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }

    pub fn fps_period(&self) -> Option<Duration> {
        (self.fps_period_ms > 0).then(|| Duration::from_millis(self.fps_period_ms))
    }
}
