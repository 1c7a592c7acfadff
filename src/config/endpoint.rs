//! Endpoint descriptions and source filters

use serde::{Deserialize, Serialize};

use super::address::{Address, deserialize_address_list};
use super::params::ParameterResolver;
use crate::types::{AdmissionPolicy, Direction, SocketPattern, SocketRole};
use crate::{Result, TransportError};

/// Lane capacity when an endpoint does not set `queue_max_size`.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 100;

fn default_queue_max_size() -> usize {
    DEFAULT_QUEUE_MAX_SIZE
}

/// Exact and prefix source-id filters of an ingress endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id_prefix: Option<String>,
}

impl SourceFilter {
    pub fn exact(source_id: impl Into<String>) -> Self {
        Self { source_id: Some(source_id.into()), source_id_prefix: None }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self { source_id: None, source_id_prefix: Some(prefix.into()) }
    }

    pub fn is_empty(&self) -> bool {
        self.source_id.is_none() && self.source_id_prefix.is_none()
    }

    /// Exact match first, then prefix. No filters admits everything.
    pub fn matches(&self, source_id: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        if self.source_id.as_deref() == Some(source_id) {
            return true;
        }
        matches!(&self.source_id_prefix, Some(prefix) if source_id.starts_with(prefix.as_str()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_id.as_deref() == Some("") {
            return Err(TransportError::config("source_id filter must not be empty"));
        }
        if self.source_id_prefix.as_deref() == Some("") {
            return Err(TransportError::config("source_id_prefix filter must not be empty"));
        }
        if let (Some(exact), Some(prefix)) = (&self.source_id, &self.source_id_prefix) {
            if !exact.starts_with(prefix.as_str()) {
                return Err(TransportError::config(format!(
                    "source_id '{}' conflicts with source_id_prefix '{}'",
                    exact, prefix
                )));
            }
        }
        Ok(())
    }
}

/// Addresses plus role and pattern of one logical endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Label used in logs and metrics; defaults to the first address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(deserialize_with = "deserialize_address_list")]
    pub addresses: Vec<Address>,
    pub role: SocketRole,
    pub pattern: SocketPattern,
    #[serde(flatten)]
    pub filter: SourceFilter,
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    /// Overrides the pattern's default admission policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionPolicy>,
}

impl EndpointSpec {
    /// Build an endpoint from a comma-separated address list.
    pub fn new(pattern: SocketPattern, role: SocketRole, addresses: &str) -> Result<Self> {
        Ok(Self {
            name: None,
            addresses: Address::parse_list(addresses)?,
            role,
            pattern,
            filter: SourceFilter::default(),
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            admission: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_queue_max_size(mut self, size: usize) -> Self {
        self.queue_max_size = size;
        self
    }

    pub fn with_admission(mut self, policy: AdmissionPolicy) -> Self {
        self.admission = Some(policy);
        self
    }

    /// Build from the adapter parameter keys: `zmq_endpoint`, `zmq_type`, `zmq_bind`,
    /// `source_id`, `source_id_prefix` and `queue_max_size`.
    pub fn from_parameters(params: &ParameterResolver) -> Result<Self> {
        let endpoint = params.require("zmq_endpoint")?;
        let pattern: SocketPattern = params.require("zmq_type")?.parse()?;
        let role = SocketRole::from_bind_flag(params.get_bool("zmq_bind")?.unwrap_or(false));

        let filter = SourceFilter {
            source_id: params.get("source_id").filter(|s| !s.trim().is_empty()),
            source_id_prefix: params.get("source_id_prefix").filter(|s| !s.trim().is_empty()),
        };
        let queue_max_size = params.get_parsed::<usize>("queue_max_size")?.unwrap_or(DEFAULT_QUEUE_MAX_SIZE);

        let spec = EndpointSpec::new(pattern, role, &endpoint)?
            .with_filter(filter)
            .with_queue_max_size(queue_max_size);
        spec.validate()?;
        Ok(spec)
    }

    pub fn label(&self) -> String {
        match (&self.name, self.addresses.first()) {
            (Some(name), _) => name.clone(),
            (None, Some(address)) => address.to_string(),
            (None, None) => self.pattern.to_string(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.pattern.direction()
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        self.admission.unwrap_or_else(|| self.pattern.default_admission())
    }

    /// Check addresses, filters, capacity and admission policy.
    pub fn validate(&self) -> Result<()> {
        let label = self.label();
        if self.addresses.is_empty() {
            return Err(TransportError::config(format!("endpoint {} has no addresses", label)));
        }
        if self.queue_max_size == 0 {
            return Err(TransportError::config(format!("endpoint {}: queue_max_size must be positive", label)));
        }
        if self.admission == Some(AdmissionPolicy::Block) && !self.pattern.has_sender_flow_control() {
            return Err(TransportError::config(format!(
                "endpoint {}: pattern '{}' has no sender flow control and cannot use blocking admission",
                label, self.pattern
            )));
        }
        self.filter.validate()?;
        if !self.filter.is_empty() && self.direction() == Direction::Egress {
            return Err(TransportError::config(format!(
                "endpoint {}: source filters only apply to ingress patterns",
                label
            )));
        }
        for address in &self.addresses {
            if address.is_wildcard() && self.role == SocketRole::Connect {
                return Err(TransportError::config(format!("cannot connect to wildcard address {}", address)));
            }
            if matches!(address, Address::Ipc(_)) && !cfg!(unix) {
                return Err(TransportError::config(format!("{} requires Unix domain sockets", address)));
            }
        }
        Ok(())
    }

    /// Validate and additionally require the given traffic direction.
    pub fn validate_for(&self, direction: Direction) -> Result<()> {
        self.validate()?;
        if self.direction() != direction {
            return Err(TransportError::config(format!(
                "endpoint {}: pattern '{}' cannot be used for {:?}",
                self.label(),
                self.pattern,
                direction
            )));
        }
        Ok(())
    }
}
