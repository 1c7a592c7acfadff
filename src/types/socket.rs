//! Socket roles, patterns and admission policies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TransportError;

/// Whether this process owns the address or attaches to one owned elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketRole {
    Bind,
    Connect,
}

impl SocketRole {
    /// Map the adapter convention of a boolean `bind` flag.
    pub fn from_bind_flag(bind: bool) -> Self {
        if bind { SocketRole::Bind } else { SocketRole::Connect }
    }
}

/// Direction of traffic through an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Network to pipeline.
    Ingress,
    /// Pipeline to network.
    Egress,
}

/// Socket pattern governing delivery semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketPattern {
    /// Receives from addressable peers and acknowledges every message.
    Router,
    /// Sends one message at a time and waits for the router's ack.
    Dealer,
    /// Broadcasts to every peer, never waits.
    Pub,
    /// Receives broadcasts.
    Sub,
    /// Distributes messages round-robin over peers.
    Push,
    /// Receives distributed messages.
    Pull,
}

impl SocketPattern {
    pub fn direction(self) -> Direction {
        match self {
            SocketPattern::Router | SocketPattern::Sub | SocketPattern::Pull => Direction::Ingress,
            SocketPattern::Dealer | SocketPattern::Pub | SocketPattern::Push => Direction::Egress,
        }
    }

    /// Whether the sender can be stalled by the receiver.
    pub fn has_sender_flow_control(self) -> bool {
        !matches!(self, SocketPattern::Pub | SocketPattern::Sub)
    }

    /// Whether messages are individually acknowledged.
    pub fn acknowledges(self) -> bool {
        matches!(self, SocketPattern::Router | SocketPattern::Dealer)
    }

    /// Admission policy used when an endpoint does not configure one.
    pub fn default_admission(self) -> AdmissionPolicy {
        if self.has_sender_flow_control() {
            AdmissionPolicy::Block
        } else {
            AdmissionPolicy::DropOldest
        }
    }

    /// The pattern expected on the other side of a link.
    pub fn peer(self) -> SocketPattern {
        match self {
            SocketPattern::Router => SocketPattern::Dealer,
            SocketPattern::Dealer => SocketPattern::Router,
            SocketPattern::Pub => SocketPattern::Sub,
            SocketPattern::Sub => SocketPattern::Pub,
            SocketPattern::Push => SocketPattern::Pull,
            SocketPattern::Pull => SocketPattern::Push,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SocketPattern::Router => "router",
            SocketPattern::Dealer => "dealer",
            SocketPattern::Pub => "pub",
            SocketPattern::Sub => "sub",
            SocketPattern::Push => "push",
            SocketPattern::Pull => "pull",
        }
    }
}

impl fmt::Display for SocketPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketPattern {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "router" => Ok(SocketPattern::Router),
            "dealer" => Ok(SocketPattern::Dealer),
            "pub" => Ok(SocketPattern::Pub),
            "sub" => Ok(SocketPattern::Sub),
            "push" => Ok(SocketPattern::Push),
            "pull" => Ok(SocketPattern::Pull),
            other => Err(TransportError::config(format!("unknown socket pattern '{}'", other))),
        }
    }
}

/// What a full queue does with a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Suspend the producer until space frees.
    Block,
    /// Discard the oldest queued message to admit the newest.
    DropOldest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_parse_case_insensitively() {
        assert_eq!("DEALER".parse::<SocketPattern>().unwrap(), SocketPattern::Dealer);
        assert_eq!(" sub ".parse::<SocketPattern>().unwrap(), SocketPattern::Sub);
        assert!(matches!(
            "req".parse::<SocketPattern>(),
            Err(TransportError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn default_admission_follows_flow_control() {
        assert_eq!(SocketPattern::Sub.default_admission(), AdmissionPolicy::DropOldest);
        assert_eq!(SocketPattern::Pub.default_admission(), AdmissionPolicy::DropOldest);
        assert_eq!(SocketPattern::Router.default_admission(), AdmissionPolicy::Block);
        assert_eq!(SocketPattern::Pull.default_admission(), AdmissionPolicy::Block);
    }

    #[test]
    fn peers_are_symmetric_and_cross_direction() {
        for pattern in [
            SocketPattern::Router,
            SocketPattern::Dealer,
            SocketPattern::Pub,
            SocketPattern::Sub,
            SocketPattern::Push,
            SocketPattern::Pull,
        ] {
            assert_eq!(pattern.peer().peer(), pattern);
            assert_ne!(pattern.peer().direction(), pattern.direction());
        }
    }
}
