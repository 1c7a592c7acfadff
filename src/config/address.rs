//! Endpoint address parsing

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Result, TransportError};

/// A single transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// `tcp://host:port`; host `*` binds every interface.
    Tcp { host: String, port: u16 },
    /// `ipc:///absolute/path` Unix domain socket.
    Ipc(PathBuf),
    /// `inproc://name`, resolved through the supervisor's transport context.
    Inproc(String),
}

impl Address {
    pub fn scheme(&self) -> &'static str {
        match self {
            Address::Tcp { .. } => "tcp",
            Address::Ipc(_) => "ipc",
            Address::Inproc(_) => "inproc",
        }
    }

    /// `host:port` suitable for socket resolution, with `*` mapped to the unspecified address.
    pub fn socket_target(&self) -> Option<String> {
        match self {
            Address::Tcp { host, port } if host == "*" => Some(format!("0.0.0.0:{}", port)),
            Address::Tcp { host, port } => Some(format!("{}:{}", host, port)),
            _ => None,
        }
    }

    /// Whether the address only makes sense for a binding socket.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Address::Tcp { host, .. } if host == "*")
    }

    /// Parse a comma-separated address list.
    pub fn parse_list(list: &str) -> Result<Vec<Address>> {
        let addresses = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Address::from_str)
            .collect::<Result<Vec<_>>>()?;
        if addresses.is_empty() {
            return Err(TransportError::config("endpoint has no addresses"));
        }
        Ok(addresses)
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| TransportError::config(format!("address '{}' has no scheme", s)))?;

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| TransportError::config(format!("tcp address '{}' has no port", s)))?;
                if host.is_empty() {
                    return Err(TransportError::config(format!("tcp address '{}' has no host", s)));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|e| TransportError::config(format!("tcp address '{}': bad port: {}", s, e)))?;
                Ok(Address::Tcp { host: host.to_string(), port })
            }
            "ipc" => {
                if !rest.starts_with('/') {
                    return Err(TransportError::config(format!(
                        "ipc address '{}' must name an absolute path",
                        s
                    )));
                }
                Ok(Address::Ipc(PathBuf::from(rest)))
            }
            "inproc" => {
                if rest.is_empty() {
                    return Err(TransportError::config("inproc address has an empty name"));
                }
                Ok(Address::Inproc(rest.to_string()))
            }
            other => Err(TransportError::config(format!("unsupported address scheme '{}'", other))),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Address::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Address::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Accepts either `"a, b"` or `[a, b]`.
pub(crate) fn deserialize_address_list<'de, D>(deserializer: D) -> std::result::Result<Vec<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let joined = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(list) => list,
        OneOrMany::Many(items) => items.join(","),
    };
    Address::parse_list(&joined).map_err(serde::de::Error::custom)
}
