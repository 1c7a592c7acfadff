//! Layered parameter lookup
//!
//! A [`ParameterResolver`] holds an ordered list of named [`ParameterSource`]s and
//! answers each key from the first source that has it. The order is data: it can be
//! rearranged by name with [`ParameterResolver::with_order`], typically from the
//! `resolution_order` configuration key.

use std::collections::HashMap;
use std::str::FromStr;

use crate::{Result, TransportError};

/// A named provider of string parameters.
pub trait ParameterSource: Send + Sync {
    fn name(&self) -> &str;

    /// Look up `key`, returning `None` when this source does not define it.
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment, with keys upper-cased behind an optional prefix.
///
/// `zmq_endpoint` under prefix `FRAMELANE_` reads `FRAMELANE_ZMQ_ENDPOINT`.
#[derive(Debug, Clone)]
pub struct EnvSource {
    name: String,
    prefix: String,
}

impl EnvSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { name: "env".to_string(), prefix: prefix.into() }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn variable_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_ascii_uppercase())
    }
}

impl ParameterSource for EnvSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<String> {
        std::env::var(self.variable_name(key)).ok()
    }
}

/// Fixed key/value pairs, e.g. a YAML file or literal overrides.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    name: String,
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), values: HashMap::new() }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Build from a flat YAML mapping. Scalars are stringified; nulls are skipped.
    pub fn from_yaml(name: impl Into<String>, yaml: &str) -> Result<Self> {
        let value: serde_yaml_ng::Value = serde_yaml_ng::from_str(yaml)
            .map_err(|e| TransportError::config(format!("parameter YAML: {}", e)))?;
        let mapping = match value {
            serde_yaml_ng::Value::Mapping(mapping) => mapping,
            serde_yaml_ng::Value::Null => serde_yaml_ng::Mapping::new(),
            _ => return Err(TransportError::config("parameter YAML must be a mapping")),
        };

        let mut source = MapSource::new(name);
        for (key, value) in mapping {
            let key = scalar_to_string(&key)
                .ok_or_else(|| TransportError::config("parameter keys must be scalars"))?;
            match value {
                serde_yaml_ng::Value::Null => {}
                serde_yaml_ng::Value::Sequence(items) => {
                    let joined = items.iter().filter_map(scalar_to_string).collect::<Vec<_>>().join(",");
                    source.values.insert(key, joined);
                }
                other => {
                    let value = scalar_to_string(&other).ok_or_else(|| {
                        TransportError::config(format!("parameter '{}' must be a scalar or list", key))
                    })?;
                    source.values.insert(key, value);
                }
            }
        }
        Ok(source)
    }
}

fn scalar_to_string(value: &serde_yaml_ng::Value) -> Option<String> {
    match value {
        serde_yaml_ng::Value::String(s) => Some(s.clone()),
        serde_yaml_ng::Value::Bool(b) => Some(b.to_string()),
        serde_yaml_ng::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ParameterSource for MapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Built-in fallbacks, always named `defaults`.
#[derive(Debug, Clone)]
pub struct DefaultsSource {
    values: MapSource,
}

impl DefaultsSource {
    /// Defaults for a source adapter feeding a module: connect a dealer to the
    /// module's IPC input socket.
    pub fn adapter() -> Self {
        Self {
            values: MapSource::new("defaults")
                .with("zmq_endpoint", "ipc:///tmp/zmq-sockets/input-video.ipc")
                .with("zmq_type", "dealer")
                .with("zmq_bind", "false")
                .with("queue_max_size", "100"),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values = self.values.with(key, value);
        self
    }
}

impl ParameterSource for DefaultsSource {
    fn name(&self) -> &str {
        "defaults"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key)
    }
}

/// First-present-wins lookup over ordered sources.
#[derive(Default)]
pub struct ParameterResolver {
    sources: Vec<Box<dyn ParameterSource>>,
}

impl ParameterResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source with lower priority than every source already added.
    pub fn with_source(mut self, source: impl ParameterSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Reorder sources by name. Sources not named keep their relative order after
    /// the named ones. Naming an unknown source is a configuration error.
    pub fn with_order<S: AsRef<str>>(mut self, order: &[S]) -> Result<Self> {
        let mut ordered = Vec::with_capacity(self.sources.len());
        for name in order {
            let name = name.as_ref();
            let index = self
                .sources
                .iter()
                .position(|source| source.name() == name)
                .ok_or_else(|| TransportError::config(format!("unknown parameter source '{}'", name)))?;
            ordered.push(self.sources.remove(index));
        }
        ordered.append(&mut self.sources);
        self.sources = ordered;
        Ok(self)
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lookup(key).map(|(_, value)| value)
    }

    /// Value plus the name of the source that supplied it.
    pub fn lookup(&self, key: &str) -> Option<(&str, String)> {
        self.sources.iter().find_map(|source| source.get(key).map(|value| (source.name(), value)))
    }

    /// Parse a present value, reporting which source held the bad value.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.lookup(key) {
            None => Ok(None),
            Some((source, raw)) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                TransportError::config(format!("parameter '{}' from {}: {}", key, source, e))
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.lookup(key) {
            None => Ok(None),
            Some((source, raw)) => parse_bool(&raw).map(Some).ok_or_else(|| {
                TransportError::config(format!("parameter '{}' from {}: '{}' is not a boolean", key, source, raw))
            }),
        }
    }

    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| TransportError::config(format!("required parameter '{}' is not set", key)))
    }
}

impl std::fmt::Debug for ParameterResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterResolver").field("sources", &self.source_names()).finish()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ParameterResolver {
        ParameterResolver::new()
            .with_source(MapSource::new("cli").with("zmq_type", "sub"))
            .with_source(MapSource::new("file").with("zmq_type", "router").with("source_id", "cam1"))
            .with_source(DefaultsSource::adapter())
    }

    #[test]
    fn first_present_wins() {
        let params = resolver();
        assert_eq!(params.lookup("zmq_type"), Some(("cli", "sub".to_string())));
        assert_eq!(params.lookup("source_id"), Some(("file", "cam1".to_string())));
        assert_eq!(params.lookup("zmq_bind"), Some(("defaults", "false".to_string())));
        assert_eq!(params.get("missing"), None);
    }

    #[test]
    fn order_is_configurable_by_name() {
        let params = resolver().with_order(&["file"]).unwrap();
        assert_eq!(params.source_names(), vec!["file", "cli", "defaults"]);
        assert_eq!(params.get("zmq_type").as_deref(), Some("router"));

        let err = resolver().with_order(&["etcd"]).unwrap_err();
        assert!(matches!(err, TransportError::ConfigInvalid { .. }));
    }

    #[test]
    fn typed_lookups_name_the_offending_source() {
        let params = ParameterResolver::new()
            .with_source(MapSource::new("file").with("queue_max_size", "lots").with("zmq_bind", "maybe"));
        let err = params.get_parsed::<usize>("queue_max_size").unwrap_err();
        assert!(err.to_string().contains("from file"));
        assert!(params.get_bool("zmq_bind").is_err());
        assert_eq!(params.get_parsed::<usize>("absent").unwrap(), None);
    }

    #[test]
    fn yaml_maps_flatten_scalars_and_lists() {
        let source = MapSource::from_yaml(
            "file",
            "zmq_endpoint: [tcp://a:1, tcp://b:2]\nzmq_bind: true\nqueue_max_size: 50\nsource_id: ~\n",
        )
        .unwrap();
        assert_eq!(source.get("zmq_endpoint").as_deref(), Some("tcp://a:1,tcp://b:2"));
        assert_eq!(source.get("zmq_bind").as_deref(), Some("true"));
        assert_eq!(source.get("queue_max_size").as_deref(), Some("50"));
        assert_eq!(source.get("source_id"), None);
        assert!(MapSource::from_yaml("file", "- a\n- b\n").is_err());
    }

    #[test]
    fn env_source_reads_prefixed_upper_case_names() {
        let env = EnvSource::new("");
        assert_eq!(env.variable_name("path"), "PATH");
        assert_eq!(env.get("path"), std::env::var("PATH").ok());
        assert_eq!(EnvSource::new("FL_").variable_name("zmq_type"), "FL_ZMQ_TYPE");
    }
}
