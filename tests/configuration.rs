//! Loading transport configuration from YAML files and layered parameters.

mod common;

use common::{WAIT, frame};
use framelane::config::{DefaultsSource, MapSource, ParameterResolver};
use framelane::{
    AdmissionPolicy, EndpointSpec, SocketPattern, SocketRole, TransportConfig, TransportError, TransportSupervisor,
};
use std::io::Write;

#[tokio::test]
async fn supervisor_starts_from_a_yaml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "
ingress:
  - name: cameras
    addresses: [inproc://yaml-cameras]
    role: bind
    pattern: pull
    source_id_prefix: cam
    queue_max_size: 4
egress:
  - name: loopback
    addresses: inproc://yaml-cameras
    role: connect
    pattern: push
shutdown_grace_ms: 100
health_interval_ms: 50
"
    )
    .unwrap();

    let config = TransportConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(config.ingress[0].queue_max_size, 4);
    assert_eq!(config.ingress[0].admission_policy(), AdmissionPolicy::Block);

    let supervisor = TransportSupervisor::start(config).await.unwrap();
    supervisor.publish(&frame("cam7", 1)).await.unwrap();
    assert_eq!(supervisor.poll("cam7", WAIT).await.unwrap().unwrap().frame_id(), 1);
    assert!(supervisor.endpoint("cameras").is_some());
    assert!(supervisor.endpoint("loopback").is_some());
    supervisor.shutdown().await;
}

#[test]
fn pattern_in_the_wrong_direction_is_rejected() {
    let err = TransportConfig::from_yaml_str(
        "
ingress:
  - addresses: tcp://*:5555
    role: bind
    pattern: dealer
",
    )
    .unwrap_err();
    assert!(matches!(err, TransportError::ConfigInvalid { .. }));
}

#[test]
fn malformed_addresses_are_config_errors() {
    for address in ["udp://host:1", "tcp://host", "ipc://", "inproc://"] {
        let yaml = format!("ingress:\n  - addresses: {address}\n    role: bind\n    pattern: pull\n");
        assert!(
            matches!(TransportConfig::from_yaml_str(&yaml), Err(TransportError::ConfigInvalid { .. })),
            "{address} should be rejected"
        );
    }
}

#[test]
fn resolution_order_decides_which_source_wins() {
    let config = TransportConfig::from_yaml_str("resolution_order: [file, env, defaults]").unwrap();

    let resolver = ParameterResolver::new()
        .with_source(MapSource::new("env").with("zmq_endpoint", "tcp://10.0.0.1:5555").with("zmq_type", "dealer"))
        .with_source(MapSource::new("file").with("zmq_endpoint", "tcp://10.0.0.2:5555").with("queue_max_size", "8"))
        .with_source(DefaultsSource::adapter());
    let resolver = config.order_parameters(resolver).unwrap();
    assert_eq!(resolver.source_names(), vec!["file", "env", "defaults"]);

    let spec = EndpointSpec::from_parameters(&resolver).unwrap();
    assert_eq!(spec.addresses[0].to_string(), "tcp://10.0.0.2:5555");
    assert_eq!(spec.pattern, SocketPattern::Dealer);
    assert_eq!(spec.role, SocketRole::Connect);
    assert_eq!(spec.queue_max_size, 8);
}

#[test]
fn adapter_defaults_alone_describe_a_local_dealer() {
    let resolver = ParameterResolver::new().with_source(DefaultsSource::adapter());
    let spec = EndpointSpec::from_parameters(&resolver).unwrap();
    assert_eq!(spec.addresses[0].to_string(), "ipc:///tmp/zmq-sockets/input-video.ipc");
    assert_eq!(spec.pattern, SocketPattern::Dealer);
    assert_eq!(spec.role, SocketRole::Connect);
    assert_eq!(spec.queue_max_size, 100);
}

#[test]
fn unknown_source_in_resolution_order_is_rejected() {
    let config = TransportConfig::from_yaml_str("resolution_order: [vault]").unwrap();
    let resolver = ParameterResolver::new().with_source(DefaultsSource::adapter());
    assert!(matches!(config.order_parameters(resolver), Err(TransportError::ConfigInvalid { .. })));
}
