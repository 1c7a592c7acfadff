//! Process-wide log setup for binaries embedding the transport.

use tracing_subscriber::EnvFilter;

use crate::{Result, TransportError};

/// Install a fmt subscriber filtered at `level` (e.g. `"info"`, `"framelane=debug"`).
///
/// `RUST_LOG`, when set, takes precedence over `level`. Fails if the level does not
/// parse or a global subscriber is already installed.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| TransportError::config(format!("invalid log level {:?}: {}", level, e)))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| TransportError::config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_a_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(matches!(init_logging("framelane=loud"), Err(TransportError::ConfigInvalid { .. })));
    }
}
