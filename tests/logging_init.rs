//! Global subscriber installation.
//!
//! Lives in its own test binary: once `logging::init` installs the global
//! subscriber, `#[traced_test]` tests in the same process cannot install theirs.

use bluesky_bridge::config::{BridgeConfig, LogFormat};
use bluesky_bridge::logging::{self, TracingConfig};

#[test]
fn init_is_idempotent() {
    let mut config = BridgeConfig::default();
    config.application.log_format = LogFormat::Json;
    let tracing_config = TracingConfig::from_config(&config).unwrap();

    assert!(logging::init(tracing_config).is_ok());
    assert!(logging::init(TracingConfig::default()).is_ok());
    tracing::info!(run_id = "r1", "Logged after init");
}
