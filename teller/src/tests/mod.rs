mod export_tests;
mod pipeline_tests;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::retry::RetryPolicy;

// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_target(true)
        .with_test_writer()
        .try_init();
}

/// Config that never sleeps. Each test passes its own name so the
/// process-wide instance guard never sees two tests on one application.
pub fn fast_config(name: &str) -> SessionConfig {
    SessionConfig {
        app_path: PathBuf::from(format!("C:/CBS/{name}/COLVIR.EXE")),
        launch_policy: RetryPolicy::immediate(10),
        rotation_policy: RetryPolicy::immediate(3),
        scan_policy: RetryPolicy::immediate(3),
        window_timeout: Duration::from_millis(50),
        settle: Duration::ZERO,
        launch_settle: Duration::ZERO,
        exit_grace: Duration::ZERO,
        exit_timeout: Duration::from_millis(20),
        ..SessionConfig::default()
    }
}
