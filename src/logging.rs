//! Structured logging setup for the CLI.
//!
//! Logs go to stderr; stdout is reserved for command output. The filter
//! comes from `CANOPY_LOG` (e.g. `CANOPY_LOG=canopy_core=debug`) and
//! defaults to `warn`.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "CANOPY_LOG";

pub fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
    };
    if result.is_ok() {
        tracing::debug!(json, "logging initialized");
    }
}
