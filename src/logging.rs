use crate::error::{PlanCacheError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes a tracing subscriber for binaries and tests embedding the
/// cache. Library users with their own subscriber should skip this.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| PlanCacheError::Compiler(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| PlanCacheError::Unsupported("logging already initialized"))
}
