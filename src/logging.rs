//! Logging setup

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding a `tracing` filter directive
pub const LOG_ENV: &str = "RUNWAY_LOG";

/// Filter directive: `--verbose` wins, then `RUNWAY_LOG`, then `info`
pub fn filter_directive(verbose: bool, env: Option<&str>) -> String {
    if verbose {
        return "debug".to_string();
    }
    match env.map(str::trim) {
        Some(directive) if !directive.is_empty() => directive.to_string(),
        _ => "info".to_string(),
    }
}

/// Install the global subscriber; logs go to stderr
pub fn init_logging(verbose: bool) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let directive = filter_directive(verbose, env.as_deref());
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    Ok(())
}
