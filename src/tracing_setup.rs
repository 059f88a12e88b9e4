use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the logging level
/// (debug | info | warn | error).
pub const LOGGING_LEVEL_ENV: &str = "XAVI_LOGGING_LEVEL";

/// Resolve the logging level from the environment, defaulting to `info`.
///
/// Unknown values fall back to `info` rather than failing bootstrap.
pub fn logging_level_from_env() -> &'static str {
    match std::env::var(LOGGING_LEVEL_ENV)
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Initialize structured logging with JSON output at the given level.
pub fn init_tracing(level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("invalid log level: {level}"))?;

    Registry::default()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true),
        )
        .init();

    tracing::info!(level, "log level set");
    Ok(())
}

/// Initialize console-friendly logging for development and tests.
pub fn init_console_tracing(level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("invalid log level: {level}"))?;

    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
        .init();

    Ok(())
}
