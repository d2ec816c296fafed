use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use crate::{LogFormat, TelemetrySettings};

/// Install the global tracing subscriber described by `settings`.
/// Does nothing when telemetry is disabled.
pub fn init_tracing(settings: &TelemetrySettings) -> Result<()> {
    if !settings.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_new(&settings.filter)
        .with_context(|| format!("invalid log filter {:?}", settings.filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match settings.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| anyhow!(err))
}
