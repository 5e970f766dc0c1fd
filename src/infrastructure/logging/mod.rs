//! Logging setup over tracing.
//!
//! Console output honors the configured format (pretty or JSON); when a
//! log directory is configured, a daily-rolling JSON file is added. The
//! returned guard must stay alive for the non-blocking writer to flush.

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::LogConfig;

pub struct Logging {
    _guard: Option<WorkerGuard>,
}

impl Logging {
    pub fn init(config: &LogConfig) -> Result<Self> {
        let filter = EnvFilter::builder()
            .with_default_directive(
                config
                    .level
                    .parse::<tracing::Level>()
                    .map_err(|_| anyhow!("invalid log level {:?}", config.level))?
                    .into(),
            )
            .with_env_var("ZMCP_LOG")
            .from_env_lossy();

        let (file_layer, guard) = match config.log_dir {
            Some(ref dir) => {
                let appender = rolling::daily(dir, "zmcp.log");
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed();
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let console_layer = if config.format == "json" {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().boxed()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| anyhow!("logger init: {e}"))?;

        Ok(Self { _guard: guard })
    }
}
