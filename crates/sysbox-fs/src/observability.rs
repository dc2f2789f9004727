use std::fs::OpenOptions;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

use crate::Opts;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";

enum LogFormat {
    Text,
    Json,
}

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

pub fn init(opts: &Opts) -> Result<()> {
    let level = if opts.debug { Level::DEBUG } else { Level::INFO };
    let level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let format = detect_log_format(opts.log_format.as_deref())?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&opts.log)
        .with_context(|| format!("failed to open log file {}", opts.log.display()))?;

    let subscriber = tracing_subscriber::registry().with(level_filter);
    match format {
        LogFormat::Text => {
            subscriber
                .with(tracing_subscriber::fmt::layer().with_writer(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        LogFormat::Json => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(file),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
    }
    Ok(())
}
