use clap::ValueEnum;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

/// Target that logs every message sent and received at trace level.
const CHANNEL_TARGET: &str = "tcflink_channel";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

fn targets(level: LogLevel, wire: bool) -> Targets {
    let channel_level = if wire {
        LevelFilter::TRACE
    } else {
        level.as_filter()
    };
    Targets::new()
        .with_default(level.as_filter())
        .with_target(CHANNEL_TARGET, channel_level)
}

/// Install the stderr subscriber. Channel events carry a `channel` field.
///
/// With `wire` set, per-message traces from the channel are shown whatever
/// the base level is.
pub fn init_logging(format: LogFormat, level: LogLevel, wire: bool) {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(wire);
    let registry = tracing_subscriber::registry().with(targets(level, wire));

    let _ = match format {
        LogFormat::Text => registry.with(layer).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
    };
}
