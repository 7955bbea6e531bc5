use crate::config::{GreggdLogEntry, GreggdLogsConfig};
use crate::errors::ConfigError;
use anyhow::anyhow;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt::{format, layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{filter, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the non-blocking writers alive for the life of the process.
pub(crate) struct GreggdLogs {
    _guards: Vec<WorkerGuard>,
}

impl GreggdLogs {
    /// Installs one layer per enabled entry. Failures (`target: "error"`) and
    /// records (`target: "event"`) go to their own entries when those are
    /// configured, everything else to `default`.
    pub fn new(conf: &GreggdLogsConfig) -> Result<GreggdLogs, anyhow::Error> {
        let routes = [("error", &conf.errors), ("event", &conf.events)];
        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guards = Vec::new();

        if conf.default.enable {
            let routed: Vec<&'static str> = routes
                .iter()
                .filter(|(_, entry)| entry.is_some())
                .map(|(target, _)| *target)
                .collect();

            let (writer, guard) = open_writer(&conf.default)?;
            guards.push(guard);
            let only_default = filter::filter_fn(move |m| !routed.contains(&m.target()));
            layers.push(
                format_layer(writer, conf.default.format.as_deref())
                    .with_filter(only_default)
                    .boxed(),
            );
        }

        for (target, entry) in routes {
            let Some(entry) = entry.as_ref().filter(|e| e.enable) else {
                continue;
            };
            let (writer, guard) = open_writer(entry)?;
            guards.push(guard);
            let only_target = filter::filter_fn(move |m| m.target() == target);
            layers.push(
                format_layer(writer, entry.format.as_deref())
                    .with_filter(only_target)
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(EnvFilter::from_default_env())
            .try_init()?;

        Ok(GreggdLogs { _guards: guards })
    }
}

fn open_writer(entry: &GreggdLogEntry) -> Result<(NonBlocking, WorkerGuard), anyhow::Error> {
    match entry.target.as_str() {
        "stderr" => Ok(tracing_appender::non_blocking(std::io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(std::io::stdout())),
        "file" => {
            let directory = entry
                .directory
                .as_deref()
                .ok_or_else(|| missing("directory", entry))?;
            let prefix = entry
                .prefix
                .as_deref()
                .ok_or_else(|| missing("prefix", entry))?;

            let s_rotation = entry.rotation.as_deref().unwrap_or("daily");
            let rotation = match s_rotation.trim().to_ascii_lowercase().as_str() {
                "hourly" => rolling::Rotation::HOURLY,
                "daily" => rolling::Rotation::DAILY,
                "never" => rolling::Rotation::NEVER,
                _ => return Err(anyhow!("Invalid log rotation: {}", s_rotation)),
            };

            let appender = rolling::RollingFileAppender::builder()
                .rotation(rotation)
                .filename_prefix(prefix)
                .max_log_files(entry.max_files.unwrap_or(5))
                .build(directory)?;
            Ok(tracing_appender::non_blocking(appender))
        }
        _ => Err(anyhow!("Invalid log target: {}", entry.target)),
    }
}

/// `full` unless the entry asks for `compact`, `pretty` or `json`.
fn format_layer(writer: NonBlocking, style: Option<&str>) -> BoxedLayer {
    let base = layer().with_writer(writer);
    let events = format().with_target(true).with_level(false);

    match style.unwrap_or("full").trim().to_ascii_lowercase().as_str() {
        "compact" => base.event_format(events.compact()).boxed(),
        "pretty" => base.event_format(events.pretty()).boxed(),
        "json" => base.event_format(events.json().flatten_event(true)).boxed(),
        _ => base.event_format(events).boxed(),
    }
}

fn missing(field: &'static str, entry: &GreggdLogEntry) -> ConfigError {
    ConfigError::MissingField {
        field,
        context: format!("log entry with target {}", entry.target),
    }
}
