use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::{Config, TracingConfig};

const LOG_ENV: &str = "CMI_LOG";
const MIN_EVENT_FILTER_ENV: &str = "CMI_MIN_TRACING_EVENT";
const MAX_EVENT_FILTER_ENV: &str = "CMI_MAX_TRACING_EVENT";
const SPAN_FILTER_ENV: &str = "CMI_TRACING_SPAN";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, colour) = match *self.level {
            Level::TRACE => (TRACE_STR, Colour::Purple),
            Level::DEBUG => (DEBUG_STR, Colour::Blue),
            Level::INFO => (INFO_STR, Colour::Green),
            Level::WARN => (WARN_STR, Colour::Yellow),
            Level::ERROR => (ERROR_STR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(text))
        } else {
            f.pad(text)
        }
    }
}

/// `[timestamp LEVEL thread file:line] fields`
struct CmiFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for CmiFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        use chrono::Utc;
        let metadata = event.metadata();
        let level = FmtLevel {
            level: metadata.level(),
            ansi: self.ansi && writer.has_ansi_escapes(),
        };
        let thread = std::thread::current();

        write!(
            writer,
            "[{} {} {} {}:{}] ",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            level,
            thread.name().unwrap_or("-"),
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default: &str, env: &str) -> anyhow::Result<EnvFilter> {
    Ok(EnvFilter::builder()
        .with_default_directive(default.parse()?)
        .with_env_var(env)
        .from_env_lossy())
}

fn level_of(filter: &EnvFilter) -> anyhow::Result<Level> {
    filter
        .max_level_hint()
        .and_then(LevelFilter::into_level)
        .ok_or_else(|| anyhow::anyhow!("tracing level {} disables every event", filter))
}

pub type Guards = (
    tracing_appender::non_blocking::WorkerGuard,
    tracing_chrome::FlushGuard,
);

/// Installs the global subscriber. Events go to stdout, filtered by `CMI_LOG`. With
/// tracing enabled, events are also written to a rolling file and spans to
/// `tracing.json`; the returned guards flush them on drop.
pub fn init_log(config: &Config, ansi: bool) -> anyhow::Result<Option<Guards>> {
    use tracing_subscriber::prelude::*;

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(CmiFormatter { ansi })
        .with_filter(env_filter(&config.log_level, LOG_ENV)?);
    let registry = tracing_subscriber::registry().with(log_fmt_layer);

    if !config.tracing.enable {
        registry.try_init()?;
        tracing::info!("logging initialized");
        return Ok(None);
    }

    let TracingConfig {
        min_event_level,
        max_event_level,
        span_level,
        output_dir,
        ..
    } = &config.tracing;

    let file_appender = tracing_appender::rolling::hourly(output_dir, "event.log");
    let (non_blocking, appender_guard) = tracing_appender::non_blocking(file_appender);

    let min_event_level = level_of(&env_filter(min_event_level, MIN_EVENT_FILTER_ENV)?)?;
    let max_event_level = level_of(&env_filter(max_event_level, MAX_EVENT_FILTER_ENV)?)?;

    let tracing_fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(CmiFormatter { ansi: false })
        .with_writer(
            non_blocking
                .with_min_level(min_event_level)
                .with_max_level(max_event_level),
        )
        .with_filter(EnvFilter::new("trace"));

    let (chrome_layer, flush_guard) = tracing_chrome::ChromeLayerBuilder::new()
        .file(std::path::Path::new(output_dir).join("tracing.json"))
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();

    registry
        .with(tracing_fmt_layer)
        .with(chrome_layer.with_filter(env_filter(span_level, SPAN_FILTER_ENV)?))
        .try_init()?;

    tracing::info!("logging and tracing initialized, output in {}", output_dir);
    Ok(Some((appender_guard, flush_guard)))
}
