// Tracing setup: console output, optional JSON file output, and opt-in span timing
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::field::{Field, Visit};
use tracing::{debug, span, Id, Subscriber};
use tracing_subscriber::{
    fmt,
    layer::{Context, Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{Result, YieldError};

const CRATE_TARGET: &str = "stable_yield_engine";
const LOG_DIR: &str = "logs";

static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Levels come from CONSOLE_LOG_LEVEL / FILE_LOG_LEVEL,
/// file output is enabled with LOG_TO_FILE=true.
pub fn init_logging() -> Result<()> {
    let console_level = env::var("CONSOLE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let file_level = env::var("FILE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let log_to_file = env::var("LOG_TO_FILE").map(|v| v == "true").unwrap_or(false);

    let console_layer = fmt::Layer::new()
        .pretty()
        .with_filter(crate_filter(&console_level));

    let file_layer = if log_to_file {
        let log_dir = Path::new(LOG_DIR);
        fs::create_dir_all(log_dir)
            .map_err(|e| YieldError::Config(format!("cannot create log directory: {e}")))?;
        let file_name = format!("{}.log", chrono::Local::now().format("%Y-%m-%d_%H:%M:%S"));

        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));
        FILE_GUARD.set(guard).ok();

        Some(
            fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_filter(crate_filter(&file_level)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(SpanTimingLayer)
        .try_init()
        .map_err(|e| YieldError::Config(format!("logging already initialised: {e}")))
}

/// Everything else at warn, this crate at `level`
fn crate_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("warn,{CRATE_TARGET}={level}"))
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{CRATE_TARGET}=info")))
}

/// Reports busy/idle time for spans declared with `on_close = true`
struct SpanTimingLayer;

struct SpanTiming {
    opened: Instant,
    last_transition: Instant,
    busy: Duration,
    idle: Duration,
}

struct OnCloseFlag(bool);

impl Visit for OnCloseFlag {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "on_close" {
            self.0 = value;
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

impl<S> Layer<S> for SpanTimingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut flag = OnCloseFlag(false);
        attrs.record(&mut flag);
        if !flag.0 {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let now = Instant::now();
            span.extensions_mut().insert(SpanTiming {
                opened: now,
                last_transition: now,
                busy: Duration::ZERO,
                idle: Duration::ZERO,
            });
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(timing) = span.extensions_mut().get_mut::<SpanTiming>() {
                timing.idle += timing.last_transition.elapsed();
                timing.last_transition = Instant::now();
            }
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(timing) = span.extensions_mut().get_mut::<SpanTiming>() {
                timing.busy += timing.last_transition.elapsed();
                timing.last_transition = Instant::now();
            }
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(&id) {
            if let Some(timing) = span.extensions_mut().remove::<SpanTiming>() {
                debug!(
                    span = span.name(),
                    busy_time = ?timing.busy,
                    idle_time = ?timing.idle,
                    total_time = ?timing.opened.elapsed(),
                    "span closed"
                );
            }
        }
    }
}
