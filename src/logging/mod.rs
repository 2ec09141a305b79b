//! Structured logging setup: an `EnvFilter` driven by `RUST_LOG`/
//! `--log-level`, a formatted layer for stderr, and an optional rolling
//! file appender when a log directory is configured.

use std::fmt;
use std::path::Path;
use std::sync::Once;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking;
use tracing_appender::rolling;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// `LEVEL TIMESTAMP PID:x TID:y file:line target message` — denser than
/// the default formatter, useful when several connections interleave in
/// one stream of output.
pub struct DetailedFormatter;

impl<S, N> FormatEvent<S, N> for DetailedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = chrono::Utc::now();
        let level = event.metadata().level();
        let pid = std::process::id();
        let tid = format!("{:?}", std::thread::current().id())
            .replace("ThreadId(", "")
            .replace(')', "");
        let file = event.metadata().file().unwrap_or("unknown");
        let file_name = Path::new(file)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown");
        let line = event.metadata().line().unwrap_or(0);
        let target = event.metadata().target();

        write!(
            writer,
            "{} {} pid:{} tid:{} {}:{} {} ",
            level,
            now.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            pid,
            tid,
            file_name,
            line,
            target,
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize global structured logging. Safe to call more than once;
/// only the first call takes effect, matching `tracing`'s single global
/// subscriber.
///
/// `log_dir`, when given, gets a `proxy.log` file via a non-blocking
/// rolling appender in addition to the stderr layer. Both honor
/// `log_level` unless `RUST_LOG` is set, in which case `RUST_LOG` wins.
pub fn init(log_level: &str, log_dir: Option<&Path>) {
    INIT.call_once(|| {
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .event_format(DetailedFormatter)
            .with_writer(std::io::stderr);

        match log_dir {
            Some(dir) => {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    eprintln!("warning: failed to create log dir {}: {e}", dir.display());
                }
                let file_appender = rolling::daily(dir, "proxy.log");
                let (non_blocking_file, guard) = non_blocking(file_appender);
                let file_layer = tracing_subscriber::fmt::layer()
                    .event_format(DetailedFormatter)
                    .with_ansi(false)
                    .with_writer(non_blocking_file);

                tracing_subscriber::registry()
                    .with(filter())
                    .with(console_layer)
                    .with(file_layer)
                    .init();

                // Kept alive for the process lifetime; there is no shutdown hook to
                // drop it from.
                std::mem::forget(guard);
            }
            None => {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(console_layer)
                    .init();
            }
        }

        if let Err(e) = LogTracer::init() {
            eprintln!("warning: failed to bridge `log` crate into `tracing`: {e}");
        }
    });
}
