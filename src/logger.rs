use std::{fmt, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt, prelude::*};

pub const LOG_FILE: &str = "scalpel.log";
pub const SCRIPT_LOG_FILE: &str = "script.json";

/// Target used for everything the user script prints or logs.
pub const SCRIPT_TARGET: &str = "script";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Lenient parse: anything unknown is `Info`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "critical" | "fatal" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }

    /// `EnvFilter` directive for this level.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }

    /// Emit `msg` at this level on the script log target.
    pub fn emit_script(&self, msg: &str) {
        match self {
            LogLevel::Trace => tracing::trace!(target: SCRIPT_TARGET, "{msg}"),
            LogLevel::Debug => tracing::debug!(target: SCRIPT_TARGET, "{msg}"),
            LogLevel::Info => tracing::info!(target: SCRIPT_TARGET, "{msg}"),
            LogLevel::Warn => tracing::warn!(target: SCRIPT_TARGET, "{msg}"),
            LogLevel::Error => tracing::error!(target: SCRIPT_TARGET, "{msg}"),
            LogLevel::Critical => tracing::error!(target: SCRIPT_TARGET, "[CRITICAL] {msg}"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Critical => "critical",
            other => other.directive(),
        };
        f.write_str(name)
    }
}

/// Keeps the background log writers flushing. Drop it last.
#[must_use]
pub struct LogGuards(#[allow(dead_code)] Vec<WorkerGuard>);

/// `RUST_LOG` when set, `level` otherwise.
fn level_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
}

fn script_filter() -> EnvFilter {
    EnvFilter::new(format!("{SCRIPT_TARGET}=trace"))
}

/// Install the global subscriber.
///
/// - a plain-text daily log `scalpel.log` in `log_dir`
/// - newline-delimited JSON of script output (target `script`) in `script.json`
/// - human readable output on stdout when `stdout` is set
///
/// `RUST_LOG` overrides `level` for the text and terminal output. The script log ignores both.
pub fn init_tracing(log_dir: &Path, level: LogLevel, stdout: bool) -> Result<LogGuards> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    // 1) plain-text rolling file, at the configured level
    let (txt_writer, txt_guard) =
        tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE));
    let txt_layer = tracing_fmt::layer()
        .with_writer(txt_writer)
        .with_ansi(false)
        .with_filter(level_filter(level));

    // 2) JSON lines, every script event whatever the level
    let (json_writer, json_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        log_dir,
        SCRIPT_LOG_FILE,
    ));
    let json_layer = tracing_fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_filter(script_filter());

    // 3) terminal
    let stdout_layer = stdout.then(|| {
        tracing_fmt::layer()
            .with_thread_names(true)
            .with_filter(level_filter(level))
    });

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    tracing::info!(dir = %log_dir.display(), %level, "logging initialised");
    Ok(LogGuards(vec![txt_guard, json_guard]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::{Layer, layer::Context as LayerContext};

    /// Collects `(target, level)` of every event it is shown.
    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<(String, Level)>>>);

    impl<S: Subscriber> Layer<S> for Seen {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            let meta = event.metadata();
            self.0.lock().unwrap().push((meta.target().to_string(), *meta.level()));
        }
    }

    #[test]
    fn test_script_events_bypass_the_level() {
        let script = Seen::default();
        let text = Seen::default();
        let subscriber = Registry::default()
            .with(script.clone().with_filter(script_filter()))
            .with(text.clone().with_filter(EnvFilter::new(LogLevel::Info.directive())));

        tracing::subscriber::with_default(subscriber, || {
            LogLevel::Debug.emit_script("from the script");
            tracing::debug!("internal detail");
            tracing::info!("internal info");
        });

        assert_eq!(
            *script.0.lock().unwrap(),
            vec![(SCRIPT_TARGET.to_string(), Level::DEBUG)]
        );
        let text = text.0.lock().unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].1, Level::INFO);
    }

    #[test]
    fn test_parse_is_lenient() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse(" warning "), LogLevel::Warn);
        assert_eq!(LogLevel::parse("critical"), LogLevel::Critical);
        assert_eq!(LogLevel::parse("loud"), LogLevel::Info);
        assert_eq!(LogLevel::parse(""), LogLevel::Info);
    }

    #[test]
    fn test_directive_and_display() {
        assert_eq!(LogLevel::Critical.directive(), "error");
        assert_eq!(LogLevel::Critical.to_string(), "critical");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_init_creates_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        // a second global subscriber is rejected, which is fine for this test
        let _ = init_tracing(&dir, LogLevel::Debug, false);
        assert!(dir.is_dir());
    }
}
