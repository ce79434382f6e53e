//! Log shipping into `timetable.log`.
//!
//! A custom `tracing` layer captures events into a bounded queue; a flusher
//! task batches them into COPY statements. The hot path never waits on the
//! database for long: when the queue stays full beyond a small budget the
//! record is dropped and counted, and the failure is surfaced through
//! [`SinkHealth`] instead of the logging call itself.

mod flusher;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter, Layer};

pub use flusher::{spawn_db_flusher, Flusher, LogShipper};

use crate::config::{Config, DbLogLevel, LogFormat, LogLevel};
use crate::error::{Error, Result};

/// Records buffered between flushes; also the queue capacity
pub const CACHE_LIMIT: usize = 500;
/// How long a logging call may wait for queue space before dropping
pub const HIGH_LOAD_BUDGET: Duration = Duration::from_millis(200);

/// Severity stored in `timetable.log.log_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Diagnostic chatter
    Debug,
    /// Normal operation, folds in warnings
    Info,
    /// Failures
    Error,
    /// Operator-visible record written by the Log builtin
    User,
    /// Fatal condition
    Panic,
}

impl Severity {
    /// Wire value for the `timetable.log_severity` enum
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Error => "ERROR",
            Severity::User => "USER",
            Severity::Panic => "PANIC",
        }
    }

    fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::TRACE | Level::DEBUG => Severity::Debug,
            Level::INFO | Level::WARN => Severity::Info,
            Level::ERROR => Severity::Error,
        }
    }

    fn from_override(value: &str) -> Option<Self> {
        match value {
            "USER" => Some(Severity::User),
            "PANIC" => Some(Severity::Panic),
            _ => None,
        }
    }
}

/// One row bound for `timetable.log`
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Event time
    pub ts: DateTime<Utc>,
    /// Daemon process id
    pub pid: i32,
    /// Emitting scheduler
    pub client_name: String,
    /// Mapped severity
    pub level: Severity,
    /// Rendered message
    pub message: String,
    /// Remaining structured fields, if any
    pub data: Option<Value>,
}

/// Shared counters of the database sink.
///
/// The layer cannot return errors to logging calls, so failures land here and
/// the engine reports them on its next pass.
#[derive(Debug, Default)]
pub struct SinkHealth {
    dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SinkHealth {
    /// Count records lost to a full queue or a failed flush
    pub fn note_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Remember the most recent shipping failure
    pub fn note_error(&self, message: String) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(message);
        }
    }

    /// Take the most recent shipping failure, clearing the slot
    pub fn take_last_error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }

    /// Total records dropped since start
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiver half of the database sink, consumed by the flusher task
pub struct DbSink {
    /// Queued records
    pub receiver: mpsc::Receiver<LogRecord>,
    /// Shared failure counters
    pub health: Arc<SinkHealth>,
}

/// Guards and handles the logging setup hands back to `main`
pub struct Logging {
    /// Keeps the non-blocking file writer alive
    pub file_guard: Option<WorkerGuard>,
    /// Present when database shipping is enabled
    pub db_sink: Option<DbSink>,
}

/// `tracing` layer that queues events for the database sink
pub struct DbLogLayer {
    sender: mpsc::Sender<LogRecord>,
    health: Arc<SinkHealth>,
    client_name: String,
    pid: i32,
    max_level: LevelFilter,
}

impl DbLogLayer {
    /// Build a layer shipping events up to `max_level`
    pub fn new(
        sender: mpsc::Sender<LogRecord>,
        health: Arc<SinkHealth>,
        client_name: impl Into<String>,
        max_level: LevelFilter,
    ) -> Self {
        Self {
            sender,
            health,
            client_name: client_name.into(),
            pid: std::process::id() as i32,
            max_level,
        }
    }

    fn enqueue(&self, record: LogRecord) {
        let deadline = Instant::now() + HIGH_LOAD_BUDGET;
        let mut pending = record;
        loop {
            match self.sender.try_send(pending) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(record)) => {
                    if Instant::now() >= deadline {
                        // budget spent, the record is lost but counted
                        self.health.note_dropped(1);
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    pending = record;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for DbLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // the sink must not feed on its own output or on driver chatter
        if meta.target().starts_with("timetable_core::logsink")
            || meta.target().starts_with("sqlx")
        {
            return;
        }
        if *meta.level() > self.max_level {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let level = visitor
            .severity
            .as_deref()
            .and_then(Severity::from_override)
            .unwrap_or_else(|| Severity::from_tracing(meta.level()));
        let data = if visitor.data.is_empty() {
            None
        } else {
            Some(Value::Object(visitor.data))
        };
        self.enqueue(LogRecord {
            ts: Utc::now(),
            pid: self.pid,
            client_name: self.client_name.clone(),
            level,
            message: visitor.message,
            data,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    severity: Option<String>,
    data: serde_json::Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.data
                .insert(field.name().to_owned(), Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_owned(),
            "severity" => self.severity = Some(value.to_ascii_uppercase()),
            name => {
                self.data.insert(name.to_owned(), Value::String(value.to_owned()));
            }
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.data.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.data.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.data.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.data.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.data
            .insert(field.name().to_owned(), Value::String(value.to_string()));
    }
}

/// Install the tracing subscriber: stdout, optional file, optional database
/// sink. Returns the guards `main` must keep alive and the sink half the
/// flusher consumes once the gateway is up.
pub fn init(config: &Config) -> Result<Logging> {
    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.tracing_directive()));
    let stdout_layer = fmt_layer::layer().with_filter(stdout_filter);

    let (file_text, file_json, file_guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) =
                tracing_appender::non_blocking(file_appender(path, config.log_file_rotate)?);
            match config.log_file_format {
                LogFormat::Text => (
                    Some(
                        fmt_layer::layer()
                            .with_writer(writer)
                            .with_ansi(false)
                            .with_filter(local_level(config.log_level)),
                    ),
                    None,
                    Some(guard),
                ),
                LogFormat::Json => (
                    None,
                    Some(
                        fmt_layer::layer()
                            .with_writer(writer)
                            .with_ansi(false)
                            .json()
                            .with_filter(local_level(config.log_level)),
                    ),
                    Some(guard),
                ),
            }
        }
        None => (None, None, None),
    };

    let (db_layer, db_sink) = match db_level(config.log_database_level) {
        Some(max_level) => {
            let (sender, receiver) = mpsc::channel(CACHE_LIMIT);
            let health = Arc::new(SinkHealth::default());
            let layer = DbLogLayer::new(sender, Arc::clone(&health), &config.client_name, max_level);
            (Some(layer), Some(DbSink { receiver, health }))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_text)
        .with(file_json)
        .with(db_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("cannot install tracing subscriber: {e}")))?;

    Ok(Logging { file_guard, db_sink })
}

fn file_appender(path: &Path, rotate: bool) -> Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path.file_name().ok_or_else(|| {
        Error::Config(format!("log file path {} has no file name", path.display()))
    })?;
    Ok(if rotate {
        rolling::daily(dir, name)
    } else {
        rolling::never(dir, name)
    })
}

fn local_level(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

fn db_level(level: DbLogLevel) -> Option<LevelFilter> {
    match level {
        DbLogLevel::Debug => Some(LevelFilter::DEBUG),
        DbLogLevel::Info => Some(LevelFilter::INFO),
        DbLogLevel::Error => Some(LevelFilter::ERROR),
        DbLogLevel::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layer(max_level: LevelFilter) -> (DbLogLayer, mpsc::Receiver<LogRecord>, Arc<SinkHealth>) {
        let (sender, receiver) = mpsc::channel(16);
        let health = Arc::new(SinkHealth::default());
        let layer = DbLogLayer::new(sender, Arc::clone(&health), "worker01", max_level);
        (layer, receiver, health)
    }

    #[test]
    fn test_layer_captures_event_fields() {
        let (layer, mut receiver, _health) = test_layer(LevelFilter::INFO);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(chain_id = 7i64, "chain started");
            tracing::debug!("below the shipping level");
            tracing::info!(severity = "USER", "operator note");
            tracing::info!(target: "sqlx::query", "driver chatter");
        });

        let first = receiver.try_recv().unwrap();
        assert_eq!(first.message, "chain started");
        assert_eq!(first.level, Severity::Info);
        assert_eq!(first.client_name, "worker01");
        assert_eq!(first.data.unwrap()["chain_id"], 7);

        let second = receiver.try_recv().unwrap();
        assert_eq!(second.level, Severity::User);
        assert_eq!(second.message, "operator note");

        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(Severity::from_tracing(&Level::TRACE), Severity::Debug);
        assert_eq!(Severity::from_tracing(&Level::WARN), Severity::Info);
        assert_eq!(Severity::from_tracing(&Level::ERROR), Severity::Error);
        assert_eq!(Severity::from_override("USER"), Some(Severity::User));
        assert_eq!(Severity::from_override("PANIC"), Some(Severity::Panic));
        assert_eq!(Severity::from_override("WHATEVER"), None);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let (sender, _receiver) = mpsc::channel(1);
        let health = Arc::new(SinkHealth::default());
        let layer = DbLogLayer::new(sender, Arc::clone(&health), "worker01", LevelFilter::INFO);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("fits");
            tracing::info!("dropped after the budget");
        });
        assert_eq!(health.dropped_total(), 1);
    }

    #[test]
    fn test_sink_health_error_slot() {
        let health = SinkHealth::default();
        assert!(health.take_last_error().is_none());
        health.note_error("copy failed".into());
        health.note_error("copy failed again".into());
        assert_eq!(health.take_last_error().as_deref(), Some("copy failed again"));
        assert!(health.take_last_error().is_none());
    }
}
