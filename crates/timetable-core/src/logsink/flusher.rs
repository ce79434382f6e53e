//! Batching flusher behind the database log layer.
//!
//! Collects queued records and ships them with `COPY timetable.log FROM
//! STDIN` in text format. A batch goes out when it reaches [`CACHE_LIMIT`]
//! records or when the flush interval elapses, whichever happens first.
//! A failed shipment drops the batch; the error is remembered in
//! [`SinkHealth`] rather than retried, the log stream must keep moving.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DbSink, LogRecord, SinkHealth, CACHE_LIMIT};
use crate::db::Gateway;
use crate::error::Result;

/// Time-based flush period
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

const COPY_LOG_SQL: &str =
    "COPY timetable.log (ts, pid, client_name, log_level, message, message_data) FROM STDIN";

/// Destination of a log batch
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogShipper: Send + Sync {
    /// Deliver one batch; returns the number of rows written
    async fn ship(&self, rows: Vec<LogRecord>) -> Result<u64>;
}

/// Ships batches into `timetable.log` through the gateway
pub struct DbShipper {
    gateway: Arc<Gateway>,
}

impl DbShipper {
    /// Shipper bound to the configuration database
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl LogShipper for DbShipper {
    async fn ship(&self, rows: Vec<LogRecord>) -> Result<u64> {
        let encoded = rows.iter().map(encode_row);
        self.gateway.copy_rows(COPY_LOG_SQL, encoded.collect::<Vec<_>>()).await
    }
}

/// Drains the record queue into a [`LogShipper`]
pub struct Flusher<S: LogShipper> {
    receiver: mpsc::Receiver<LogRecord>,
    shipper: S,
    health: Arc<SinkHealth>,
}

impl<S: LogShipper> Flusher<S> {
    /// Build a flusher over an open record queue
    pub fn new(receiver: mpsc::Receiver<LogRecord>, shipper: S, health: Arc<SinkHealth>) -> Self {
        Self { receiver, shipper, health }
    }

    /// Run until cancelled or until every sender is gone, then flush what is
    /// left so shutdown does not lose buffered records.
    pub async fn run(mut self, token: CancellationToken) {
        let mut batch: Vec<LogRecord> = Vec::with_capacity(CACHE_LIMIT);
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + FLUSH_INTERVAL,
            FLUSH_INTERVAL,
        );
        loop {
            tokio::select! {
                received = self.receiver.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= CACHE_LIMIT {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.flush(&mut batch).await,
                _ = token.cancelled() => break,
            }
        }
        while let Ok(record) = self.receiver.try_recv() {
            batch.push(record);
            if batch.len() >= CACHE_LIMIT {
                self.flush_bounded(&mut batch).await;
            }
        }
        self.flush_bounded(&mut batch).await;
    }

    /// Shutdown flush with a deadline of one flush interval per shipment, so
    /// an unreachable database cannot hold the process open. The drained
    /// queue fits in at most two shipments.
    async fn flush_bounded(&self, batch: &mut Vec<LogRecord>) {
        let count = batch.len() as u64;
        if count == 0 {
            return;
        }
        if tokio::time::timeout(FLUSH_INTERVAL, self.flush(batch)).await.is_err() {
            self.health.note_dropped(count);
            warn!(dropped = count, "Final log flush timed out");
        }
    }

    async fn flush(&self, batch: &mut Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len() as u64;
        let rows = std::mem::take(batch);
        match self.shipper.ship(rows).await {
            Ok(copied) => debug!(rows = copied, "Log records shipped"),
            Err(e) => {
                self.health.note_dropped(count);
                self.health.note_error(e.to_string());
                warn!(error = %e, dropped = count, "Log shipment failed");
            }
        }
    }
}

/// Start the database flusher task for an initialized sink
pub fn spawn_db_flusher(
    gateway: Arc<Gateway>,
    sink: DbSink,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let flusher = Flusher::new(sink.receiver, DbShipper::new(gateway), sink.health);
    tokio::spawn(flusher.run(token))
}

/// Encode one record as a COPY text-format line, without the newline
fn encode_row(record: &LogRecord) -> String {
    let mut row = String::with_capacity(64 + record.message.len());
    row.push_str(&record.ts.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string());
    row.push('\t');
    row.push_str(&record.pid.to_string());
    row.push('\t');
    copy_escape(&record.client_name, &mut row);
    row.push('\t');
    row.push_str(record.level.as_str());
    row.push('\t');
    copy_escape(&record.message, &mut row);
    row.push('\t');
    match &record.data {
        Some(value) => copy_escape(&value.to_string(), &mut row),
        None => row.push_str("\\N"),
    }
    row
}

fn copy_escape(field: &str, out: &mut String) {
    for ch in field.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::Severity;
    use chrono::TimeZone;
    use chrono::Utc;
    use serde_json::json;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            ts: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            pid: 77,
            client_name: "worker01".into(),
            level: Severity::Info,
            message: message.into(),
            data: None,
        }
    }

    #[test]
    fn test_copy_escape_specials() {
        let mut out = String::new();
        copy_escape("a\tb\nc\\d\re", &mut out);
        assert_eq!(out, "a\\tb\\nc\\\\d\\re");
    }

    #[test]
    fn test_encode_row_without_data() {
        let row = encode_row(&record("hello"));
        assert_eq!(
            row,
            "2024-01-02 03:04:05.000000+00\t77\tworker01\tINFO\thello\t\\N"
        );
    }

    #[test]
    fn test_encode_row_with_data() {
        let mut r = record("chain started");
        r.data = Some(json!({"chain_id": 9}));
        let row = encode_row(&r);
        assert!(row.ends_with("\tchain started\t{\"chain_id\":9}"));
    }

    #[tokio::test]
    async fn test_flushes_full_batch() {
        let (sender, receiver) = mpsc::channel(CACHE_LIMIT);
        for i in 0..CACHE_LIMIT {
            sender.try_send(record(&format!("m{i}"))).unwrap();
        }
        drop(sender);

        let mut shipper = MockLogShipper::new();
        shipper
            .expect_ship()
            .withf(|rows| rows.len() == CACHE_LIMIT)
            .times(1)
            .returning(|rows| Ok(rows.len() as u64));

        let health = Arc::new(SinkHealth::default());
        Flusher::new(receiver, shipper, Arc::clone(&health))
            .run(CancellationToken::new())
            .await;
        assert_eq!(health.dropped_total(), 0);
    }

    #[tokio::test]
    async fn test_failed_shipment_counts_drops() {
        let (sender, receiver) = mpsc::channel(16);
        for _ in 0..3 {
            sender.try_send(record("doomed")).unwrap();
        }
        drop(sender);

        let mut shipper = MockLogShipper::new();
        shipper
            .expect_ship()
            .times(1)
            .returning(|_| Err(crate::error::Error::task("database is down")));

        let health = Arc::new(SinkHealth::default());
        Flusher::new(receiver, shipper, Arc::clone(&health))
            .run(CancellationToken::new())
            .await;
        assert_eq!(health.dropped_total(), 3);
        assert!(health.take_last_error().unwrap().contains("database is down"));
    }

    #[tokio::test]
    async fn test_cancel_flushes_remaining() {
        let (sender, receiver) = mpsc::channel(16);
        sender.try_send(record("first")).unwrap();
        sender.try_send(record("second")).unwrap();

        let mut shipper = MockLogShipper::new();
        shipper
            .expect_ship()
            .withf(|rows| rows.len() == 2)
            .times(1)
            .returning(|rows| Ok(rows.len() as u64));

        let token = CancellationToken::new();
        token.cancel();
        let health = Arc::new(SinkHealth::default());
        Flusher::new(receiver, shipper, Arc::clone(&health)).run(token).await;
        // the queue was drained on the way out
        assert_eq!(health.dropped_total(), 0);
    }
}
