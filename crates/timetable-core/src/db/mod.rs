//! Database gateway: the single access point to the state of record.
//!
//! Owns the connection pool, the session advisory lock and the reconnect
//! policy. Everything above this module speaks in terms of chains, tasks and
//! run states; everything below is SQL.

mod listener;
mod migrations;
mod queries;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgPoolCopyExt};
use sqlx::{ConnectOptions, Connection, PgConnection, Postgres, Transaction};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use listener::{ChainSignal, SignalCommand, SignalListener};
pub use migrations::SchemaState;
pub use queries::{Chain, ChainTask, IntervalChain, OnError, RunState, TaskKind};

use crate::config::Config;
use crate::error::{Error, Result};

/// Ping cadence while the database is unreachable; also bounds how long an
/// operation may wait for a free pooled connection.
const WAIT_TIME: Duration = Duration::from_secs(5);

/// Doubling retry delay for the session lock. Starts at five seconds and
/// saturates at eighty, giving the server time to notice a dead holder.
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(80);

    pub(crate) fn new() -> Self {
        Self { delay: Self::INITIAL }
    }

    /// Current delay; doubles for the next call
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        delay
    }
}

/// Handle to the configuration database
pub struct Gateway {
    pool: PgPool,
    options: PgConnectOptions,
    client_name: String,
    /// Dedicated connection holding the client-name advisory lock
    lock_conn: Mutex<Option<PgConnection>>,
}

impl Gateway {
    /// Open the pool with one eager connection attempt
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size())
            .min_connections(1)
            .acquire_timeout(WAIT_TIME)
            .connect_with(options.clone())
            .await?;
        Ok(Self {
            pool,
            options,
            client_name: config.client_name.clone(),
            lock_conn: Mutex::new(None),
        })
    }

    /// Keep trying to open the pool until it works or `token` is cancelled.
    ///
    /// Transient failures are logged and retried every [`WAIT_TIME`];
    /// configuration errors abort immediately. `Ok(None)` means cancelled.
    pub async fn connect_with_retry(
        config: &Config,
        token: &CancellationToken,
    ) -> Result<Option<Self>> {
        loop {
            match Self::connect(config).await {
                Ok(gateway) => return Ok(Some(gateway)),
                Err(e @ Error::Config(_)) => return Err(e),
                Err(e) => warn!(error = %e, "Configuration database not reachable"),
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(None),
                _ = tokio::time::sleep(WAIT_TIME) => {}
            }
        }
    }

    /// The connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Client name this gateway acts as
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Round trip to the server
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Block until the server answers pings again, probing every
    /// [`WAIT_TIME`].
    ///
    /// Returns false when `token` is cancelled first.
    pub async fn wait_until_reachable(&self, token: &CancellationToken) -> bool {
        loop {
            match self.ping().await {
                Ok(()) => return true,
                Err(e) => warn!(error = %e, "Waiting for the configuration database"),
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(WAIT_TIME) => {}
            }
        }
    }

    /// Acquire the exclusive session lock for this client name.
    ///
    /// The lock lives on a dedicated connection so that pool churn cannot
    /// release it. A lock held elsewhere is retried forever with backoff,
    /// matching the takeover semantics of a failed scheduler being replaced.
    /// Returns false when `token` is cancelled before the lock is won.
    pub async fn lock_client_name(&self, token: &CancellationToken) -> Result<bool> {
        // A reconnect may still hold the previous lock connection; drop it so
        // the fresh attempt does not contend with this same process.
        self.release_session_lock().await;
        let mut backoff = Backoff::new();
        loop {
            match self.try_lock_session().await {
                Ok(true) => {
                    info!(client_name = %self.client_name, "Session lock acquired");
                    return Ok(true);
                }
                Ok(false) => {
                    error!(
                        client_name = %self.client_name,
                        "Client name is locked by another scheduler"
                    );
                }
                Err(e) if e.is_transport() => {
                    warn!(error = %e, "Session lock attempt failed");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(false),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn try_lock_session(&self) -> Result<bool> {
        let mut conn = self.options.connect().await?;
        let locked =
            sqlx::query_scalar::<_, bool>("SELECT timetable.try_lock_client_name($1, $2)")
                .bind(std::process::id() as i64)
                .bind(&self.client_name)
                .fetch_one(&mut conn)
                .await?;
        if locked {
            *self.lock_conn.lock().await = Some(conn);
        } else {
            conn.close().await.ok();
        }
        Ok(locked)
    }

    /// Drop the session lock connection, releasing the advisory lock
    pub async fn release_session_lock(&self) {
        if let Some(conn) = self.lock_conn.lock().await.take() {
            conn.close().await.ok();
        }
    }

    /// Run a multi-statement SQL script on a pooled connection
    pub async fn exec_script(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Run a SQL script loaded from `path`
    pub async fn exec_script_file(&self, path: &Path) -> Result<()> {
        let sql = tokio::fs::read_to_string(path).await?;
        self.exec_script(&sql).await
    }

    /// Dedicated connection to another database, for remote tasks
    pub async fn remote_connect(&self, dsn: &str) -> Result<PgConnection> {
        let options = PgConnectOptions::from_str(dsn)
            .map_err(|e| Error::validation(format!("invalid database_connection: {e}")))?
            .application_name(&self.client_name);
        Ok(options.connect().await?)
    }

    /// Ask the server to cancel the query running on `pid`
    pub async fn cancel_backend(&self, pid: i32) -> Result<bool> {
        let cancelled = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(pid)
            .fetch_one(&self.pool)
            .await?;
        Ok(cancelled)
    }

    /// Start a chain transaction on a pooled connection
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// `COPY ... FROM STDIN` streaming the contents of `path`.
    ///
    /// Returns the number of rows the server reports as copied.
    pub async fn copy_from_file(&self, sql: &str, path: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut sink = self.pool.copy_in_raw(sql).await?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    sink.abort("file read failed").await.ok();
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = sink.send(&buf[..n]).await {
                return Err(e.into());
            }
        }
        Ok(sink.finish().await?)
    }

    /// `COPY ... FROM STDIN` over pre-encoded text-format rows.
    ///
    /// Rows must already be escaped for COPY text format, without the
    /// trailing newline.
    pub async fn copy_rows<I>(&self, sql: &str, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = String>,
    {
        let mut sink = self.pool.copy_in_raw(sql).await?;
        for mut row in rows {
            row.push('\n');
            if let Err(e) = sink.send(row.as_bytes()).await {
                return Err(e.into());
            }
        }
        Ok(sink.finish().await?)
    }

    /// Close the pool and release the session lock
    pub async fn close(&self) {
        self.release_session_lock().await;
        self.pool.close().await;
    }
}

/// Backend pid of a connection, captured so the run can be cancelled
pub async fn backend_pid(conn: &mut PgConnection) -> Result<i32> {
    Ok(sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
        .fetch_one(conn)
        .await?)
}

/// Set a named savepoint
pub async fn savepoint(conn: &mut PgConnection, name: &str) -> Result<()> {
    sqlx::query(&format!("SAVEPOINT {}", quote_ident(name)))
        .execute(conn)
        .await?;
    Ok(())
}

/// Roll back to a named savepoint, keeping the surrounding transaction alive
pub async fn rollback_to_savepoint(conn: &mut PgConnection, name: &str) -> Result<()> {
    sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)))
        .execute(conn)
        .await?;
    Ok(())
}

/// `SET ROLE` for the rest of the transaction
pub async fn set_role(conn: &mut PgConnection, role: &str) -> Result<()> {
    sqlx::query(&format!("SET ROLE {}", quote_ident(role)))
        .execute(conn)
        .await?;
    Ok(())
}

/// Return to the session role
pub async fn reset_role(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("RESET ROLE").execute(conn).await?;
    Ok(())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_saturates() {
        let mut b = Backoff::new();
        let secs: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 80, 80]);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("batch_role"), "\"batch_role\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
