//! Task execution: the three task kinds, role switching, parameter
//! binding and interruption by deadline or operator stop.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::builtins;
use super::chain::effective_timeout;
use super::engine::ChainRunner;
use super::types::{TaskOutcome, TaskReport, TaskStatus};
use crate::db::{self, Chain, ChainTask, TaskKind};
use crate::error::{Error, Result};

/// Why a running task was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// The task deadline elapsed
    Deadline(Duration),
    /// Cancellation: operator stop, chain deadline or shutdown
    Stop,
}

impl ChainRunner {
    /// Execute one task and report what happened. Infallible by design of
    /// the caller loop: every problem becomes a status in the report.
    pub(crate) async fn run_task(
        &self,
        chain: &Chain,
        task: &ChainTask,
        tx: &mut Transaction<'static, Postgres>,
        chain_pid: i32,
        token: &CancellationToken,
    ) -> TaskReport {
        let started_at = Utc::now();
        let outcome = match self.gateway.select_task_parameters(task.task_id).await {
            Ok(params) => {
                let deadline = effective_timeout(task.timeout_ms, self.config.task_timeout_ms);
                match task.kind() {
                    Ok(TaskKind::Sql) => {
                        self.run_sql_task(task, &params, tx, chain_pid, deadline, token).await
                    }
                    Ok(TaskKind::Program) => {
                        self.run_program_task(task, &params, deadline, token).await
                    }
                    Ok(TaskKind::Builtin) => {
                        self.run_builtin_task(task, &params, deadline, token).await
                    }
                    Err(e) => TaskOutcome::Failure { code: -1, message: e.to_string() },
                }
            }
            Err(e) => TaskOutcome::Failure {
                code: -1,
                message: format!("cannot load parameters: {e}"),
            },
        };
        let finished_at = Utc::now();

        let (status, code, output) = match outcome {
            TaskOutcome::Success { code, output } => (TaskStatus::Ok, code, output),
            TaskOutcome::Failure { code, message } => {
                let status = TaskStatus::for_failure(task.ignore_error, chain.on_error());
                if status == TaskStatus::FatalError {
                    error!(
                        "Task {} of chain {} failed: {}",
                        task.task_id, chain.chain_id, message
                    );
                } else {
                    warn!(
                        "Task {} of chain {} failed: {}",
                        task.task_id, chain.chain_id, message
                    );
                }
                (status, code, Some(message))
            }
            TaskOutcome::Cancelled => {
                warn!("Task {} of chain {} cancelled", task.task_id, chain.chain_id);
                (TaskStatus::Cancelled, -1, Some("cancelled".to_string()))
            }
        };
        TaskReport {
            status,
            code,
            output,
            started_at,
            finished_at,
        }
    }

    async fn run_sql_task(
        &self,
        task: &ChainTask,
        params: &[Value],
        tx: &mut Transaction<'static, Postgres>,
        chain_pid: i32,
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> TaskOutcome {
        if task.is_remote() {
            self.run_remote_sql(task, params, deadline, token).await
        } else if task.autonomous {
            self.run_autonomous_sql(task, params, deadline, token).await
        } else {
            self.run_tx_sql(task, params, tx, chain_pid, deadline, token).await
        }
    }

    /// Local SQL inside the chain transaction. The savepoint confines an
    /// error to this task; without it the whole transaction would abort.
    /// Rolling back to it also reverts a `SET ROLE` done after it.
    async fn run_tx_sql(
        &self,
        task: &ChainTask,
        params: &[Value],
        tx: &mut Transaction<'static, Postgres>,
        chain_pid: i32,
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> TaskOutcome {
        let sp = format!("task_{}", task.task_id);
        if let Err(e) = db::savepoint(&mut **tx, &sp).await {
            return TaskOutcome::Failure { code: -1, message: e.to_string() };
        }
        if let Some(role) = task.run_as.as_deref() {
            if let Err(e) = db::set_role(&mut **tx, role).await {
                rollback_savepoint_quietly(&mut **tx, &sp).await;
                return TaskOutcome::Failure { code: -1, message: e.to_string() };
            }
        }
        let (res, interrupt) = self
            .run_sql_interruptible(&mut **tx, chain_pid, &task.command, params, deadline, token)
            .await;
        match res {
            Ok(affected) => {
                debug!("Task {} touched {} rows", task.task_id, affected);
                if task.run_as.is_some() {
                    if let Err(e) = db::reset_role(&mut **tx).await {
                        return TaskOutcome::Failure { code: -1, message: e.to_string() };
                    }
                }
                TaskOutcome::Success { code: 0, output: None }
            }
            Err(e) => {
                rollback_savepoint_quietly(&mut **tx, &sp).await;
                interrupted_outcome(interrupt, e)
            }
        }
    }

    /// Autonomous SQL on its own pooled connection, effective immediately
    /// and unaffected by a later rollback of the chain transaction.
    async fn run_autonomous_sql(
        &self,
        task: &ChainTask,
        params: &[Value],
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> TaskOutcome {
        let mut conn = match self.gateway.pool().acquire().await {
            Ok(conn) => conn,
            Err(e) => return TaskOutcome::Failure { code: -1, message: e.to_string() },
        };
        let pid = match db::backend_pid(&mut conn).await {
            Ok(pid) => pid,
            Err(e) => return TaskOutcome::Failure { code: -1, message: e.to_string() },
        };
        if let Some(role) = task.run_as.as_deref() {
            if let Err(e) = db::set_role(&mut conn, role).await {
                return TaskOutcome::Failure { code: -1, message: e.to_string() };
            }
        }
        let (res, interrupt) = self
            .run_sql_interruptible(&mut conn, pid, &task.command, params, deadline, token)
            .await;
        if task.run_as.is_some() {
            if let Err(e) = db::reset_role(&mut conn).await {
                // a connection stuck in a foreign role must not go back to
                // the pool
                warn!(
                    "Cannot reset role after task {}, discarding connection: {}",
                    task.task_id, e
                );
                let _ = conn.detach().close().await;
            }
        }
        match res {
            Ok(affected) => {
                debug!("Task {} touched {} rows", task.task_id, affected);
                TaskOutcome::Success { code: 0, output: None }
            }
            Err(e) => interrupted_outcome(interrupt, e),
        }
    }

    /// Remote SQL on a throwaway connection to the task's own DSN. On
    /// interruption the connection is dropped, which aborts the statement
    /// server side.
    async fn run_remote_sql(
        &self,
        task: &ChainTask,
        params: &[Value],
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> TaskOutcome {
        let dsn = task.database_connection.as_deref().unwrap_or_default();
        let mut conn = match self.gateway.remote_connect(dsn).await {
            Ok(conn) => conn,
            Err(e) => return TaskOutcome::Failure { code: -1, message: e.to_string() },
        };
        match race_interrupt(exec_remote(&mut conn, task, params), deadline, token).await {
            Ok(Ok(affected)) => {
                debug!("Task {} touched {} rows", task.task_id, affected);
                let _ = conn.close().await;
                TaskOutcome::Success { code: 0, output: None }
            }
            Ok(Err(e)) => {
                let _ = conn.close().await;
                interrupted_outcome(None, e)
            }
            Err(reason) => interrupt_outcome(reason),
        }
    }

    /// Race a SQL command against the deadline and the cancellation token.
    /// On interruption the server backend is cancelled and the statement
    /// awaited to its error, keeping the connection protocol-clean.
    async fn run_sql_interruptible(
        &self,
        conn: &mut PgConnection,
        pid: i32,
        command: &str,
        params: &[Value],
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> (Result<u64>, Option<Interrupt>) {
        let fut = exec_sql(conn, command, params);
        tokio::pin!(fut);
        tokio::select! {
            res = &mut fut => (res, None),
            reason = wait_interrupt(deadline, token) => {
                if let Err(e) = self.gateway.cancel_backend(pid).await {
                    warn!("Cannot cancel backend {}: {}", pid, e);
                }
                (fut.await, Some(reason))
            }
        }
    }

    /// PROGRAM task: the command runs once per parameter row with arguments
    /// taken from a JSON array of strings. Output of the last run wins.
    async fn run_program_task(
        &self,
        task: &ChainTask,
        params: &[Value],
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> TaskOutcome {
        if self.config.no_program_tasks {
            return TaskOutcome::Failure {
                code: -1,
                message: "program tasks execution is disabled".to_string(),
            };
        }
        if task.command.trim().is_empty() {
            return TaskOutcome::Failure {
                code: -1,
                message: "Shell command cannot be empty".to_string(),
            };
        }
        let runs = match decode_argv_rows(params) {
            Ok(runs) => runs,
            Err(e) => return TaskOutcome::Failure { code: -1, message: e.to_string() },
        };
        match race_interrupt(run_command_rows(task, runs), deadline, token).await {
            Ok(outcome) => outcome,
            Err(reason) => interrupt_outcome(reason),
        }
    }

    async fn run_builtin_task(
        &self,
        task: &ChainTask,
        params: &[Value],
        deadline: Option<Duration>,
        token: &CancellationToken,
    ) -> TaskOutcome {
        match race_interrupt(builtins::execute(self, &task.command, params), deadline, token).await
        {
            Ok(Ok(output)) => TaskOutcome::Success { code: 0, output },
            Ok(Err(e)) => TaskOutcome::Failure { code: -1, message: e.to_string() },
            Err(reason) => interrupt_outcome(reason),
        }
    }
}

/// Run the command on a remote connection. Autonomous tasks run in
/// autocommit; everything else gets a transaction around role switch and
/// statements.
async fn exec_remote(conn: &mut PgConnection, task: &ChainTask, params: &[Value]) -> Result<u64> {
    if task.autonomous {
        if let Some(role) = task.run_as.as_deref() {
            db::set_role(conn, role).await?;
        }
        return exec_sql(conn, &task.command, params).await;
    }
    let mut rtx = conn.begin().await?;
    if let Some(role) = task.run_as.as_deref() {
        db::set_role(&mut rtx, role).await?;
    }
    let affected = exec_sql(&mut rtx, &task.command, params).await?;
    rtx.commit().await?;
    Ok(affected)
}

/// Execute a command once without parameters, or once per parameter row
/// with the row's values bound as `$1..$n`.
async fn exec_sql(conn: &mut PgConnection, command: &str, params: &[Value]) -> Result<u64> {
    if params.is_empty() {
        let done = sqlx::raw_sql(command).execute(&mut *conn).await?;
        return Ok(done.rows_affected());
    }
    let mut affected = 0;
    for row in params {
        let Value::Array(args) = row else {
            return Err(Error::validation("parameter row must be a JSON array"));
        };
        let mut query = sqlx::query(command);
        for arg in args {
            query = bind_value(query, arg);
        }
        affected += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Bind a JSON value with the closest Postgres type; arrays and objects go
/// over as jsonb
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<Value>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(value.clone())
            }
        }
        Value::String(s) => query.bind(s.clone()),
        Value::Array(_) | Value::Object(_) => query.bind(value.clone()),
    }
}

async fn run_command_rows(task: &ChainTask, runs: Vec<Vec<String>>) -> TaskOutcome {
    let mut last_output = None;
    for argv in &runs {
        let result = Command::new(&task.command)
            .args(argv)
            .kill_on_drop(true)
            .output()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(e) => return TaskOutcome::Failure { code: -1, message: e.to_string() },
        };
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim().to_string();
        if !text.is_empty() {
            debug!("Output of program task {}: {}", task.task_id, text);
        }
        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            let message = if text.is_empty() {
                format!("program exited with code {code}")
            } else {
                text
            };
            return TaskOutcome::Failure { code, message };
        }
        last_output = (!text.is_empty()).then_some(text);
    }
    TaskOutcome::Success { code: 0, output: last_output }
}

/// Decode parameter rows into argument vectors. Each row must be a JSON
/// array of strings; no rows means a single run without arguments.
fn decode_argv_rows(params: &[Value]) -> Result<Vec<Vec<String>>> {
    if params.is_empty() {
        return Ok(vec![Vec::new()]);
    }
    params
        .iter()
        .map(|row| {
            serde_json::from_value::<Vec<String>>(row.clone()).map_err(|e| {
                Error::validation(format!("program arguments must be an array of strings: {e}"))
            })
        })
        .collect()
}

async fn wait_interrupt(deadline: Option<Duration>, token: &CancellationToken) -> Interrupt {
    match deadline {
        Some(limit) => {
            tokio::select! {
                _ = tokio::time::sleep(limit) => Interrupt::Deadline(limit),
                _ = token.cancelled() => Interrupt::Stop,
            }
        }
        None => {
            token.cancelled().await;
            Interrupt::Stop
        }
    }
}

/// Drive `fut` until it finishes or an interrupt wins the race. Safe only
/// for work that tolerates being dropped midway.
async fn race_interrupt<F>(
    fut: F,
    deadline: Option<Duration>,
    token: &CancellationToken,
) -> std::result::Result<F::Output, Interrupt>
where
    F: Future,
{
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => Ok(out),
        reason = wait_interrupt(deadline, token) => Err(reason),
    }
}

fn interrupt_outcome(reason: Interrupt) -> TaskOutcome {
    match reason {
        Interrupt::Stop => TaskOutcome::Cancelled,
        Interrupt::Deadline(limit) => TaskOutcome::Failure {
            code: -1,
            message: Error::timeout("task", limit.as_millis() as i64).to_string(),
        },
    }
}

/// A completed statement outranks the interrupt that raced it, so this is
/// only consulted on the error path.
fn interrupted_outcome(interrupt: Option<Interrupt>, err: Error) -> TaskOutcome {
    match interrupt {
        Some(reason) => interrupt_outcome(reason),
        None => TaskOutcome::Failure { code: -1, message: err.to_string() },
    }
}

async fn rollback_savepoint_quietly(conn: &mut PgConnection, name: &str) {
    if let Err(e) = db::rollback_to_savepoint(conn, name).await {
        warn!("Cannot roll back to savepoint {}: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_argv_rows() {
        assert_eq!(decode_argv_rows(&[]).unwrap(), vec![Vec::<String>::new()]);

        let rows = vec![json!(["-v", "--out", "a.txt"]), json!([])];
        let runs = decode_argv_rows(&rows).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], vec!["-v", "--out", "a.txt"]);
        assert!(runs[1].is_empty());

        assert!(decode_argv_rows(&[json!("not an array")]).is_err());
        assert!(decode_argv_rows(&[json!([1, 2])]).is_err());
        assert!(decode_argv_rows(&[json!({"a": 1})]).is_err());
    }

    #[test]
    fn test_interrupt_mapping() {
        assert!(matches!(
            interrupt_outcome(Interrupt::Stop),
            TaskOutcome::Cancelled
        ));
        match interrupt_outcome(Interrupt::Deadline(Duration::from_secs(2))) {
            TaskOutcome::Failure { code, message } => {
                assert_eq!(code, -1);
                assert!(message.contains("2000"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_interrupted_outcome_prefers_interrupt_reason() {
        assert!(matches!(
            interrupted_outcome(Some(Interrupt::Stop), Error::task("boom")),
            TaskOutcome::Cancelled
        ));
        match interrupted_outcome(None, Error::task("boom")) {
            TaskOutcome::Failure { code, message } => {
                assert_eq!(code, -1);
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
