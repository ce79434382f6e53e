//! Entity rows and the queries that load and update them.
//!
//! Each query shape has its own row struct with an explicit column list;
//! enum-ish text columns are converted through `TryFrom`/accessors so a bad
//! value surfaces as an error instead of a panic.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

use super::listener::{ChainSignal, SignalCommand};
use super::Gateway;
use crate::error::{Error, Result};

/// Execution state of a chain run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Admitted, nothing executed yet
    Started,
    /// A task is executing
    TaskStarted,
    /// The last reported task finished
    TaskDone,
    /// Terminal success
    ChainDone,
    /// Terminal failure (including cancellation)
    ChainFailed,
    /// Written by the leftover sweep for runs lost to a crash or outage
    Dead,
}

impl RunState {
    /// Wire value stored in `timetable.run_status.execution_status`
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "STARTED",
            RunState::TaskStarted => "TASK_STARTED",
            RunState::TaskDone => "TASK_DONE",
            RunState::ChainDone => "CHAIN_DONE",
            RunState::ChainFailed => "CHAIN_FAILED",
            RunState::Dead => "DEAD",
        }
    }

    /// Whether this state ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::ChainDone | RunState::ChainFailed | RunState::Dead)
    }
}

/// Task command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// SQL script against the task's connection
    Sql,
    /// Executable looked up on PATH
    Program,
    /// Named entry of the built-in registry
    Builtin,
}

impl TryFrom<&str> for TaskKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SQL" => Ok(TaskKind::Sql),
            "PROGRAM" => Ok(TaskKind::Program),
            "BUILTIN" => Ok(TaskKind::Builtin),
            other => Err(Error::validation(format!("unknown task kind {other:?}"))),
        }
    }
}

impl TaskKind {
    /// Wire value stored in `timetable.task.kind`
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Sql => "SQL",
            TaskKind::Program => "PROGRAM",
            TaskKind::Builtin => "BUILTIN",
        }
    }
}

/// Chain-level policy applied when a task errors and `ignore_error` is unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Record the failure and move to the next task
    Continue,
    /// Fail the chain
    #[default]
    Stop,
    /// Treat the failure as success
    Ignore,
}

impl TryFrom<&str> for OnError {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "continue" => Ok(OnError::Continue),
            "stop" => Ok(OnError::Stop),
            "ignore" => Ok(OnError::Ignore),
            other => Err(Error::validation(format!("unknown on_error policy {other:?}"))),
        }
    }
}

/// A runnable chain header as the discoverers load it
#[derive(Debug, Clone, FromRow)]
pub struct Chain {
    /// Chain identifier
    pub chain_id: i64,
    /// Human-readable unique name
    pub chain_name: String,
    /// Delete the chain row after a completed run
    pub self_destruct: bool,
    /// Forbid concurrent execution of any other chain while this one runs
    pub exclusive_execution: bool,
    /// Concurrent-instance bound for this chain
    pub max_instances: i32,
    /// Per-chain deadline in milliseconds, 0 = use the global default
    pub timeout_ms: i64,
    /// Error policy, NULL behaves as `stop`
    pub on_error: Option<String>,
}

impl Chain {
    /// Parsed error policy; NULL and unknown values fall back to `stop`
    pub fn on_error(&self) -> OnError {
        self.on_error
            .as_deref()
            .and_then(|s| OnError::try_from(s).ok())
            .unwrap_or_default()
    }
}

/// An interval chain header with its repetition policy
#[derive(Debug, Clone, FromRow)]
pub struct IntervalChain {
    /// The chain header
    #[sqlx(flatten)]
    pub chain: Chain,
    /// Repetition period, seconds
    pub interval_seconds: i32,
    /// true = `@after` (period starts at completion), false = `@every`
    pub repeat_after: bool,
}

/// One task of a chain, in execution order
#[derive(Debug, Clone, FromRow)]
pub struct ChainTask {
    /// Task identifier
    pub task_id: i64,
    /// Optional display name
    pub task_name: Option<String>,
    /// Command kind as stored; see [`ChainTask::kind`]
    pub kind: String,
    /// SQL script, program name or builtin name
    pub command: String,
    /// Role to `SET ROLE` to for SQL tasks
    pub run_as: Option<String>,
    /// Remote DSN; when set the task runs on its own connection
    pub database_connection: Option<String>,
    /// Treat a failure of this task as success
    pub ignore_error: bool,
    /// Run outside the chain transaction on a dedicated connection
    pub autonomous: bool,
    /// Per-task deadline in milliseconds, 0 = use the global default
    pub timeout_ms: i64,
}

impl ChainTask {
    /// Parsed command kind
    pub fn kind(&self) -> Result<TaskKind> {
        TaskKind::try_from(self.kind.as_str())
    }

    /// Whether the task runs against a remote database
    pub fn is_remote(&self) -> bool {
        self.database_connection.as_deref().is_some_and(|s| !s.is_empty())
    }
}

const CHAIN_COLUMNS: &str = "c.chain_id, c.chain_name, c.self_destruct, c.exclusive_execution, \
     COALESCE(c.max_instances, 16) AS max_instances, c.timeout_ms, c.on_error";

impl Gateway {
    /// Chains whose CRON expression is due at this minute.
    ///
    /// Matching is performed server-side by `timetable.is_cron_in_time`; a
    /// NULL schedule matches every poll.
    pub async fn select_cron_chains(&self) -> Result<Vec<Chain>> {
        let sql = format!(
            "SELECT {CHAIN_COLUMNS} FROM timetable.chain c \
             WHERE c.live AND (c.client_name = $1 OR c.client_name IS NULL) \
               AND NOT COALESCE(starts_with(c.run_at, '@'), FALSE) \
               AND timetable.is_cron_in_time(c.run_at, now())"
        );
        let chains = sqlx::query_as::<_, Chain>(&sql)
            .bind(&self.client_name)
            .fetch_all(self.pool())
            .await?;
        Ok(chains)
    }

    /// Chains scheduled with `@reboot`, dispatched once per daemon start
    pub async fn select_reboot_chains(&self) -> Result<Vec<Chain>> {
        let sql = format!(
            "SELECT {CHAIN_COLUMNS} FROM timetable.chain c \
             WHERE c.live AND (c.client_name = $1 OR c.client_name IS NULL) \
               AND c.run_at = '@reboot'"
        );
        let chains = sqlx::query_as::<_, Chain>(&sql)
            .bind(&self.client_name)
            .fetch_all(self.pool())
            .await?;
        Ok(chains)
    }

    /// Chains scheduled with `@every` or `@after`, with the parsed period
    pub async fn select_interval_chains(&self) -> Result<Vec<IntervalChain>> {
        let sql = format!(
            "SELECT {CHAIN_COLUMNS}, \
               EXTRACT(EPOCH FROM (substr(c.run_at, 7))::interval)::int4 AS interval_seconds, \
               starts_with(c.run_at, '@after') AS repeat_after \
             FROM timetable.chain c \
             WHERE c.live AND (c.client_name = $1 OR c.client_name IS NULL) \
               AND substr(c.run_at, 1, 6) IN ('@every', '@after')"
        );
        let chains = sqlx::query_as::<_, IntervalChain>(&sql)
            .bind(&self.client_name)
            .fetch_all(self.pool())
            .await?;
        Ok(chains)
    }

    /// A single chain header by id, regardless of `live`.
    ///
    /// Backs the START signal, which is an explicit operator action.
    pub async fn select_chain(&self, chain_id: i64) -> Result<Option<Chain>> {
        let sql = format!(
            "SELECT {CHAIN_COLUMNS} FROM timetable.chain c \
             WHERE c.chain_id = $1 AND (c.client_name = $2 OR c.client_name IS NULL)"
        );
        let chain = sqlx::query_as::<_, Chain>(&sql)
            .bind(chain_id)
            .bind(&self.client_name)
            .fetch_optional(self.pool())
            .await?;
        Ok(chain)
    }

    /// Ordered tasks of a chain
    pub async fn select_chain_tasks(&self, chain_id: i64) -> Result<Vec<ChainTask>> {
        let tasks = sqlx::query_as::<_, ChainTask>(
            "SELECT t.task_id, t.task_name, t.kind::text AS kind, t.command, t.run_as, \
                    t.database_connection, t.ignore_error, t.autonomous, t.timeout_ms \
             FROM timetable.task t WHERE t.chain_id = $1 ORDER BY t.task_order ASC",
        )
        .bind(chain_id)
        .fetch_all(self.pool())
        .await?;
        Ok(tasks)
    }

    /// Positional parameter values of a task, `order_id` ascending
    pub async fn select_task_parameters(&self, task_id: i64) -> Result<Vec<Value>> {
        let values = sqlx::query_scalar::<_, Value>(
            "SELECT value FROM timetable.parameter \
             WHERE task_id = $1 AND value IS NOT NULL ORDER BY order_id ASC",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        Ok(values)
    }

    /// Atomic admission: insert a `STARTED` run-status row and return its id
    /// only while fewer than `max_instances` instances of the chain run.
    ///
    /// Returns `None` when the chain is at capacity; the caller drops the
    /// ticket.
    pub async fn try_start_chain(&self, chain_id: i64, max_instances: i32) -> Result<Option<i64>> {
        let run_status_id = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT timetable.try_start_chain($1, $2, $3)",
        )
        .bind(chain_id)
        .bind(max_instances)
        .bind(&self.client_name)
        .fetch_one(self.pool())
        .await?;
        Ok(run_status_id)
    }

    /// Advance a run to a non-terminal state
    pub async fn update_run_status(&self, run_status_id: i64, state: RunState) -> Result<()> {
        if state.is_terminal() {
            return Err(Error::Invariant(format!(
                "update_run_status called with terminal state {}",
                state.as_str()
            )));
        }
        sqlx::query(
            "UPDATE timetable.run_status SET execution_status = $2, last_update = now() \
             WHERE run_status_id = $1",
        )
        .bind(run_status_id)
        .bind(state.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Finish a run: write the terminal state and clear the active-chain row
    pub async fn finish_chain(&self, run_status_id: i64, state: RunState) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::Invariant(format!(
                "finish_chain called with non-terminal state {}",
                state.as_str()
            )));
        }
        sqlx::query(
            "WITH done AS ( \
                UPDATE timetable.run_status SET execution_status = $2, last_update = now() \
                WHERE run_status_id = $1) \
             DELETE FROM timetable.active_chain WHERE run_status_id = $1",
        )
        .bind(run_status_id)
        .bind(state.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Leftover sweep: mark runs of this client that have no terminal state
    /// and were last updated before `session_start` as `DEAD`.
    ///
    /// Returns the number of runs repaired.
    pub async fn fix_leftovers(&self, session_start: DateTime<Utc>) -> Result<i64> {
        let swept = sqlx::query_scalar::<_, i64>(
            "WITH stale AS ( \
                UPDATE timetable.run_status \
                   SET execution_status = 'DEAD', last_update = now() \
                 WHERE client_name = $1 \
                   AND execution_status NOT IN ('CHAIN_DONE', 'CHAIN_FAILED', 'DEAD') \
                   AND last_update < $2 \
             RETURNING run_status_id), \
             cleared AS ( \
                DELETE FROM timetable.active_chain \
                 WHERE run_status_id IN (SELECT run_status_id FROM stale)) \
             SELECT count(*) FROM stale",
        )
        .bind(&self.client_name)
        .bind(session_start)
        .fetch_one(self.pool())
        .await?;
        Ok(swept)
    }

    /// Number of currently running instances of a chain, via the contract
    /// function `timetable.get_running_jobs`
    pub async fn running_instances(&self, chain_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM timetable.get_running_jobs($1)",
        )
        .bind(chain_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Record one task execution in `timetable.execution_log`
    #[allow(clippy::too_many_arguments)]
    pub async fn log_task_execution(
        &self,
        chain_id: i64,
        task: &ChainTask,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        return_code: i32,
        output: Option<&str>,
    ) -> Result<()> {
        let duration_us = (finished_at - started_at).num_microseconds().unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO timetable.execution_log \
             (chain_id, task_id, task_name, kind, command, started_at, finished_at, \
              duration_us, return_code, output, client_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(chain_id)
        .bind(task.task_id)
        .bind(&task.task_name)
        .bind(&task.kind)
        .bind(&task.command)
        .bind(started_at)
        .bind(finished_at)
        .bind(duration_us)
        .bind(return_code)
        .bind(output)
        .bind(&self.client_name)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Delete a chain row; used by self-destruct
    pub async fn delete_chain(&self, chain_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM timetable.chain WHERE chain_id = $1")
            .bind(chain_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a chain by name via the contract function
    /// `timetable.delete_job`; used by the import replace mode
    pub async fn delete_job(&self, chain_name: &str) -> Result<bool> {
        let deleted = sqlx::query_scalar::<_, bool>("SELECT timetable.delete_job($1)")
            .bind(chain_name)
            .fetch_one(self.pool())
            .await?;
        Ok(deleted)
    }

    /// Ask this client to start a chain now, through the same notification
    /// channel operators use
    pub async fn notify_chain_start(&self, chain_id: i64) -> Result<()> {
        self.notify_chain(chain_id, SignalCommand::Start).await
    }

    /// Ask this client to cancel the running instances of a chain
    pub async fn notify_chain_stop(&self, chain_id: i64) -> Result<()> {
        self.notify_chain(chain_id, SignalCommand::Stop).await
    }

    async fn notify_chain(&self, chain_id: i64, command: SignalCommand) -> Result<()> {
        let signal = ChainSignal {
            chain_id,
            command,
            ts: Utc::now().timestamp(),
        };
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(self.client_name())
            .bind(serde_json::to_string(&signal)?)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_parsing() {
        assert_eq!(TaskKind::try_from("SQL").unwrap(), TaskKind::Sql);
        assert_eq!(TaskKind::try_from("program").unwrap(), TaskKind::Program);
        assert_eq!(TaskKind::try_from("Builtin").unwrap(), TaskKind::Builtin);
        assert!(TaskKind::try_from("SHELL").is_err());
    }

    #[test]
    fn test_on_error_defaults_to_stop() {
        let mut chain = Chain {
            chain_id: 1,
            chain_name: "c".into(),
            self_destruct: false,
            exclusive_execution: false,
            max_instances: 16,
            timeout_ms: 0,
            on_error: None,
        };
        assert_eq!(chain.on_error(), OnError::Stop);
        chain.on_error = Some("continue".into());
        assert_eq!(chain.on_error(), OnError::Continue);
        chain.on_error = Some("whatever".into());
        assert_eq!(chain.on_error(), OnError::Stop);
    }

    #[test]
    fn test_run_state_terminality() {
        assert!(RunState::ChainDone.is_terminal());
        assert!(RunState::ChainFailed.is_terminal());
        assert!(RunState::Dead.is_terminal());
        assert!(!RunState::Started.is_terminal());
        assert!(!RunState::TaskStarted.is_terminal());
        assert!(!RunState::TaskDone.is_terminal());
    }

    #[test]
    fn test_remote_detection() {
        let mut task = ChainTask {
            task_id: 1,
            task_name: None,
            kind: "SQL".into(),
            command: "SELECT 1".into(),
            run_as: None,
            database_connection: None,
            ignore_error: false,
            autonomous: false,
            timeout_ms: 0,
        };
        assert!(!task.is_remote());
        task.database_connection = Some(String::new());
        assert!(!task.is_remote());
        task.database_connection = Some("postgres://remote/db".into());
        assert!(task.is_remote());
    }
}
