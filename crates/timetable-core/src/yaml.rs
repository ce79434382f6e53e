//! Declarative chain import.
//!
//! `--import chains.yaml` loads chain definitions at startup and writes them
//! to `timetable.chain`, `timetable.task` and `timetable.parameter` in one
//! transaction, so a half-broken file leaves the schedule untouched.
//! Definitions are validated client side first: schedules must parse, task
//! kinds must be known, commands must be non-empty.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::cron::Schedule;
use crate::db::{Gateway, OnError, TaskKind};
use crate::error::{Error, Result};

/// Root of an import file
#[derive(Debug, Deserialize)]
pub struct ChainFile {
    /// Chains in file order
    pub chains: Vec<ChainDef>,
}

/// One chain definition
#[derive(Debug, Deserialize)]
pub struct ChainDef {
    /// Unique chain name
    pub chain_name: String,
    /// Schedule expression; every minute when omitted
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Restrict execution to one client name
    #[serde(default)]
    pub client_name: Option<String>,
    /// Imported chains stay dormant unless marked live
    #[serde(default)]
    pub live: bool,
    /// Delete the chain after its first completed run
    #[serde(default)]
    pub self_destruct: bool,
    /// Run with the exclusivity write lock held
    #[serde(default)]
    pub exclusive_execution: bool,
    /// Concurrent instance cap; the scheduler default applies when omitted
    #[serde(default)]
    pub max_instances: Option<i32>,
    /// Chain deadline in milliseconds, 0 = use the scheduler default
    #[serde(default, alias = "timeout")]
    pub timeout_ms: i64,
    /// Failure policy: continue, stop or ignore
    #[serde(default)]
    pub on_error: Option<String>,
    /// Tasks in execution order
    #[serde(default)]
    pub tasks: Vec<TaskDef>,
}

/// One task of an imported chain
#[derive(Debug, Deserialize)]
pub struct TaskDef {
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,
    /// SQL, PROGRAM or BUILTIN; SQL when omitted
    #[serde(default = "default_kind")]
    pub kind: String,
    /// What to execute
    pub command: String,
    /// Role to `SET ROLE` to for this task
    #[serde(default)]
    pub run_as: Option<String>,
    /// Remote DSN; empty means the state-of-record database
    #[serde(default)]
    pub database_connection: Option<String>,
    /// Treat a failure of this task as success
    #[serde(default)]
    pub ignore_error: bool,
    /// Commit independently of the chain transaction
    #[serde(default)]
    pub autonomous: bool,
    /// Task deadline in milliseconds, 0 = unbounded
    #[serde(default, alias = "timeout")]
    pub timeout_ms: i64,
    /// Stored as a single parameter row
    #[serde(default)]
    pub parameters: Vec<Value>,
}

fn default_schedule() -> String {
    "* * * * *".to_string()
}

fn default_kind() -> String {
    "SQL".to_string()
}

impl ChainFile {
    /// Parse and validate an import file
    pub fn load(path: &Path) -> Result<ChainFile> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if !ext.eq_ignore_ascii_case("yaml") && !ext.eq_ignore_ascii_case("yml") {
            return Err(Error::validation(format!(
                "import file must have a .yaml or .yml extension: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let file: ChainFile = serde_yaml::from_str(&text)
            .map_err(|e| Error::validation(format!("malformed import file: {e}")))?;
        for (i, chain) in file.chains.iter().enumerate() {
            chain.validate().map_err(|e| {
                Error::validation(format!("chain {} ({}): {e}", i + 1, chain.chain_name))
            })?;
        }
        Ok(file)
    }
}

impl ChainDef {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.chain_name.is_empty() {
            return Err("chain name is required".into());
        }
        self.schedule.parse::<Schedule>().map_err(plain)?;
        if let Some(policy) = self.on_error.as_deref() {
            OnError::try_from(policy.to_ascii_lowercase().as_str()).map_err(plain)?;
        }
        if self.timeout_ms < 0 {
            return Err("chain timeout must be non-negative".into());
        }
        if matches!(self.max_instances, Some(n) if n <= 0) {
            return Err("max_instances must be positive".into());
        }
        if self.tasks.is_empty() {
            return Err("chain must have at least one task".into());
        }
        for (i, task) in self.tasks.iter().enumerate() {
            task.validate().map_err(|e| format!("task {}: {e}", i + 1))?;
        }
        Ok(())
    }
}

impl TaskDef {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("task command is required".into());
        }
        TaskKind::try_from(self.kind.as_str()).map_err(plain)?;
        if self.timeout_ms < 0 {
            return Err("task timeout must be non-negative".into());
        }
        Ok(())
    }
}

fn plain(e: Error) -> String {
    match e {
        Error::Validation(msg) => msg,
        other => other.to_string(),
    }
}

/// Import every chain of `path` in one transaction; returns how many
/// chains were written
pub async fn import_file(gateway: &Gateway, path: &Path, replace: bool) -> Result<usize> {
    let file = ChainFile::load(path)?;
    let mut tx = gateway.begin().await?;
    for def in &file.chains {
        import_chain(&mut tx, def, replace).await?;
    }
    tx.commit().await?;
    info!("Imported {} chains from {}", file.chains.len(), path.display());
    Ok(file.chains.len())
}

async fn import_chain(
    tx: &mut Transaction<'static, Postgres>,
    def: &ChainDef,
    replace: bool,
) -> Result<i64> {
    if replace {
        sqlx::query("SELECT timetable.delete_job($1)")
            .bind(&def.chain_name)
            .execute(&mut **tx)
            .await?;
    } else {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM timetable.chain WHERE chain_name = $1)",
        )
        .bind(&def.chain_name)
        .fetch_one(&mut **tx)
        .await?;
        if exists {
            return Err(Error::validation(format!(
                "chain {:?} already exists, use --replace to overwrite",
                def.chain_name
            )));
        }
    }

    let chain_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO timetable.chain \
            (chain_name, run_at, max_instances, timeout_ms, live, self_destruct, \
             exclusive_execution, client_name, on_error) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING chain_id",
    )
    .bind(&def.chain_name)
    .bind(&def.schedule)
    .bind(def.max_instances)
    .bind(def.timeout_ms)
    .bind(def.live)
    .bind(def.self_destruct)
    .bind(def.exclusive_execution)
    .bind(def.client_name.as_deref())
    .bind(def.on_error.as_deref().map(str::to_ascii_lowercase))
    .fetch_one(&mut **tx)
    .await?;

    for (i, task) in def.tasks.iter().enumerate() {
        let task_order = ((i + 1) * 10) as f64;
        let task_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO timetable.task \
                (chain_id, task_order, task_name, kind, command, run_as, \
                 database_connection, ignore_error, autonomous, timeout_ms) \
             VALUES ($1, $2, $3, $4::timetable.command_kind, $5, $6, $7, $8, $9, $10) \
             RETURNING task_id",
        )
        .bind(chain_id)
        .bind(task_order)
        .bind(task.name.as_deref())
        .bind(task.kind.to_ascii_uppercase())
        .bind(&task.command)
        .bind(task.run_as.as_deref())
        .bind(task.database_connection.as_deref())
        .bind(task.ignore_error)
        .bind(task.autonomous)
        .bind(task.timeout_ms)
        .fetch_one(&mut **tx)
        .await?;

        if !task.parameters.is_empty() {
            sqlx::query(
                "INSERT INTO timetable.parameter (task_id, order_id, value) VALUES ($1, 1, $2)",
            )
            .bind(task_id)
            .bind(Value::Array(task.parameters.clone()))
            .execute(&mut **tx)
            .await?;
        }
    }
    info!(
        "Created chain {} [{}] with {} tasks",
        chain_id,
        def.chain_name,
        def.tasks.len()
    );
    Ok(chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_file(name: &str, body: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_complete_file() {
        let (_dir, path) = write_file(
            "chains.yaml",
            r#"
chains:
  - chain_name: nightly-report
    schedule: "5 3 * * *"
    live: true
    timeout: 60000
    on_error: CONTINUE
    tasks:
      - name: refresh
        command: "REFRESH MATERIALIZED VIEW report"
      - kind: program
        command: "/usr/local/bin/publish"
        parameters: [["--target", "s3"]]
        timeout_ms: 5000
"#,
        );
        let file = ChainFile::load(&path).unwrap();
        assert_eq!(file.chains.len(), 1);

        let chain = &file.chains[0];
        assert_eq!(chain.chain_name, "nightly-report");
        assert!(chain.live);
        assert_eq!(chain.timeout_ms, 60_000);
        assert_eq!(chain.tasks.len(), 2);
        // omitted kind falls back to SQL
        assert_eq!(chain.tasks[0].kind, "SQL");
        assert_eq!(chain.tasks[1].timeout_ms, 5_000);
        assert_eq!(chain.tasks[1].parameters, vec![json!(["--target", "s3"])]);
    }

    #[test]
    fn test_schedule_defaults_to_every_minute() {
        let (_dir, path) = write_file(
            "chains.yml",
            "chains:\n  - chain_name: tick\n    tasks:\n      - command: SELECT 1\n",
        );
        let file = ChainFile::load(&path).unwrap();
        assert_eq!(file.chains[0].schedule, "* * * * *");
        assert!(!file.chains[0].live);
    }

    #[test]
    fn test_rejects_wrong_extension() {
        let (_dir, path) = write_file("chains.json", "chains: []\n");
        let err = ChainFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("extension"));
    }

    #[test]
    fn test_rejects_invalid_schedule() {
        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: bad\n    schedule: \"* * *\"\n    tasks:\n      - command: SELECT 1\n",
        );
        let err = ChainFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("5 fields"));
    }

    #[test]
    fn test_rejects_unknown_kind_and_empty_command() {
        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: bad\n    tasks:\n      - kind: SHELL\n        command: ls\n",
        );
        assert!(ChainFile::load(&path).is_err());

        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: bad\n    tasks:\n      - command: \"  \"\n",
        );
        let err = ChainFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("command is required"));
    }

    #[test]
    fn test_rejects_chain_without_tasks() {
        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: empty\n    schedule: \"@reboot\"\n",
        );
        let err = ChainFile::load(&path).unwrap_err();
        assert!(err.to_string().contains("at least one task"));
    }

    #[test]
    fn test_rejects_negative_limits() {
        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: bad\n    max_instances: 0\n    tasks:\n      - command: SELECT 1\n",
        );
        assert!(ChainFile::load(&path).is_err());

        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: bad\n    timeout: -5\n    tasks:\n      - command: SELECT 1\n",
        );
        assert!(ChainFile::load(&path).is_err());
    }

    #[test]
    fn test_accepts_interval_macros() {
        let (_dir, path) = write_file(
            "chains.yaml",
            "chains:\n  - chain_name: beat\n    schedule: \"@every 5m\"\n    tasks:\n      - command: SELECT 1\n",
        );
        assert!(ChainFile::load(&path).is_ok());
    }
}
