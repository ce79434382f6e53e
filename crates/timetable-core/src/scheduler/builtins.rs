//! The built-in task registry: helpers that run inside the daemon process
//! without shelling out or leaving the scheduler.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use timetable_tasks::{download_urls, send_mail, DownloadOpts, EmailConn};

use super::engine::ChainRunner;
use crate::error::{Error, Result};

/// Run a named builtin once per parameter row; a task without parameters
/// runs once with a null value. The first failing row stops the task and
/// the last row's output is kept.
pub(crate) async fn execute(
    runner: &ChainRunner,
    name: &str,
    params: &[Value],
) -> Result<Option<String>> {
    debug!(
        "Executing builtin task {} with {} parameter rows",
        name,
        params.len()
    );
    if params.is_empty() {
        return dispatch_one(runner, name, &Value::Null).await;
    }
    let mut output = None;
    for value in params {
        output = dispatch_one(runner, name, value).await?;
    }
    Ok(output)
}

async fn dispatch_one(runner: &ChainRunner, name: &str, value: &Value) -> Result<Option<String>> {
    match name {
        "NoOp" => {
            debug!("NoOp task called with value: {}", value);
            Ok(None)
        }
        "Sleep" => {
            sleep_task(value).await?;
            Ok(None)
        }
        "Log" => {
            info!(severity = "USER", "{}", render(value));
            Ok(None)
        }
        "SendMail" => {
            let conn: EmailConn = serde_json::from_value(value.clone())
                .map_err(|e| Error::task(format!("invalid mail parameters: {e}")))?;
            send_mail(&conn).await.map_err(|e| Error::task(e.to_string()))?;
            Ok(None)
        }
        "Download" => {
            let opts: DownloadOpts = serde_json::from_value(value.clone())
                .map_err(|e| Error::task(format!("invalid download parameters: {e}")))?;
            let summary = download_urls(&opts)
                .await
                .map_err(|e| Error::task(e.to_string()))?;
            Ok(Some(summary))
        }
        "CopyFromFile" => copy_from_file(runner, value).await,
        other => Err(Error::task(format!("no built-in task found: {other}"))),
    }
}

async fn sleep_task(value: &Value) -> Result<()> {
    let seconds = value.as_i64().ok_or_else(|| {
        Error::task(format!(
            "sleep duration must be an integer number of seconds, got {value}"
        ))
    })?;
    if seconds < 0 {
        return Err(Error::task(format!(
            "sleep duration cannot be negative, got {seconds}"
        )));
    }
    debug!("Sleep task called for {} seconds", seconds);
    tokio::time::sleep(Duration::from_secs(seconds as u64)).await;
    Ok(())
}

/// Text for the USER log line: strings verbatim, null as empty, anything
/// else as compact JSON
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct CopyFrom {
    sql: String,
    filename: PathBuf,
}

async fn copy_from_file(runner: &ChainRunner, value: &Value) -> Result<Option<String>> {
    let spec: CopyFrom = serde_json::from_value(value.clone())
        .map_err(|e| Error::task(format!("invalid copy parameters: {e}")))?;
    let count = runner.gateway.copy_from_file(&spec.sql, &spec.filename).await?;
    let message = format!("{} rows copied from {}", count, spec.filename.display());
    info!("{}", message);
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sleep_task_validates_input() {
        assert!(sleep_task(&json!("5")).await.is_err());
        assert!(sleep_task(&json!(-1)).await.is_err());
        assert!(sleep_task(&json!(null)).await.is_err());
        assert!(sleep_task(&json!(0)).await.is_ok());
    }

    #[test]
    fn test_render_log_value() {
        assert_eq!(render(&json!("plain text")), "plain text");
        assert_eq!(render(&json!(null)), "");
        assert_eq!(render(&json!({"k": 1})), r#"{"k":1}"#);
        assert_eq!(render(&json!(42)), "42");
    }

    #[test]
    fn test_copy_spec_decoding() {
        let spec: CopyFrom = serde_json::from_value(json!({
            "sql": "COPY location FROM STDIN",
            "filename": "/tmp/locations.csv"
        }))
        .unwrap();
        assert_eq!(spec.sql, "COPY location FROM STDIN");
        assert_eq!(spec.filename, PathBuf::from("/tmp/locations.csv"));
    }
}
