//! One chain from ticket to terminal state: admission, exclusivity,
//! deadline, the task loop and the final run-status write.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::ChainRunner;
use super::types::{ChainRunResult, ChainTicket, TaskStatus};
use crate::db::{self, Chain, RunState};
use crate::error::Result;

impl ChainRunner {
    /// Run one ticket to completion. Never fails the worker: every error
    /// ends in a log line and, when possible, a terminal run-status row.
    pub(crate) async fn run_chain(&self, ticket: ChainTicket, worker_token: &CancellationToken) {
        let ChainTicket { chain, source, done } = ticket;
        let run_status_id = match self
            .gateway
            .try_start_chain(chain.chain_id, chain.max_instances)
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(
                    "Cannot proceed with chain {}: {} instances already running",
                    chain.chain_id, chain.max_instances
                );
                return;
            }
            Err(e) => {
                error!("Cannot admit chain {}: {}", chain.chain_id, e);
                return;
            }
        };
        info!(
            "Executing chain {} [{}] ({} run)",
            chain.chain_id,
            chain.chain_name,
            source.as_str()
        );

        let outcome = if chain.exclusive_execution {
            let _guard = self.exclusivity.write().await;
            self.execute_admitted(&chain, run_status_id, worker_token).await
        } else {
            let _guard = self.exclusivity.read().await;
            self.execute_admitted(&chain, run_status_id, worker_token).await
        };

        self.finalize_chain(&chain, run_status_id, outcome).await;

        // @after timers measure their period from here
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn execute_admitted(
        &self,
        chain: &Chain,
        run_status_id: i64,
        parent: &CancellationToken,
    ) -> Result<ChainRunResult> {
        let chain_token = parent.child_token();
        self.active.insert(chain.chain_id, run_status_id, chain_token.clone());
        let result = self.execute_with_deadline(chain, run_status_id, &chain_token).await;
        self.active.remove(chain.chain_id, run_status_id);
        result
    }

    async fn execute_with_deadline(
        &self,
        chain: &Chain,
        run_status_id: i64,
        chain_token: &CancellationToken,
    ) -> Result<ChainRunResult> {
        let deadline = effective_timeout(chain.timeout_ms, self.config.chain_timeout_ms);
        let run = self.execute_chain_tasks(chain, run_status_id, chain_token);
        tokio::pin!(run);
        match deadline {
            Some(limit) => {
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::time::sleep(limit) => {
                        warn!("Chain {} hit its deadline of {} ms", chain.chain_id, limit.as_millis());
                        chain_token.cancel();
                        // the task loop observes the cancellation and rolls
                        // back before returning
                        run.await
                    }
                }
            }
            None => run.await,
        }
    }

    async fn finalize_chain(
        &self,
        chain: &Chain,
        run_status_id: i64,
        outcome: Result<ChainRunResult>,
    ) {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("Chain {} aborted: {}", chain.chain_id, e);
                // with the database gone this write fails as well and the
                // leftover sweep repairs the row after the reconnect
                if let Err(e) = self
                    .gateway
                    .finish_chain(run_status_id, RunState::ChainFailed)
                    .await
                {
                    debug!("Cannot finalize chain {}: {}", chain.chain_id, e);
                }
                return;
            }
        };

        if let Err(e) = self
            .gateway
            .finish_chain(run_status_id, result.terminal_state())
            .await
        {
            error!("Cannot record result of chain {}: {}", chain.chain_id, e);
        }
        match result {
            ChainRunResult::Done => info!("Chain {} executed successfully", chain.chain_id),
            ChainRunResult::Failed => error!("Chain {} failed", chain.chain_id),
            ChainRunResult::Cancelled => warn!("Chain {} cancelled", chain.chain_id),
        }
        if chain.self_destruct && result.completes_chain() {
            self.self_destruct(chain).await;
        }
    }

    /// Delete a completed self-destructing chain and stop its interval timer
    async fn self_destruct(&self, chain: &Chain) {
        match self.gateway.delete_chain(chain.chain_id).await {
            Ok(true) => info!("Chain {} deleted after completed run", chain.chain_id),
            Ok(false) => debug!("Chain {} already deleted", chain.chain_id),
            Err(e) => error!("Cannot delete chain {}: {}", chain.chain_id, e),
        }
        self.intervals.remove(&chain.chain_id);
    }

    /// The per-task loop. Non-autonomous SQL tasks share one transaction,
    /// committed only when the loop reaches the end.
    async fn execute_chain_tasks(
        &self,
        chain: &Chain,
        run_status_id: i64,
        token: &CancellationToken,
    ) -> Result<ChainRunResult> {
        let tasks = self.gateway.select_chain_tasks(chain.chain_id).await?;
        if tasks.is_empty() {
            debug!("Chain {} has no tasks", chain.chain_id);
            return Ok(ChainRunResult::Done);
        }

        let mut tx = self.gateway.begin().await?;
        let chain_pid = db::backend_pid(&mut tx).await?;
        for task in &tasks {
            if token.is_cancelled() {
                rollback_quietly(tx, chain.chain_id).await;
                return Ok(ChainRunResult::Cancelled);
            }
            self.gateway
                .update_run_status(run_status_id, RunState::TaskStarted)
                .await?;
            debug!("Starting task {} of chain {}", task.task_id, chain.chain_id);

            let report = self.run_task(chain, task, &mut tx, chain_pid, token).await;
            self.gateway
                .log_task_execution(
                    chain.chain_id,
                    task,
                    report.started_at,
                    report.finished_at,
                    report.code,
                    report.output.as_deref(),
                )
                .await?;

            match report.status {
                TaskStatus::Ok => {
                    debug!("Task {} executed successfully", task.task_id);
                    self.gateway
                        .update_run_status(run_status_id, RunState::TaskDone)
                        .await?;
                }
                TaskStatus::IgnoredError => {
                    info!(
                        "Ignoring failure of task {} in chain {}",
                        task.task_id, chain.chain_id
                    );
                    self.gateway
                        .update_run_status(run_status_id, RunState::TaskDone)
                        .await?;
                }
                TaskStatus::FatalError => {
                    error!("Task {} failed, stopping chain {}", task.task_id, chain.chain_id);
                    rollback_quietly(tx, chain.chain_id).await;
                    return Ok(ChainRunResult::Failed);
                }
                TaskStatus::Cancelled => {
                    rollback_quietly(tx, chain.chain_id).await;
                    return Ok(ChainRunResult::Cancelled);
                }
            }
        }
        tx.commit().await?;
        Ok(ChainRunResult::Done)
    }
}

/// Rollback is logged, never surfaced
async fn rollback_quietly(tx: sqlx::Transaction<'static, sqlx::Postgres>, chain_id: i64) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback for chain {} failed: {}", chain_id, e);
    }
}

/// Deadline from the row value, falling back to the global configuration;
/// zero in both places means unbounded
pub(crate) fn effective_timeout(row_ms: i64, global_ms: i64) -> Option<Duration> {
    let ms = if row_ms > 0 { row_ms } else { global_ms };
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

#[allow(dead_code)]
mod __send_probe {
    use super::*;
    use crate::scheduler::types::ChainTicket;

    fn is_send<T: Send>(_t: T) {}

    fn p_run_chain<'a>(r: &'a ChainRunner, t: ChainTicket, tok: &'a CancellationToken) {
        is_send(r.run_chain(t, tok));
    }
    fn p_execute_admitted<'a>(r: &'a ChainRunner, c: &'a Chain, tok: &'a CancellationToken) {
        is_send(r.execute_admitted(c, 0, tok));
    }
    fn p_execute_with_deadline<'a>(r: &'a ChainRunner, c: &'a Chain, tok: &'a CancellationToken) {
        is_send(r.execute_with_deadline(c, 0, tok));
    }
    fn p_execute_chain_tasks<'a>(r: &'a ChainRunner, c: &'a Chain, tok: &'a CancellationToken) {
        is_send(r.execute_chain_tasks(c, 0, tok));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout_precedence() {
        assert_eq!(effective_timeout(0, 0), None);
        assert_eq!(effective_timeout(5_000, 0), Some(Duration::from_secs(5)));
        assert_eq!(effective_timeout(0, 3_000), Some(Duration::from_secs(3)));
        assert_eq!(effective_timeout(250, 3_000), Some(Duration::from_millis(250)));
        // negative row values behave like "unset"
        assert_eq!(effective_timeout(-1, 1_000), Some(Duration::from_secs(1)));
    }
}
