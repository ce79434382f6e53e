//! Shared types threaded through the scheduling engine.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::db::{Chain, OnError, RunState};

/// Why the engine's run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The database became unreachable; the caller should reconnect, sweep
    /// leftovers and run the engine again
    ConnectionLost,
    /// The shutdown signal fired
    Terminated,
}

/// Who put a chain on the worker queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TicketSource {
    /// The cron discoverer
    Cron,
    /// The `@reboot` startup sweep
    Reboot,
    /// An interval timer
    Interval,
    /// A START notification
    Operator,
}

impl TicketSource {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            TicketSource::Cron => "cron",
            TicketSource::Reboot => "reboot",
            TicketSource::Interval => "interval",
            TicketSource::Operator => "operator",
        }
    }
}

/// One unit of work for a worker: a chain head plus its dispatch origin.
///
/// `done` carries the completion notifier of an `@after` timer; dropping the
/// ticket (queue overflow, admission refusal, shutdown) drops the sender,
/// which the timer observes as "go around and try again later".
pub(crate) struct ChainTicket {
    pub(crate) chain: Chain,
    pub(crate) source: TicketSource,
    pub(crate) done: Option<oneshot::Sender<()>>,
}

impl ChainTicket {
    pub(crate) fn new(chain: Chain, source: TicketSource) -> Self {
        Self { chain, source, done: None }
    }
}

/// Terminal outcome of one chain run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainRunResult {
    /// Every task completed or had its failure routed to "proceed"
    Done,
    /// A fatal task error or a failed commit
    Failed,
    /// Stopped by operator signal, deadline or shutdown
    Cancelled,
}

impl ChainRunResult {
    /// The run-status row written for this outcome. Cancellation reports
    /// `CHAIN_FAILED`, never `DEAD`; `DEAD` is reserved for the leftover
    /// sweep.
    pub(crate) fn terminal_state(&self) -> RunState {
        match self {
            ChainRunResult::Done => RunState::ChainDone,
            ChainRunResult::Failed | ChainRunResult::Cancelled => RunState::ChainFailed,
        }
    }

    /// Self-destruct applies to completed runs only, not to cancellations
    pub(crate) fn completes_chain(&self) -> bool {
        matches!(self, ChainRunResult::Done | ChainRunResult::Failed)
    }
}

/// Outcome of a single task invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskStatus {
    /// Executed without error
    Ok,
    /// Errored, routed to "proceed" by `ignore_error` or the chain policy
    IgnoredError,
    /// Errored fatally; the chain stops
    FatalError,
    /// Interrupted by chain cancellation
    Cancelled,
}

impl TaskStatus {
    /// Route a task failure through the per-task flag and the chain policy
    pub(crate) fn for_failure(ignore_error: bool, on_error: OnError) -> TaskStatus {
        if ignore_error {
            return TaskStatus::IgnoredError;
        }
        match on_error {
            OnError::Continue | OnError::Ignore => TaskStatus::IgnoredError,
            OnError::Stop => TaskStatus::FatalError,
        }
    }
}

/// What a task invocation produced, before error routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Success { code: i32, output: Option<String> },
    Failure { code: i32, message: String },
    Cancelled,
}

/// A finished task with everything the execution log wants
#[derive(Debug, Clone)]
pub(crate) struct TaskReport {
    pub(crate) status: TaskStatus,
    pub(crate) code: i32,
    pub(crate) output: Option<String>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_routing() {
        assert_eq!(TaskStatus::for_failure(true, OnError::Stop), TaskStatus::IgnoredError);
        assert_eq!(TaskStatus::for_failure(false, OnError::Stop), TaskStatus::FatalError);
        assert_eq!(TaskStatus::for_failure(false, OnError::Continue), TaskStatus::IgnoredError);
        assert_eq!(TaskStatus::for_failure(false, OnError::Ignore), TaskStatus::IgnoredError);
    }

    #[test]
    fn test_terminal_states() {
        assert_eq!(ChainRunResult::Done.terminal_state(), RunState::ChainDone);
        assert_eq!(ChainRunResult::Failed.terminal_state(), RunState::ChainFailed);
        assert_eq!(ChainRunResult::Cancelled.terminal_state(), RunState::ChainFailed);
    }

    #[test]
    fn test_self_destruct_applicability() {
        assert!(ChainRunResult::Done.completes_chain());
        assert!(ChainRunResult::Failed.completes_chain());
        assert!(!ChainRunResult::Cancelled.completes_chain());
    }

    #[test]
    fn test_ticket_source_labels() {
        assert_eq!(TicketSource::Cron.as_str(), "cron");
        assert_eq!(TicketSource::Operator.as_str(), "operator");
    }
}
