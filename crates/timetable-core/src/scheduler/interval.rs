//! Interval chain timers: one task per `@every`/`@after` chain, producing
//! a ticket each period for as long as the chain stays in the interval map.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::{dispatch, ChainRunner};
use super::types::{ChainTicket, TicketSource};

/// Spawn the timer task for one interval chain.
///
/// The timer lives until the chain leaves the interval map, the token is
/// cancelled or the ticket channel closes. Each round sleeps one period
/// before dispatching, so a freshly discovered chain runs for the first
/// time one period after discovery.
pub(crate) fn spawn_timer(
    runner: ChainRunner,
    tickets: mpsc::Sender<ChainTicket>,
    chain_id: i64,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        debug!("Interval timer started for chain {}", chain_id);
        loop {
            let Some(period) = current_period(&runner, chain_id) else {
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = token.cancelled() => break,
            }
            // re-read the entry: the poller may have updated or removed
            // the chain while the timer slept
            let Some(entry) = runner.intervals.get(&chain_id).map(|e| e.value().clone()) else {
                break;
            };
            let mut ticket = ChainTicket::new(entry.chain, TicketSource::Interval);
            if entry.repeat_after {
                let (done_tx, done_rx) = oneshot::channel();
                ticket.done = Some(done_tx);
                dispatch(&tickets, ticket);
                tokio::select! {
                    // a dropped sender wakes this too, so a refused run is
                    // retried one period later
                    _ = done_rx => {}
                    _ = token.cancelled() => break,
                }
            } else {
                dispatch(&tickets, ticket);
            }
        }
        debug!("Interval timer stopped for chain {}", chain_id);
    });
}

fn current_period(runner: &ChainRunner, chain_id: i64) -> Option<Duration> {
    runner
        .intervals
        .get(&chain_id)
        .map(|entry| period_of(entry.interval_seconds))
}

fn period_of(seconds: i32) -> Duration {
    Duration::from_secs(seconds.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_clamps_to_a_second() {
        assert_eq!(period_of(90), Duration::from_secs(90));
        assert_eq!(period_of(1), Duration::from_secs(1));
        assert_eq!(period_of(0), Duration::from_secs(1));
        assert_eq!(period_of(-5), Duration::from_secs(1));
    }
}
