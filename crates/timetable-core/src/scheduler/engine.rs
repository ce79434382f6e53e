//! Scheduler execution engine
//!
//! Owns the worker pools, the discovery loop and the notification handling:
//! - Cron and `@reboot` chains are fetched due and queued for the cron pool
//! - Interval chains get a per-chain timer feeding the interval pool
//! - START/STOP notifications bypass the schedule
//! - One polling loop supervises everything and reports connection loss

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::interval;
use super::types::{ChainTicket, RunOutcome, TicketSource};
use crate::config::{Config, REFETCH_TIMEOUT};
use crate::db::{ChainSignal, Gateway, IntervalChain, SignalCommand, SignalListener};
use crate::error::Result;
use crate::logsink::SinkHealth;

/// Cancellation handles of admitted chain runs, keyed by chain id.
///
/// A chain can run more than once concurrently (`max_instances`), so every
/// admitted run registers its own handle.
#[derive(Clone, Default)]
pub struct ActiveRegistry {
    runs: Arc<DashMap<i64, Vec<RunHandle>>>,
}

#[derive(Debug)]
struct RunHandle {
    run_status_id: i64,
    token: CancellationToken,
}

impl ActiveRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, chain_id: i64, run_status_id: i64, token: CancellationToken) {
        self.runs
            .entry(chain_id)
            .or_default()
            .push(RunHandle { run_status_id, token });
    }

    pub(crate) fn remove(&self, chain_id: i64, run_status_id: i64) {
        if let Some(mut handles) = self.runs.get_mut(&chain_id) {
            handles.retain(|h| h.run_status_id != run_status_id);
            drop(handles);
            self.runs.remove_if(&chain_id, |_, v| v.is_empty());
        }
    }

    /// Cancel every running instance of a chain; returns how many were hit
    pub fn cancel_chain(&self, chain_id: i64) -> usize {
        match self.runs.get(&chain_id) {
            Some(handles) => {
                for handle in handles.iter() {
                    handle.token.cancel();
                }
                handles.len()
            }
            None => 0,
        }
    }

    /// Number of chain runs currently registered
    pub fn total(&self) -> usize {
        self.runs.iter().map(|e| e.value().len()).sum()
    }
}

/// Shared handles a worker needs to run one chain end to end
#[derive(Clone)]
pub(crate) struct ChainRunner {
    pub(crate) gateway: Arc<Gateway>,
    pub(crate) config: Arc<Config>,
    pub(crate) active: ActiveRegistry,
    pub(crate) intervals: Arc<DashMap<i64, IntervalChain>>,
    pub(crate) exclusivity: Arc<RwLock<()>>,
}

/// The scheduling engine.
///
/// Constructed once at startup and driven by [`Engine::run`]; the caller
/// re-enters `run` after a reconnect when it returned
/// [`RunOutcome::ConnectionLost`].
pub struct Engine {
    runner: ChainRunner,
    sink_health: Option<Arc<SinkHealth>>,
    dropped_seen: AtomicU64,
}

impl Engine {
    /// Create a new engine over the given gateway and configuration
    pub fn new(gateway: Arc<Gateway>, config: Arc<Config>) -> Self {
        Self {
            runner: ChainRunner {
                gateway,
                config,
                active: ActiveRegistry::new(),
                intervals: Arc::new(DashMap::new()),
                exclusivity: Arc::new(RwLock::new(())),
            },
            sink_health: None,
            dropped_seen: AtomicU64::new(0),
        }
    }

    /// Surface database log-shipping trouble on the engine's polling cadence
    pub fn with_sink_health(mut self, health: Arc<SinkHealth>) -> Self {
        self.sink_health = Some(health);
        self
    }

    /// Cancellation handles of the currently running chains
    pub fn registry(&self) -> &ActiveRegistry {
        &self.runner.active
    }

    /// Run the engine until shutdown or connection loss.
    ///
    /// Dispatches `@reboot` chains once, then polls for due chains every
    /// `REFETCH_TIMEOUT` seconds while serving START/STOP notifications. On
    /// exit the workers finish their current chain but take no new tickets.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunOutcome> {
        info!("Scheduler engine starting");
        let token = shutdown.child_token();

        let mut listener = match SignalListener::connect(&self.runner.gateway).await {
            Ok(listener) => listener,
            Err(e) if e.is_transport() => {
                warn!("Cannot subscribe to notifications: {}", e);
                return Ok(RunOutcome::ConnectionLost);
            }
            Err(e) => return Err(e),
        };

        let (cron_tx, cron_rx) = mpsc::channel(self.runner.config.cron_workers.max(1));
        let (interval_tx, interval_rx) = mpsc::channel(self.runner.config.interval_workers.max(1));
        let mut workers = Vec::new();
        workers.extend(spawn_pool("cron", self.runner.config.cron_workers, &self.runner, cron_rx, &token));
        workers.extend(spawn_pool(
            "interval",
            self.runner.config.interval_workers,
            &self.runner,
            interval_rx,
            &token,
        ));

        let outcome = self.supervise(&mut listener, &cron_tx, &interval_tx, &token).await;

        token.cancel();
        drop(cron_tx);
        drop(interval_tx);
        for worker in workers {
            let _ = worker.await;
        }
        self.runner.intervals.clear();
        info!("Scheduler engine stopped");
        outcome
    }

    async fn supervise(
        &self,
        listener: &mut SignalListener,
        cron_tx: &mpsc::Sender<ChainTicket>,
        interval_tx: &mpsc::Sender<ChainTicket>,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        if self.runner.config.debug {
            info!("Debug mode, only chains started by operator signals execute");
        } else {
            match self.startup_round(cron_tx, interval_tx, token).await {
                Ok(()) => {}
                Err(e) if e.is_transport() => {
                    warn!("Lost database connection: {}", e);
                    return Ok(RunOutcome::ConnectionLost);
                }
                Err(e) => return Err(e),
            }
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Scheduler engine shutting down");
                    return Ok(RunOutcome::Terminated);
                }
                _ = tokio::time::sleep(Duration::from_secs(REFETCH_TIMEOUT)) => {
                    self.report_sink_health();
                    if self.runner.config.debug {
                        continue;
                    }
                    match self.refresh(cron_tx, interval_tx, token).await {
                        Ok(()) => {}
                        Err(e) if e.is_transport() => {
                            warn!("Lost database connection: {}", e);
                            return Ok(RunOutcome::ConnectionLost);
                        }
                        Err(e) => error!("Chain discovery failed: {}", e),
                    }
                }
                signal = listener.recv() => match signal {
                    Ok(signal) => {
                        if let Err(e) = self.handle_signal(signal, cron_tx).await {
                            if e.is_transport() {
                                warn!("Lost database connection: {}", e);
                                return Ok(RunOutcome::ConnectionLost);
                            }
                            error!("Cannot handle chain signal: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("Notification listener failed: {}", e);
                        return Ok(RunOutcome::ConnectionLost);
                    }
                }
            }
        }
    }

    /// `@reboot` chains fire once per daemon start, then the first regular
    /// discovery round runs without waiting a full polling period
    async fn startup_round(
        &self,
        cron_tx: &mpsc::Sender<ChainTicket>,
        interval_tx: &mpsc::Sender<ChainTicket>,
        token: &CancellationToken,
    ) -> Result<()> {
        let boot_chains = self.runner.gateway.select_reboot_chains().await?;
        if !boot_chains.is_empty() {
            info!("Dispatching {} boot chains", boot_chains.len());
        }
        for chain in boot_chains {
            dispatch(cron_tx, ChainTicket::new(chain, TicketSource::Reboot));
        }
        self.refresh(cron_tx, interval_tx, token).await
    }

    async fn refresh(
        &self,
        cron_tx: &mpsc::Sender<ChainTicket>,
        interval_tx: &mpsc::Sender<ChainTicket>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.runner.gateway.ping().await?;
        self.dispatch_due_cron(cron_tx, token).await?;
        self.refresh_intervals(interval_tx, token).await?;
        Ok(())
    }

    async fn dispatch_due_cron(
        &self,
        cron_tx: &mpsc::Sender<ChainTicket>,
        token: &CancellationToken,
    ) -> Result<()> {
        let chains = self.runner.gateway.select_cron_chains().await?;
        debug!("Number of due cron chains: {}", chains.len());
        let pace = spike_pace(chains.len(), self.runner.config.cron_workers);
        if let Some(delay) = pace {
            info!(
                "Pacing dispatch of {} due chains every {} ms",
                chains.len(),
                delay.as_millis()
            );
        }
        for (n, chain) in chains.into_iter().enumerate() {
            if n > 0 {
                if let Some(delay) = pace {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Ok(()),
                    }
                }
            }
            dispatch(cron_tx, ChainTicket::new(chain, TicketSource::Cron));
        }
        Ok(())
    }

    /// Reconcile the interval map with the database: update known chains,
    /// drop vanished ones and start a timer for every newcomer
    async fn refresh_intervals(
        &self,
        interval_tx: &mpsc::Sender<ChainTicket>,
        token: &CancellationToken,
    ) -> Result<()> {
        let fetched = self.runner.gateway.select_interval_chains().await?;
        debug!("Number of active interval chains: {}", fetched.len());
        self.runner
            .intervals
            .retain(|id, _| fetched.iter().any(|c| c.chain.chain_id == *id));
        for ichain in fetched {
            let chain_id = ichain.chain.chain_id;
            match self.runner.intervals.entry(chain_id) {
                Entry::Occupied(mut entry) => {
                    entry.insert(ichain);
                }
                Entry::Vacant(entry) => {
                    entry.insert(ichain);
                    interval::spawn_timer(
                        self.runner.clone(),
                        interval_tx.clone(),
                        chain_id,
                        token.child_token(),
                    );
                }
            }
        }
        Ok(())
    }

    async fn handle_signal(
        &self,
        signal: ChainSignal,
        cron_tx: &mpsc::Sender<ChainTicket>,
    ) -> Result<()> {
        match signal.command {
            SignalCommand::Start => match self.runner.gateway.select_chain(signal.chain_id).await? {
                Some(chain) => {
                    info!("Starting chain {} by operator request", chain.chain_id);
                    dispatch(cron_tx, ChainTicket::new(chain, TicketSource::Operator));
                }
                None => warn!(
                    "Cannot start chain {}: no such chain for this client",
                    signal.chain_id
                ),
            },
            SignalCommand::Stop => {
                let stopped = self.runner.active.cancel_chain(signal.chain_id);
                if stopped > 0 {
                    info!("Stopping {} running instances of chain {}", stopped, signal.chain_id);
                } else {
                    warn!("Cannot stop chain {}: not running", signal.chain_id);
                }
            }
        }
        Ok(())
    }

    fn report_sink_health(&self) {
        let Some(health) = &self.sink_health else { return };
        if let Some(message) = health.take_last_error() {
            warn!("Database log shipping is failing: {}", message);
        }
        let dropped = health.dropped_total();
        let seen = self.dropped_seen.swap(dropped, Ordering::Relaxed);
        if dropped > seen {
            warn!("Dropped {} log records under load", dropped - seen);
        }
    }
}

fn spawn_pool(
    pool: &'static str,
    count: usize,
    runner: &ChainRunner,
    tickets: mpsc::Receiver<ChainTicket>,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let tickets = Arc::new(Mutex::new(tickets));
    (0..count)
        .map(|n| tokio::spawn(worker_loop(runner.clone(), Arc::clone(&tickets), token.clone(), pool, n)))
        .collect()
}

/// One worker: take a ticket, run the chain, repeat. The receiver is shared
/// behind a mutex held only for the duration of the take, so executions
/// themselves run in parallel.
async fn worker_loop(
    runner: ChainRunner,
    tickets: Arc<Mutex<mpsc::Receiver<ChainTicket>>>,
    token: CancellationToken,
    pool: &'static str,
    worker: usize,
) {
    debug!("Started {} worker {}", pool, worker);
    loop {
        let ticket = {
            let mut queue = tickets.lock().await;
            tokio::select! {
                ticket = queue.recv() => ticket,
                _ = token.cancelled() => None,
            }
        };
        let Some(ticket) = ticket else { break };
        runner.run_chain(ticket, &token).await;
    }
    debug!("Stopped {} worker {}", pool, worker);
}

/// Queue a ticket without blocking the producer; a full queue drops the
/// ticket with a warning
pub(crate) fn dispatch(tx: &mpsc::Sender<ChainTicket>, ticket: ChainTicket) {
    let chain_id = ticket.chain.chain_id;
    let source = ticket.source;
    match tx.try_send(ticket) {
        Ok(()) => debug!("Dispatched chain {} ({} run)", chain_id, source.as_str()),
        Err(TrySendError::Full(_)) => {
            warn!("Worker queue full, dropping chain {} ({} run)", chain_id, source.as_str())
        }
        Err(TrySendError::Closed(_)) => debug!("Worker queue closed, dropping chain {}", chain_id),
    }
}

/// Pace between dispatches when one poll returns more due chains than the
/// pool digests in a polling window
pub(crate) fn spike_pace(count: usize, workers: usize) -> Option<Duration> {
    if count > workers.saturating_mul(REFETCH_TIMEOUT as usize) {
        Some(Duration::from_millis(REFETCH_TIMEOUT * 1000 / count as u64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Chain;

    fn test_chain(chain_id: i64) -> Chain {
        Chain {
            chain_id,
            chain_name: format!("chain-{chain_id}"),
            self_destruct: false,
            exclusive_execution: false,
            max_instances: 16,
            timeout_ms: 0,
            on_error: None,
        }
    }

    #[test]
    fn test_registry_tracks_instances() {
        let registry = ActiveRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        registry.insert(7, 100, first.clone());
        registry.insert(7, 101, second.clone());
        registry.insert(8, 102, CancellationToken::new());
        assert_eq!(registry.total(), 3);

        assert_eq!(registry.cancel_chain(7), 2);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());

        registry.remove(7, 100);
        registry.remove(7, 101);
        assert_eq!(registry.total(), 1);
        assert_eq!(registry.cancel_chain(7), 0);
    }

    #[test]
    fn test_registry_unknown_chain() {
        let registry = ActiveRegistry::new();
        assert_eq!(registry.cancel_chain(42), 0);
        registry.remove(42, 1);
        assert_eq!(registry.total(), 0);
    }

    #[test]
    fn test_spike_pace_thresholds() {
        assert_eq!(spike_pace(0, 16), None);
        assert_eq!(spike_pace(16 * 60, 16), None);
        let pace = spike_pace(16 * 60 + 1, 16).unwrap();
        assert_eq!(pace, Duration::from_millis(60_000 / 961));
        // one worker, heavy burst: keep the whole window busy but spread out
        assert_eq!(spike_pace(1000, 1), Some(Duration::from_millis(60)));
    }

    #[tokio::test]
    async fn test_dispatch_drops_on_overflow() {
        let (tx, mut rx) = mpsc::channel(1);
        dispatch(&tx, ChainTicket::new(test_chain(1), TicketSource::Cron));
        dispatch(&tx, ChainTicket::new(test_chain(2), TicketSource::Cron));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.chain.chain_id, 1);
        assert!(rx.try_recv().is_err());
    }
}
