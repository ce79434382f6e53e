//! Operator signals over `LISTEN`/`NOTIFY`.
//!
//! The scheduler listens on the channel named after its client name. A
//! payload is a small JSON document, for example
//! `{"ConfigID": 42, "Command": "START", "Ts": 1718000000}`. PostgreSQL may
//! deliver the same notification more than once across reconnects, so a
//! bounded window of recently seen payloads suppresses duplicates.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use tracing::{debug, warn};

use super::Gateway;
use crate::error::Result;

/// Notifications remembered for duplicate suppression
const DEDUP_CAPACITY: usize = 10_000;

/// Operator command carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalCommand {
    /// Run the chain now, bypassing its schedule
    Start,
    /// Cancel the running instances of the chain
    Stop,
}

/// Parsed and validated notification payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSignal {
    /// Target chain
    #[serde(rename = "ConfigID")]
    pub chain_id: i64,
    /// What to do with it
    #[serde(rename = "Command")]
    pub command: SignalCommand,
    /// Sender timestamp, unix seconds; informational
    #[serde(rename = "Ts")]
    pub ts: i64,
}

impl ChainSignal {
    fn parse(payload: &str) -> std::result::Result<Self, String> {
        let signal: ChainSignal =
            serde_json::from_str(payload).map_err(|e| e.to_string())?;
        if signal.chain_id <= 0 {
            return Err(format!("ConfigID must be positive, got {}", signal.chain_id));
        }
        Ok(signal)
    }
}

/// Receives chain signals for one scheduler session
pub struct SignalListener {
    listener: PgListener,
    dedup: DedupWindow,
}

impl SignalListener {
    /// Connect and subscribe to the channel named after the client
    pub async fn connect(gateway: &Gateway) -> Result<Self> {
        let mut listener = PgListener::connect_with(gateway.pool()).await?;
        listener.listen(gateway.client_name()).await?;
        Ok(Self {
            listener,
            dedup: DedupWindow::new(DEDUP_CAPACITY),
        })
    }

    /// Next valid, non-duplicate signal.
    ///
    /// Malformed payloads are logged and skipped. An error means the
    /// connection is gone and could not be re-established.
    pub async fn recv(&mut self) -> Result<ChainSignal> {
        loop {
            let notification = self.listener.recv().await?;
            if !self.dedup.insert(
                notification.channel(),
                notification.payload(),
                notification.process_id(),
            ) {
                debug!(payload = notification.payload(), "Duplicate notification dropped");
                continue;
            }
            match ChainSignal::parse(notification.payload()) {
                Ok(signal) => return Ok(signal),
                Err(e) => {
                    warn!(
                        payload = notification.payload(),
                        error = %e,
                        "Invalid notification payload skipped"
                    );
                }
            }
        }
    }
}

/// FIFO-evicting set of recently seen notifications
struct DedupWindow {
    seen: HashSet<(String, String, u32)>,
    order: VecDeque<(String, String, u32)>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember a notification; false means it was already in the window
    fn insert(&mut self, channel: &str, payload: &str, pid: u32) -> bool {
        let key = (channel.to_owned(), payload.to_owned(), pid);
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_signal() {
        let signal =
            ChainSignal::parse(r#"{"ConfigID": 42, "Command": "START", "Ts": 1718000000}"#)
                .unwrap();
        assert_eq!(signal.chain_id, 42);
        assert_eq!(signal.command, SignalCommand::Start);
        assert_eq!(signal.ts, 1718000000);
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(ChainSignal::parse("not json").is_err());
        assert!(ChainSignal::parse(r#"{"ConfigID": 0, "Command": "STOP", "Ts": 1}"#).is_err());
        assert!(ChainSignal::parse(r#"{"ConfigID": 1, "Command": "PAUSE", "Ts": 1}"#).is_err());
        assert!(ChainSignal::parse(r#"{"Command": "START", "Ts": 1}"#).is_err());
    }

    #[test]
    fn test_dedup_suppresses_repeats() {
        let mut window = DedupWindow::new(100);
        assert!(window.insert("ch", "payload", 7));
        assert!(!window.insert("ch", "payload", 7));
        assert!(window.insert("ch", "payload", 8));
        assert!(window.insert("ch", "other", 7));
    }

    #[test]
    fn test_dedup_evicts_oldest_at_capacity() {
        let mut window = DedupWindow::new(2);
        assert!(window.insert("ch", "a", 1));
        assert!(window.insert("ch", "b", 1));
        assert!(window.insert("ch", "c", 1));
        // "a" fell out of the window, so it may be seen again
        assert!(window.insert("ch", "a", 1));
        assert!(!window.insert("ch", "c", 1));
    }
}
