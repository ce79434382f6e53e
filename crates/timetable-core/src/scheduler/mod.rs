//! Chain scheduling and execution.
//!
//! The scheduler turns rows of `timetable.chain` into running work, fed by
//! four sources:
//!
//! - **Cron chains**: due chains picked up by the minute poll
//! - **Interval chains**: `@every` / `@after` chains driven by timer tasks
//! - **Boot chains**: `@reboot` chains dispatched once per connection
//! - **Operator signals**: START/STOP requests over `LISTEN/NOTIFY`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   tickets    ┌──────────────┐
//! │    Engine    │ ───────────► │ worker pools │
//! │  discovery   │              │ cron/interval│
//! └──────┬───────┘              └──────┬───────┘
//!        │ LISTEN/NOTIFY              │ per ticket
//!        ▼                            ▼
//! ┌──────────────┐              ┌──────────────┐
//! │   Gateway    │ ◄──────────  │ ChainRunner  │
//! │  PostgreSQL  │  run status  │ admission,   │
//! └──────────────┘              │ task loop    │
//!                               └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use timetable_core::scheduler::{Engine, RunOutcome};
//!
//! let engine = Engine::new(gateway, config).with_sink_health(health);
//! match engine.run(shutdown.clone()).await? {
//!     RunOutcome::ConnectionLost => { /* reconnect, then run again */ }
//!     RunOutcome::Terminated => { /* clean shutdown */ }
//! }
//! ```

mod builtins;
mod chain;
mod engine;
mod interval;
mod task;
mod types;

pub use engine::{ActiveRegistry, Engine};
pub use types::RunOutcome;
