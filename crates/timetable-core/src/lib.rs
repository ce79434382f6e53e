//! Timetable Core - Scheduling Engine
//!
//! This crate provides the core of the `timetabled` daemon, a task scheduler
//! whose state of record is PostgreSQL:
//! - Config: layered startup configuration (defaults, YAML file, CLI, env)
//! - Cron: reference schedule parser backing import validation and tests
//! - Db: connection gateway, schema migrator, queries and operator signals
//! - Logsink: tracing setup plus log shipping into `timetable.log`
//! - Scheduler: chain discovery, worker pools and task execution
//! - Yaml: declarative chain import

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod logsink;
pub mod scheduler;
pub mod yaml;

pub use config::{CmdOptions, Config};
pub use db::{Gateway, SchemaState};
pub use error::{Error, Result};
pub use logsink::{spawn_db_flusher, Logging, SinkHealth};
pub use scheduler::{ActiveRegistry, Engine, RunOutcome};
pub use yaml::ChainFile;
