//! Startup configuration.
//!
//! Options arrive on three layers: built-in defaults, the optional YAML
//! configuration file, and the command line (environment variables attach to
//! their flags). YAML overrides defaults, the command line overrides YAML.
//! The merged result is frozen into an immutable [`Config`] snapshot that the
//! rest of the daemon reads.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::error::{Error, Result};

/// Discoverer refetch interval, seconds
pub const REFETCH_TIMEOUT: u64 = 60;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 5432;
const DEFAULT_DBNAME: &str = "timetable";
const DEFAULT_USER: &str = "scheduler";
const DEFAULT_CONNECT_TIMEOUT: u64 = 90;
const DEFAULT_WORKERS: usize = 16;

/// Verbosity of the local log path
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything, including per-statement chatter
    Debug,
    /// Normal operation
    Info,
    /// Failures only
    Error,
}

/// Verbosity of the database log path; `none` disables shipping entirely
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbLogLevel {
    /// Everything
    Debug,
    /// Normal operation
    Info,
    /// Failures only
    Error,
    /// Do not ship log rows to the database
    None,
}

/// On-disk format of the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable text
    Text,
}

/// Connection SSL mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Plain TCP
    Disable,
    /// Require TLS
    Require,
}

/// Database connection options
#[derive(Debug, Clone, Default, Args)]
pub struct ConnectionOpts {
    /// PostgreSQL host
    #[arg(long, env = "PGTT_PGHOST")]
    pub host: Option<String>,
    /// PostgreSQL port
    #[arg(short = 'p', long, env = "PGTT_PGPORT")]
    pub port: Option<u16>,
    /// PostgreSQL database name
    #[arg(short = 'd', long, env = "PGTT_PGDATABASE")]
    pub dbname: Option<String>,
    /// PostgreSQL user
    #[arg(short = 'u', long, env = "PGTT_PGUSER")]
    pub user: Option<String>,
    /// PostgreSQL user password
    #[arg(long, env = "PGTT_PGPASSWORD")]
    pub password: Option<String>,
    /// Connection SSL mode
    #[arg(long, env = "PGTT_PGSSLMODE", value_enum)]
    pub sslmode: Option<SslMode>,
    /// PostgreSQL connection URL; overrides the individual connection fields
    #[arg(long, env = "PGTT_URL")]
    pub pgurl: Option<String>,
    /// PostgreSQL connection timeout, seconds
    #[arg(long, env = "PGTT_TIMEOUT")]
    pub timeout: Option<u64>,
}

/// Logging options
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingOpts {
    /// Verbosity level for stdout and the log file
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,
    /// Verbosity level for database storing
    #[arg(long, value_enum)]
    pub log_database_level: Option<DbLogLevel>,
    /// File name to store logs
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Format of file logs
    #[arg(long, value_enum)]
    pub log_file_format: Option<LogFormat>,
    /// Rotate log files daily
    #[arg(long)]
    pub log_file_rotate: bool,
}

/// Startup behavior options
#[derive(Debug, Clone, Default, Args)]
pub struct StartOpts {
    /// SQL script file to execute during startup
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,
    /// Initialize the database schema to the latest version and exit
    #[arg(long)]
    pub init: bool,
    /// Upgrade the database to the latest version
    #[arg(long)]
    pub upgrade: bool,
    /// Run in debug mode; only asynchronous chains will be executed
    #[arg(long)]
    pub debug: bool,
    /// YAML file with chains to import during startup
    #[arg(long)]
    pub import: Option<PathBuf>,
    /// Replace chains with the same name on import
    #[arg(long)]
    pub replace: bool,
}

/// Worker pool and deadline options
#[derive(Debug, Clone, Default, Args)]
pub struct ResourceOpts {
    /// Number of parallel workers for scheduled chains
    #[arg(long)]
    pub cron_workers: Option<usize>,
    /// Number of parallel workers for interval chains
    #[arg(long)]
    pub interval_workers: Option<usize>,
    /// Abort any chain that takes more than the specified number of milliseconds
    #[arg(long)]
    pub chain_timeout: Option<i64>,
    /// Abort any task within a chain that takes more than the specified number of milliseconds
    #[arg(long)]
    pub task_timeout: Option<i64>,
}

/// REST boundary options
#[derive(Debug, Clone, Default, Args)]
pub struct RestOpts {
    /// REST API port; 0 disables the HTTP boundary
    #[arg(long, env = "PGTT_RESTPORT")]
    pub rest_port: Option<u16>,
}

/// The full command-line surface, grouped the way `--help` presents it
#[derive(Debug, Clone, Default, Args)]
pub struct CmdOptions {
    /// Unique name for this daemon instance, used for work partitioning
    #[arg(short = 'c', long = "clientname", env = "PGTT_CLIENTNAME")]
    pub client_name: Option<String>,
    /// YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Disable executing of PROGRAM tasks
    #[arg(long, env = "PGTT_NOPROGRAMTASKS")]
    pub no_program_tasks: bool,
    /// Shorthand for --log-level debug
    #[arg(long, env = "PGTT_VERBOSE")]
    pub verbose: bool,
    #[command(flatten)]
    pub connection: ConnectionOpts,
    #[command(flatten)]
    pub logging: LoggingOpts,
    #[command(flatten)]
    pub start: StartOpts,
    #[command(flatten)]
    pub resources: ResourceOpts,
    #[command(flatten)]
    pub rest: RestOpts,
}

/// YAML configuration file contents; keys mirror the long flag names
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileOpts {
    /// Mirrors --clientname
    pub clientname: Option<String>,
    /// Mirrors --host
    pub host: Option<String>,
    /// Mirrors --port
    pub port: Option<u16>,
    /// Mirrors --dbname
    pub dbname: Option<String>,
    /// Mirrors --user
    pub user: Option<String>,
    /// Mirrors --password
    pub password: Option<String>,
    /// Mirrors --sslmode
    pub sslmode: Option<SslMode>,
    /// Mirrors --pgurl
    pub pgurl: Option<String>,
    /// Mirrors --timeout
    pub timeout: Option<u64>,
    /// Mirrors --log-level
    pub log_level: Option<LogLevel>,
    /// Mirrors --log-database-level
    pub log_database_level: Option<DbLogLevel>,
    /// Mirrors --log-file
    pub log_file: Option<PathBuf>,
    /// Mirrors --log-file-format
    pub log_file_format: Option<LogFormat>,
    /// Mirrors --log-file-rotate
    pub log_file_rotate: Option<bool>,
    /// Mirrors --file
    pub file: Option<PathBuf>,
    /// Mirrors --debug
    pub debug: Option<bool>,
    /// Mirrors --cron-workers
    pub cron_workers: Option<usize>,
    /// Mirrors --interval-workers
    pub interval_workers: Option<usize>,
    /// Mirrors --chain-timeout
    pub chain_timeout: Option<i64>,
    /// Mirrors --task-timeout
    pub task_timeout: Option<i64>,
    /// Mirrors --rest-port
    pub rest_port: Option<u16>,
    /// Mirrors --no-program-tasks
    pub no_program_tasks: Option<bool>,
}

/// Immutable configuration snapshot the daemon runs with
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// SSL mode
    pub sslmode: SslMode,
    /// Connection URL overriding the individual fields when present
    pub pgurl: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// This daemon's client name
    pub client_name: String,
    /// Cron worker pool size
    pub cron_workers: usize,
    /// Interval worker pool size
    pub interval_workers: usize,
    /// Global per-chain deadline in milliseconds, 0 = unbounded
    pub chain_timeout_ms: i64,
    /// Global per-task deadline in milliseconds, 0 = unbounded
    pub task_timeout_ms: i64,
    /// Local path verbosity
    pub log_level: LogLevel,
    /// Database path verbosity
    pub log_database_level: DbLogLevel,
    /// Optional log file
    pub log_file: Option<PathBuf>,
    /// Log file format
    pub log_file_format: LogFormat,
    /// Rotate the log file daily
    pub log_file_rotate: bool,
    /// One-shot SQL script executed during startup
    pub file: Option<PathBuf>,
    /// Migrate and exit
    pub init: bool,
    /// Allow schema upgrades
    pub upgrade: bool,
    /// Debug mode: only asynchronous chains execute
    pub debug: bool,
    /// Kill switch for PROGRAM tasks
    pub no_program_tasks: bool,
    /// REST port, 0 = disabled
    pub rest_port: u16,
    /// YAML chain import file
    pub import: Option<PathBuf>,
    /// Replace existing chains on import
    pub replace: bool,
}

impl Config {
    /// Merge command-line options with the YAML file (if any), apply defaults
    /// and validate. The command line wins over the file, the file over the
    /// defaults.
    pub fn resolve(opts: CmdOptions) -> Result<Config> {
        let file = match &opts.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read config file {}: {e}", path.display()))
                })?;
                serde_yaml::from_str::<FileOpts>(&text)
                    .map_err(|e| Error::Config(format!("malformed config file: {e}")))?
            }
            None => FileOpts::default(),
        };

        let client_name = opts
            .client_name
            .or(file.clientname)
            .ok_or_else(|| Error::Config("clientname is required".into()))?;
        if client_name.is_empty() {
            return Err(Error::Config("clientname must not be empty".into()));
        }

        let log_level = if opts.verbose {
            LogLevel::Debug
        } else {
            opts.logging.log_level.or(file.log_level).unwrap_or(LogLevel::Info)
        };

        Ok(Config {
            host: opts.connection.host.or(file.host).unwrap_or_else(|| DEFAULT_HOST.into()),
            port: opts.connection.port.or(file.port).unwrap_or(DEFAULT_PORT),
            dbname: opts.connection.dbname.or(file.dbname).unwrap_or_else(|| DEFAULT_DBNAME.into()),
            user: opts.connection.user.or(file.user).unwrap_or_else(|| DEFAULT_USER.into()),
            password: opts.connection.password.or(file.password).unwrap_or_default(),
            sslmode: opts.connection.sslmode.or(file.sslmode).unwrap_or(SslMode::Disable),
            pgurl: opts.connection.pgurl.or(file.pgurl),
            connect_timeout: Duration::from_secs(
                opts.connection.timeout.or(file.timeout).unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ),
            client_name,
            cron_workers: opts
                .resources
                .cron_workers
                .or(file.cron_workers)
                .unwrap_or(DEFAULT_WORKERS),
            interval_workers: opts
                .resources
                .interval_workers
                .or(file.interval_workers)
                .unwrap_or(DEFAULT_WORKERS),
            chain_timeout_ms: opts.resources.chain_timeout.or(file.chain_timeout).unwrap_or(0),
            task_timeout_ms: opts.resources.task_timeout.or(file.task_timeout).unwrap_or(0),
            log_level,
            log_database_level: opts
                .logging
                .log_database_level
                .or(file.log_database_level)
                .unwrap_or(DbLogLevel::Info),
            log_file: opts.logging.log_file.or(file.log_file),
            log_file_format: opts
                .logging
                .log_file_format
                .or(file.log_file_format)
                .unwrap_or(LogFormat::Json),
            log_file_rotate: opts.logging.log_file_rotate || file.log_file_rotate.unwrap_or(false),
            file: opts.start.file.or(file.file),
            init: opts.start.init,
            upgrade: opts.start.upgrade,
            debug: opts.start.debug || file.debug.unwrap_or(false),
            no_program_tasks: opts.no_program_tasks || file.no_program_tasks.unwrap_or(false),
            rest_port: opts.rest.rest_port.or(file.rest_port).unwrap_or(0),
            import: opts.start.import,
            replace: opts.start.replace,
        })
    }

    /// Connection options for the state-of-record database.
    ///
    /// `pgurl` takes precedence over the individual fields when set.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let options = match &self.pgurl {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| Error::Config(format!("invalid pgurl: {e}")))?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .database(&self.dbname)
                .username(&self.user)
                .password(&self.password)
                .ssl_mode(match self.sslmode {
                    SslMode::Disable => PgSslMode::Disable,
                    SslMode::Require => PgSslMode::Require,
                }),
        };
        Ok(options.application_name("timetabled"))
    }

    /// Pool size: every worker plus the listener and one spare can hold a
    /// connection at the same time.
    pub fn pool_size(&self) -> u32 {
        (self.cron_workers + self.interval_workers + 2) as u32
    }

    /// Default directive for the stdout/file tracing filter
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_with_client() -> CmdOptions {
        CmdOptions {
            client_name: Some("worker01".into()),
            ..CmdOptions::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::resolve(opts_with_client()).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "timetable");
        assert_eq!(config.user, "scheduler");
        assert_eq!(config.cron_workers, 16);
        assert_eq!(config.interval_workers, 16);
        assert_eq!(config.chain_timeout_ms, 0);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_database_level, DbLogLevel::Info);
        assert_eq!(config.log_file_format, LogFormat::Json);
        assert_eq!(config.rest_port, 0);
        assert_eq!(config.pool_size(), 34);
    }

    #[test]
    fn test_clientname_required() {
        let err = Config::resolve(CmdOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("clientname"));
    }

    #[test]
    fn test_verbose_forces_debug_level() {
        let mut opts = opts_with_client();
        opts.verbose = true;
        opts.logging.log_level = Some(LogLevel::Error);
        let config = Config::resolve(opts).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "clientname: from-file\nhost: db.example.org\nport: 6432\ncron-workers: 4\n",
        )
        .unwrap();

        let mut opts = CmdOptions::default();
        opts.config = Some(path);
        opts.connection.port = Some(7777);

        let config = Config::resolve(opts).unwrap();
        // CLI port wins, file fills the rest
        assert_eq!(config.port, 7777);
        assert_eq!(config.host, "db.example.org");
        assert_eq!(config.client_name, "from-file");
        assert_eq!(config.cron_workers, 4);
    }

    #[test]
    fn test_malformed_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: [not, a, number]\n").unwrap();

        let mut opts = opts_with_client();
        opts.config = Some(path);
        let err = Config::resolve(opts).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_connect_options_from_fields() {
        let mut opts = opts_with_client();
        opts.connection.host = Some("db1".into());
        opts.connection.user = Some("cron".into());
        let config = Config::resolve(opts).unwrap();
        assert!(config.connect_options().is_ok());
    }

    #[test]
    fn test_connect_options_bad_url() {
        let mut opts = opts_with_client();
        opts.connection.pgurl = Some("not a url at all ::".into());
        let config = Config::resolve(opts).unwrap();
        assert!(config.connect_options().is_err());
    }
}
