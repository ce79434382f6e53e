//! Command-line surface of the daemon.
//!
//! All options live in grouped structs inside `timetable-core` so that the
//! configuration module can merge them with the YAML file; this wrapper only
//! adds the binary metadata clap needs.

use clap::Parser;
use timetable_core::CmdOptions;

/// Advanced task scheduler with PostgreSQL as the state of record
#[derive(Parser, Debug)]
#[command(name = "timetabled")]
#[command(about = "Advanced task scheduler with PostgreSQL as the state of record")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub options: CmdOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_grouped_flags() {
        let cli = Cli::try_parse_from([
            "timetabled",
            "--clientname",
            "worker01",
            "--host",
            "db.example.org",
            "-p",
            "6432",
            "--cron-workers",
            "4",
            "--rest-port",
            "8008",
            "--verbose",
        ])
        .unwrap();

        assert_eq!(cli.options.client_name.as_deref(), Some("worker01"));
        assert_eq!(cli.options.connection.host.as_deref(), Some("db.example.org"));
        assert_eq!(cli.options.connection.port, Some(6432));
        assert_eq!(cli.options.resources.cron_workers, Some(4));
        assert_eq!(cli.options.rest.rest_port, Some(8008));
        assert!(cli.options.verbose);
    }

    #[test]
    fn test_rejects_unknown_flag() {
        assert!(Cli::try_parse_from(["timetabled", "--no-such-flag"]).is_err());
    }
}
