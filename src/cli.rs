//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Retrieve river gauge time series from national hydrological agencies.
///
/// Every series comes back in one canonical shape: ascending daily or
/// sub-daily UTC timestamps, a single value column, SI units.
#[derive(Parser, Debug)]
#[command(name = "hydrofetch")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Bulk cache directory (overrides HYDROFETCH_CACHE_DIR)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Directory of <provider>.json metadata snapshots (overrides HYDROFETCH_SNAPSHOT_DIR)
    #[arg(long, global = true)]
    pub snapshot_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered providers
    Providers,

    /// List the variables a provider serves
    Variables {
        /// Provider name
        provider: String,
    },

    /// Print a provider's station catalog
    Metadata {
        /// Provider name
        provider: String,

        /// Also write the catalog as a JSON snapshot to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Fetch one variable for one or more gauges, writing one CSV per gauge
    Fetch {
        /// Provider name
        provider: String,

        /// Variable identifier, e.g. discharge-daily-mean
        variable: String,

        /// Gauge identifiers
        #[arg(required = true)]
        gauges: Vec<String>,

        /// First day (YYYY-MM-DD); defaults to the provider's earliest date
        #[arg(long)]
        start: Option<String>,

        /// Last day (YYYY-MM-DD); defaults to today
        #[arg(long)]
        end: Option<String>,

        /// Directory receiving <provider>_<gauge>_<variable>.csv files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Maximum gauges fetched at once (1-100; overrides HYDROFETCH_CONCURRENCY)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
        concurrency: Option<u8>,
    },

    /// Download and index a provider's bulk archive
    BuildCache {
        /// Provider name
        provider: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["hydrofetch", "-v", "providers"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["hydrofetch", "providers", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["hydrofetch", "-q", "providers"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_subcommand_is_required() {
        let err = Args::try_parse_from(["hydrofetch"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn test_cli_fetch_parses_gauges_and_range() {
        let args = Args::try_parse_from([
            "hydrofetch",
            "fetch",
            "france",
            "discharge-daily-mean",
            "K001002010",
            "K002000101",
            "--start",
            "2020-01-01",
            "-c",
            "4",
        ])
        .unwrap();
        let Command::Fetch {
            provider,
            gauges,
            start,
            end,
            output_dir,
            concurrency,
            ..
        } = args.command
        else {
            panic!("expected fetch");
        };
        assert_eq!(provider, "france");
        assert_eq!(gauges.len(), 2);
        assert_eq!(start.as_deref(), Some("2020-01-01"));
        assert!(end.is_none());
        assert_eq!(output_dir, PathBuf::from("."));
        assert_eq!(concurrency, Some(4));
    }

    #[test]
    fn test_cli_fetch_requires_a_gauge() {
        let result = Args::try_parse_from(["hydrofetch", "fetch", "france", "discharge-daily-mean"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_concurrency_out_of_range() {
        for value in ["0", "101"] {
            let result = Args::try_parse_from([
                "hydrofetch",
                "fetch",
                "france",
                "discharge-daily-mean",
                "X",
                "-c",
                value,
            ]);
            assert!(result.is_err(), "{value} should be rejected");
        }
    }

    #[test]
    fn test_cli_metadata_save_path() {
        let args =
            Args::try_parse_from(["hydrofetch", "metadata", "norway", "--save", "out/no.json"])
                .unwrap();
        assert!(matches!(
            args.command,
            Command::Metadata { save: Some(ref p), .. } if p == &PathBuf::from("out/no.json")
        ));
    }
}
