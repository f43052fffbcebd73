use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::command;
use crate::config::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "maxima-pool")]
#[command(about = "Runs Maxima scripts for STACK against prebuilt Maxima snapshots")]
pub struct Cli {
    /// Configuration file (default: /etc/maxima-pool/config.yaml, then ./config.yaml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Same as `snapshots build`
    #[arg(long, hide = true)]
    create_snapshots: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve jobs over HTTP (default)
    Serve,

    /// Manage Maxima snapshots
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Run a script file against a snapshot and print the result
    Run {
        /// Maxima script to execute
        file: PathBuf,

        /// Snapshot version (default: the newest)
        #[arg(long = "version", value_name = "VERSION")]
        snapshot: Option<String>,

        /// Time limit in milliseconds, capped by job.timeout_ms
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,

        /// Value bound to URL_BASE in the script
        #[arg(long, value_name = "URL")]
        plot_url_base: Option<String>,

        /// Write the result here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Rebuild every snapshot from the STACK repository's release tags
    Build,
    /// List registered snapshots, oldest first
    List,
}

pub fn run(cli: Cli, config: &Config) -> Result<()> {
    if cli.create_snapshots {
        return command::snapshots::build(config);
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => command::serve::run(config),
        Commands::Snapshots { command: action } => match action {
            SnapshotCommands::Build => command::snapshots::build(config),
            SnapshotCommands::List => command::snapshots::list(config),
        },
        Commands::Run {
            file,
            snapshot,
            timeout,
            plot_url_base,
            output,
        } => command::run::run(
            config,
            &file,
            snapshot,
            timeout,
            plot_url_base,
            output.as_deref(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["maxima-pool"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.create_snapshots);
    }

    #[test]
    fn legacy_flag_is_accepted() {
        let cli = Cli::try_parse_from(["maxima-pool", "--create-snapshots"]).unwrap();
        assert!(cli.create_snapshots);
    }

    #[test]
    fn config_is_global() {
        let cli =
            Cli::try_parse_from(["maxima-pool", "snapshots", "list", "--config", "/etc/p.yaml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/p.yaml")));
        assert!(matches!(
            cli.command,
            Some(Commands::Snapshots {
                command: SnapshotCommands::List
            })
        ));
    }

    #[test]
    fn run_takes_overrides() {
        let cli = Cli::try_parse_from([
            "maxima-pool",
            "run",
            "job.mac",
            "--version",
            "2023121100",
            "--timeout",
            "5000",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run {
                file,
                snapshot,
                timeout,
                ..
            }) => {
                assert_eq!(file, PathBuf::from("job.mac"));
                assert_eq!(snapshot.as_deref(), Some("2023121100"));
                assert_eq!(timeout, Some(5000));
            }
            _ => panic!("expected run"),
        }
    }
}
