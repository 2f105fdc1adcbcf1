//! # CLI Interface
//!
//! Command-line argument structure for `stepswap-node` using `clap`
//! derive. Three subcommands: `relay` (run the broker-side relay
//! server), `init` (generate an overlay identity), and `version`.
//!
//! Every configurable value has a corresponding environment variable so
//! container deployments don't need a wall of flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// stepswap relay node.
///
/// Runs the broker-side relay server of the stepswap marketplace and
/// ships the operator tooling around it.
#[derive(Parser, Debug)]
#[command(
    name = "stepswap-node",
    about = "stepswap broker relay node",
    version,
    propagate_version = true
)]
pub struct NodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server.
    Relay(RelayArgs),
    /// Initialize a node identity — generates a fresh keypair and
    /// prints the derived overlay id.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `relay` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RelayArgs {
    /// Bind address for the relay listener.
    #[arg(long, env = "STEPSWAP_RELAY_ADDR", default_value = "0.0.0.0:9340")]
    pub bind_addr: String,

    /// Bind address for the Prometheus metrics endpoint.
    #[arg(long, env = "STEPSWAP_METRICS_ADDR", default_value = "0.0.0.0:9342")]
    pub metrics_addr: String,

    /// Log verbosity level: trace, debug, info, warn, error.
    #[arg(long, env = "STEPSWAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, env = "STEPSWAP_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Directory the identity key is written to.
    #[arg(long, short = 'd', env = "STEPSWAP_DATA_DIR", default_value = "~/.stepswap")]
    pub data_dir: PathBuf,

    /// Overwrite an existing identity. Destroys the previous keypair.
    #[arg(long)]
    pub force: bool,
}

/// Resolves a data directory path, expanding a leading `~` to the
/// user's home directory.
pub fn resolve_data_dir(path: &std::path::Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if path_str.starts_with("~/") || path_str == "~" {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(path_str.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        NodeCli::command().debug_assert();
    }

    #[test]
    fn relay_subcommand_defaults() {
        let args = NodeCli::parse_from(["stepswap-node", "relay"]);
        match args.command {
            Commands::Relay(relay) => {
                assert_eq!(relay.bind_addr, "0.0.0.0:9340");
                assert_eq!(relay.metrics_addr, "0.0.0.0:9342");
                assert_eq!(relay.log_level, "info");
                assert_eq!(relay.log_format, "pretty");
            }
            _ => panic!("expected Relay subcommand"),
        }
    }

    #[test]
    fn relay_subcommand_custom_addresses() {
        let args = NodeCli::parse_from([
            "stepswap-node",
            "relay",
            "--bind-addr",
            "127.0.0.1:8080",
            "--metrics-addr",
            "127.0.0.1:8081",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ]);
        match args.command {
            Commands::Relay(relay) => {
                assert_eq!(relay.bind_addr, "127.0.0.1:8080");
                assert_eq!(relay.metrics_addr, "127.0.0.1:8081");
                assert_eq!(relay.log_level, "debug");
                assert_eq!(relay.log_format, "json");
            }
            _ => panic!("expected Relay subcommand"),
        }
    }

    #[test]
    fn init_subcommand_defaults() {
        let args = NodeCli::parse_from(["stepswap-node", "init"]);
        match args.command {
            Commands::Init(init) => {
                assert!(!init.force);
                assert_eq!(init.data_dir, PathBuf::from("~/.stepswap"));
            }
            _ => panic!("expected Init subcommand"),
        }
    }

    #[test]
    fn version_subcommand_parses() {
        let args = NodeCli::parse_from(["stepswap-node", "version"]);
        assert!(matches!(args.command, Commands::Version));
    }

    #[test]
    fn resolve_data_dir_expands_tilde() {
        let resolved = resolve_data_dir(&PathBuf::from("~/.stepswap"));
        assert!(
            !resolved.to_string_lossy().starts_with('~'),
            "tilde should have been expanded: {:?}",
            resolved
        );
    }

    #[test]
    fn resolve_data_dir_absolute_unchanged() {
        let path = PathBuf::from("/tmp/stepswap-data");
        assert_eq!(resolve_data_dir(&path), path);
    }
}
