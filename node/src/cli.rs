//! # CLI Interface
//!
//! Defines the command-line argument structure for `crn-node` using
//! `clap` derive. Subcommands: `create`, `verify`, `check-config`,
//! `simulate` and `version`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Relay node tooling.
///
/// Creates and verifies relay node identities, validates node
/// configuration, and runs whole-network crawl simulations in process.
#[derive(Parser, Debug)]
#[command(
    name = "crn-node",
    about = "Relay node crawl and eligibility tooling",
    version,
    propagate_version = true
)]
pub struct CrnNodeCli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a keypair and sign a domain, printing the identity as JSON.
    Create(CreateArgs),
    /// Check a domain signature against a public key.
    Verify(VerifyArgs),
    /// Load a node config file and validate it, trust list included.
    CheckConfig(CheckConfigArgs),
    /// Run an in-process network of relay nodes over simulated ledgers.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Domain the relay node claims.
    #[arg(long)]
    pub domain: String,

    /// Hex-encoded Ed25519 secret key. A fresh key is generated when omitted.
    #[arg(long, env = "CRN_SECRET_KEY")]
    pub secret_key: Option<String>,
}

#[derive(Parser, Debug)]
pub struct VerifyArgs {
    #[arg(long)]
    pub public_key: String,

    #[arg(long)]
    pub domain: String,

    /// Hex-encoded domain signature.
    #[arg(long)]
    pub signature: String,
}

#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Path to the node configuration file (TOML).
    #[arg(long, short = 'c', env = "CRN_CONFIG")]
    pub config: PathBuf,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of relay nodes.
    #[arg(long, default_value_t = 5)]
    pub nodes: usize,

    #[arg(long, value_enum, default_value_t = Topology::Line)]
    pub topology: Topology,

    /// How many nodes (taken from the end) never answer.
    #[arg(long, default_value_t = 0)]
    pub offline: usize,

    /// Number of ledgers to validate.
    #[arg(long, default_value_t = 24)]
    pub ledgers: u32,

    /// Ledgers per reporting period.
    #[arg(long, default_value_t = 8)]
    pub period: u32,

    /// Wall-clock time per simulated ledger, milliseconds.
    #[arg(long, default_value_t = 200)]
    pub ledger_interval_ms: u64,

    /// Print the Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Overlay shape for the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Topology {
    Line,
    Ring,
    Mesh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}
