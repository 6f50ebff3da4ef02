// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CRN Node Tooling
//!
//! Entry point for the `crn-node` binary. Parses CLI arguments, initializes
//! logging, and dispatches to a subcommand:
//!
//! - `create`       - generate a relay node identity
//! - `verify`       - check a domain signature
//! - `check-config` - validate a node config file
//! - `simulate`     - run a crawl network in process
//! - `version`      - print build version information

mod cli;
mod logging;
mod metrics;
mod simulation;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use crn_protocol::config::{CrnConfig, PROTOCOL_VERSION};
use crn_protocol::crypto::keys::{NodeKey, NodeKeypair};
use crn_protocol::crypto::signatures::verify_domain;
use crn_protocol::identity::NodeIdentity;
use crn_protocol::registry::EligibilityRegistry;

use cli::{Commands, CrnNodeCli};
use metrics::NodeMetrics;
use simulation::{Simulation, SimulationConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CrnNodeCli::parse();
    logging::init_logging("crn_node=info,crn_protocol=info", cli.log_format.into());

    match cli.command {
        Commands::Create(args) => create_identity(args),
        Commands::Verify(args) => verify_identity(args),
        Commands::CheckConfig(args) => check_config(args),
        Commands::Simulate(args) => simulate(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// What `create` prints. Holds the secret key; keep the output private.
#[derive(Serialize)]
struct CreatedIdentity {
    public_key: String,
    secret_key: String,
    domain: String,
    signature: String,
    account_id: String,
}

fn create_identity(args: cli::CreateArgs) -> Result<()> {
    let keypair = match args.secret_key.as_deref() {
        Some(secret) => NodeKeypair::from_hex(secret).context("invalid secret key")?,
        None => NodeKeypair::generate(),
    };
    anyhow::ensure!(!args.domain.is_empty(), "domain must not be empty");
    let identity = NodeIdentity::create(&keypair, &args.domain);

    tracing::info!(
        public_key = %identity.public_key(),
        domain = identity.domain(),
        "relay node identity created"
    );

    let out = CreatedIdentity {
        public_key: identity.public_key().to_string(),
        secret_key: keypair.to_hex(),
        domain: identity.domain().to_string(),
        signature: identity.domain_signature().to_string(),
        account_id: identity.account_id().to_string(),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn verify_identity(args: cli::VerifyArgs) -> Result<()> {
    let key = NodeKey::parse(&args.public_key).context("invalid public key")?;
    verify_domain(&key, &args.domain, &args.signature)
        .with_context(|| format!("signature does not match domain {}", args.domain))?;
    println!("valid");
    Ok(())
}

fn check_config(args: cli::CheckConfigArgs) -> Result<()> {
    let path = &args.config;
    let config = CrnConfig::load(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    let registry = EligibilityRegistry::from_entries(&config.trusted_keys)
        .context("trusted key list rejected")?;

    let identity = match config.relay_node.as_ref() {
        Some(relay) => Some(NodeIdentity::from_config(relay).context("relay node identity rejected")?),
        None => None,
    };

    println!("config ok: {}", path.display());
    println!("  reporting period  : {} ledgers", config.reporting_period);
    println!("  majority fraction : {}/256", config.majority_fraction);
    println!("  trusted keys      : {}", registry.len());
    match identity {
        Some(id) => println!("  relay node        : {} ({})", id.public_key(), id.domain()),
        None => println!("  relay node        : not configured"),
    }
    Ok(())
}

async fn simulate(args: cli::SimulateArgs) -> Result<()> {
    let metrics = NodeMetrics::new().context("failed to register metrics")?;
    let config = SimulationConfig {
        nodes: args.nodes,
        topology: args.topology,
        offline: args.offline,
        ledgers: args.ledgers,
        period: args.period,
        ledger_interval: Duration::from_millis(args.ledger_interval_ms),
    };
    let summary = Simulation::new(config, metrics.clone())?.run().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if args.metrics {
        print!("{}", metrics.encode()?);
    }
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("crn-node  {}", env!("CARGO_PKG_VERSION"));
    println!("protocol  {}", PROTOCOL_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn check_config_accepts_valid_identity() {
        let kp = NodeKeypair::generate();
        let id = NodeIdentity::create(&kp, "relay.example.com");
        let file = write_config(&format!(
            "reporting_period = 128\ntrusted_keys = [\"abc1 node-one\", \"def2\"]\n\n\
             [relay_node]\ndomain = \"{}\"\npublic_key = \"{}\"\nsignature = \"{}\"\n",
            id.domain(),
            id.public_key(),
            id.domain_signature()
        ));
        let args = cli::CheckConfigArgs {
            config: file.path().to_path_buf(),
        };
        assert!(check_config(args).is_ok());
    }

    #[test]
    fn check_config_rejects_bad_trust_list() {
        let file = write_config("trusted_keys = [\"abc1\", \"not-a-key!\"]\n");
        let args = cli::CheckConfigArgs {
            config: file.path().to_path_buf(),
        };
        assert!(check_config(args).is_err());
    }

    #[test]
    fn verify_round_trip() {
        let kp = NodeKeypair::generate();
        let id = NodeIdentity::create(&kp, "relay.example.com");
        let ok = cli::VerifyArgs {
            public_key: id.public_key().to_string(),
            domain: id.domain().to_string(),
            signature: id.domain_signature().to_string(),
        };
        assert!(verify_identity(ok).is_ok());

        let wrong_domain = cli::VerifyArgs {
            public_key: id.public_key().to_string(),
            domain: "other.example.com".into(),
            signature: id.domain_signature().to_string(),
        };
        assert!(verify_identity(wrong_domain).is_err());
    }
}
