//! # Logging
//!
//! `crn-node` logs through `tracing` to stderr. Stdout belongs to the
//! subcommands: `create` prints the new identity as JSON, `simulate` prints
//! the run summary as JSON (and the Prometheus dump after it with
//! `--metrics`), so both can be piped straight into `jq`.
//!
//! Crawl hops are logged by `crn_protocol::crawl` at `debug` (each forward
//! and backtrack) and `trace` (acks, timer arming). Timeouts and malformed
//! payloads come out at `warn`, so the default filter already shows every
//! peer a crawl had to skip.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogFormatArg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One line per event, target included so crawl and tally lines can be
    /// told apart.
    Pretty,
    /// JSON lines, for collecting simulation logs next to the summary.
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`;
/// to follow a single walk hop by hop:
///
/// ```text
/// RUST_LOG=crn_node=info,crn_protocol::crawl=trace crn-node simulate --nodes 4
/// ```
pub fn init_logging(default_filter: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .init(),
    }

    tracing::debug!(?format, "logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::CrnNodeCli;

    #[test]
    fn log_format_is_global() {
        let cli = CrnNodeCli::try_parse_from(["crn-node", "simulate", "--log-format", "json"]).unwrap();
        assert_eq!(LogFormat::from(cli.log_format), LogFormat::Json);

        let cli = CrnNodeCli::try_parse_from(["crn-node", "version"]).unwrap();
        assert_eq!(LogFormat::from(cli.log_format), LogFormat::Pretty);
    }
}
