//! Kestrel telemetry agent.
//!
//! Runs the ingestion pipeline: collectors and push ingestion feed points through per-category compaction into the
//! dataway upload client, optionally gated by leader election.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use kestrel_app::{
    logging::{fatal_and_exit, initialize_logging},
    tls::initialize_tls,
};
use tracing::{error, info};

mod config;
use self::config::{Action, Cli, RunConfig};

mod run;
use self::run::run;

mod self_stats;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(Some(cli.log_level())) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    if let Err(e) = initialize_tls() {
        fatal_and_exit(format!("failed to initialize TLS: {}", e));
    }

    // Without a subcommand, run with the default configuration path.
    let run_config = match cli.action {
        Some(Action::Run(config)) => config,
        None => RunConfig::default(),
    };

    match run(run_config).await {
        Ok(()) => info!("Kestrel agent stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}
