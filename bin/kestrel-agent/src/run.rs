use std::{sync::Arc, time::Duration};

use kestrel_config::ConfigurationLoader;
use kestrel_core::{
    compactor::Compactor,
    election::{ElectionCoordinator, StaticElector},
    feeder::{Feeder, GlobalTags, LastErrors},
    filter::FilterEngine,
    pooling::PointPool,
    runtime::{CollectorRegistry, DrainError, ExitCoordinator},
};
use kestrel_error::{generic_error, ErrorContext as _, GenericError};
use kestrel_io::{
    dataway::{Dataway, DatawayElector},
    push::PushServer,
};
use rand::{distr::Alphanumeric, Rng as _};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    config::{AgentConfiguration, RunConfig},
    self_stats::SelfStatsCollector,
};

const ELECTION_NAMESPACE_TAG: &str = "election_namespace";

/// Loads configuration, wires the pipeline, and runs until ctrl-c.
pub async fn run(run_config: RunConfig) -> Result<(), GenericError> {
    info!(version = env!("CARGO_PKG_VERSION"), process_id = std::process::id(), "Kestrel agent starting...");

    let configuration = ConfigurationLoader::default()
        .try_from_yaml(&run_config.config)
        .from_environment("KESTREL")?
        .into_generic();
    let config = AgentConfiguration::from_configuration(&configuration)
        .error_context("Failed to load agent configuration.")?;

    let hostname = instance_id();
    let exit = ExitCoordinator::new();
    let pool = PointPool::new(config.pool_reserved_capacity);
    let last_errors = LastErrors::default();

    let dataway = Dataway::new(config.dataway.clone(), last_errors.clone())
        .error_context("Failed to create dataway client.")?;

    let mut election = if config.election.enabled {
        let endpoint = dataway
            .endpoints()
            .first()
            .cloned()
            .ok_or_else(|| generic_error!("Election is enabled but no dataway URL is configured."))?;
        info!(namespace = %config.election.namespace, id = %hostname, "Leader election enabled.");
        let elector = DatawayElector::new(
            dataway.http_client(),
            endpoint,
            config.election.namespace.as_str(),
            hostname.as_str(),
        )
        .with_default_interval(config.election.heartbeat_interval);
        ElectionCoordinator::new(elector).with_retry_interval(config.election.heartbeat_interval)
    } else {
        ElectionCoordinator::new(StaticElector::new(true, Duration::from_secs(60)))
    };

    let global_tags = if config.election.enabled {
        let mut election_tags = config.election.tags.clone();
        election_tags.insert(ELECTION_NAMESPACE_TAG.to_string(), config.election.namespace.clone());
        GlobalTags {
            host: config.global_host_tags.clone(),
            election: election_tags,
        }
    } else {
        GlobalTags {
            host: config.global_host_tags.clone(),
            election: config.global_host_tags.clone(),
        }
    };

    let (feeder, receivers) = Feeder::builder()
        .channel_size(config.feed_channel_size)
        .disabled_categories(config.disabled_categories.iter().copied())
        .global_tags(global_tags)
        .election(election.subscribe())
        .last_errors(last_errors.clone())
        .build(exit.signal());

    let filters = FilterEngine::from_config(&config.filters).error_context("Invalid filter configuration.")?;
    if !filters.is_empty() {
        info!(rules = config.filters.len(), "Filter rules loaded.");
    }

    let (transactions_tx, transactions_rx) = mpsc::channel(config.dataway.max_in_flight.max(1));
    let compactor = Compactor::new(
        config.compactor.clone(),
        pool.clone(),
        Arc::new(filters),
        last_errors.clone(),
        transactions_tx,
    );
    let compactor_stats = compactor.stats();

    dataway.spawn(transactions_rx, &exit);
    compactor.spawn(receivers, &exit);

    let mut registry = CollectorRegistry::new();
    registry.register(SelfStatsCollector::new(feeder.clone(), compactor_stats, hostname.clone()))?;
    registry.spawn(&feeder, &pool, &exit, &mut election);

    let election_guard = exit.register("election");
    tokio::spawn(async move {
        election.run(election_guard.signal()).await;
        drop(election_guard);
    });

    if config.push_enabled {
        let server = PushServer::new(config.push.clone(), feeder.clone(), pool.clone(), exit.signal());
        server.spawn(&exit).await.error_context("Failed to start push ingestion.")?;
    }

    info!("Kestrel agent started.");

    tokio::signal::ctrl_c()
        .await
        .error_context("Failed to listen for shutdown signal.")?;
    info!("Received shutdown signal. Draining...");

    exit.trigger();

    match exit.wait_for_drain(config.drain_timeout).await {
        Ok(()) => info!("Pipeline drained."),
        Err(DrainError::Timeout { pending, .. }) => {
            error!(?pending, "Shutdown deadline passed before every component drained.");
        }
    }

    let outstanding = last_errors.len();
    if outstanding > 0 {
        warn!(sources = outstanding, "Exiting with recorded errors.");
    }
    Ok(())
}

/// Identifies this instance for leader election and host tagging.
fn instance_id() -> String {
    match std::env::var("HOSTNAME") {
        Ok(hostname) if !hostname.is_empty() => hostname,
        _ => {
            let suffix = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect::<String>();
            format!("kestrel-{}", suffix.to_lowercase())
        }
    }
}
