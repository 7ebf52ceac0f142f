use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use clap::{ArgAction, Args, Parser, Subcommand};
use kestrel_config::GenericConfiguration;
use kestrel_core::{
    compactor::{
        CompactorConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_GZIP_MIN_SIZE, DEFAULT_MAX_CACHE_COUNT,
        DEFAULT_MAX_RAW_BODY_SIZE,
    },
    filter::FilterRuleConfig,
    point::Category,
};
use kestrel_error::{ErrorContext as _, GenericError};
use kestrel_io::{
    dataway::{DatawayConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_IN_FLIGHT, DEFAULT_REQUEST_TIMEOUT},
    push::{Naming, PushConfig, DEFAULT_MAX_BODY_SIZE},
};
use tracing::level_filters::LevelFilter;

/// Configuration file read when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kestrel/kestrel.yaml";

/// Command-line interface.
#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Option<Action>,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Action {
    /// Runs the agent.
    #[command(name = "run")]
    Run(RunConfig),
}

/// Run configuration.
#[derive(Args, Clone, Debug)]
pub struct RunConfig {
    /// Path to the configuration file.
    ///
    /// Missing files are ignored; every setting can also come from `KESTREL_`-prefixed environment variables.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

/// Leader election settings.
#[derive(Clone, Debug)]
pub struct ElectionSettings {
    /// Whether this instance campaigns for leadership.
    pub enabled: bool,

    /// Election namespace, also added to election-scoped points as `election_namespace`.
    pub namespace: String,

    /// Tags added to election-scoped points.
    pub tags: BTreeMap<String, String>,

    /// Campaign and heartbeat cadence.
    pub heartbeat_interval: Duration,
}

/// Agent configuration, mapped from the loaded configuration by key.
#[derive(Clone, Debug)]
pub struct AgentConfiguration {
    /// Upload client settings.
    pub dataway: DatawayConfig,

    /// Buffering and flush settings.
    pub compactor: CompactorConfig,

    /// Capacity of each per-category feed queue.
    pub feed_channel_size: usize,

    /// Number of free point buffers the pool keeps.
    pub pool_reserved_capacity: usize,

    /// Categories the feeder refuses.
    pub disabled_categories: Vec<Category>,

    /// Tags added to points that are not election-scoped.
    pub global_host_tags: BTreeMap<String, String>,

    /// Leader election settings.
    pub election: ElectionSettings,

    /// Filter rules, in evaluation order.
    pub filters: Vec<FilterRuleConfig>,

    /// Whether the push ingestion server runs.
    pub push_enabled: bool,

    /// Push ingestion server settings.
    pub push: PushConfig,

    /// How long shutdown waits for the pipeline to drain.
    pub drain_timeout: Duration,
}

impl AgentConfiguration {
    /// Maps the agent settings out of `config`.
    ///
    /// # Errors
    ///
    /// If a setting is present but has the wrong type, or cannot be parsed, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        // Each key is queried individually so that `KESTREL_DATAWAY_URLS` can stand in for `dataway.urls`.
        let dataway = DatawayConfig {
            urls: config.try_get_typed("dataway.urls")?.unwrap_or_default(),
            request_timeout: secs(config, "dataway.request_timeout_secs")?.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_attempts: config
                .try_get_typed("dataway.max_retry_count")?
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_base: millis(config, "dataway.retry_backoff_base_ms")?.unwrap_or(Duration::from_secs(1)),
            backoff_max: millis(config, "dataway.retry_backoff_max_ms")?.unwrap_or(Duration::from_secs(30)),
            max_raw_body_size: config
                .try_get_typed("dataway.max_raw_body_size")?
                .unwrap_or(DEFAULT_MAX_RAW_BODY_SIZE),
            max_in_flight: config
                .try_get_typed("dataway.max_in_flight")?
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            ..Default::default()
        };

        let compactor = CompactorConfig {
            max_cache_count: config
                .try_get_typed("io.max_cache_count")?
                .unwrap_or(DEFAULT_MAX_CACHE_COUNT),
            flush_interval: secs(config, "io.flush_interval_secs")?.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            workers: config.try_get_typed("io.flush_workers")?.unwrap_or(1),
            max_raw_body_size: dataway.max_raw_body_size,
            gzip_min_size: config
                .try_get_typed("dataway.gzip_min_size")?
                .unwrap_or(DEFAULT_GZIP_MIN_SIZE),
        };

        let disabled_categories = config
            .try_get_typed::<Vec<String>>("io.disabled_categories")?
            .unwrap_or_default()
            .iter()
            .map(|name| name.parse::<Category>())
            .collect::<Result<Vec<_>, _>>()
            .error_context("Invalid entry in 'io.disabled_categories'.")?;

        let election = ElectionSettings {
            enabled: config.try_get_typed("election.enable")?.unwrap_or(false),
            namespace: config
                .try_get_typed("election.namespace")?
                .unwrap_or_else(|| "default".to_string()),
            tags: config.try_get_typed("election.tags")?.unwrap_or_default(),
            heartbeat_interval: secs(config, "election.heartbeat_interval_secs")?.unwrap_or(Duration::from_secs(3)),
        };

        let listen_address = match config.try_get_typed::<String>("push.listen_address")? {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .with_error_context(|| format!("Invalid 'push.listen_address' value '{}'.", raw))?,
            None => PushConfig::default().listen_address,
        };
        let push = PushConfig {
            listen_address,
            prefix: config.try_get_typed("push.prefix")?.unwrap_or_default(),
            naming: Naming {
                measurement_prefix: config.try_get_typed("push.measurement_prefix")?,
                measurement_name: config.try_get_typed("push.measurement_name")?,
            },
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        };

        Ok(Self {
            dataway,
            compactor,
            feed_channel_size: config.try_get_typed("io.feed_channel_size")?.unwrap_or(128),
            pool_reserved_capacity: config.try_get_typed("io.pool_reserved_capacity")?.unwrap_or(64),
            disabled_categories,
            global_host_tags: config.try_get_typed("global_host_tags")?.unwrap_or_default(),
            election,
            filters: config.try_get_typed("filters")?.unwrap_or_default(),
            push_enabled: config.try_get_typed("push.enable")?.unwrap_or(true),
            push,
            drain_timeout: secs(config, "shutdown.drain_timeout_secs")?.unwrap_or(Duration::from_secs(30)),
        })
    }
}

fn secs(config: &GenericConfiguration, key: &str) -> Result<Option<Duration>, GenericError> {
    Ok(config.try_get_typed::<u64>(key)?.map(Duration::from_secs))
}

fn millis(config: &GenericConfiguration, key: &str) -> Result<Option<Duration>, GenericError> {
    Ok(config.try_get_typed::<u64>(key)?.map(Duration::from_millis))
}
