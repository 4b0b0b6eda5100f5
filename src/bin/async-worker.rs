//! # Async Worker
//!
//! Command-line entry point for a worker process.
//!
//! ```bash
//! async-worker --config config/tasker-async.toml check
//! async-worker --config config/tasker-async.toml consume
//! async-worker send --target Logger --method info '"hello"'
//! ```
//!
//! Application targets are registered by binaries built on the library; this
//! one only knows the `Logger` target, which is enough to smoke-test a
//! deployment end to end.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use tasker_async::cache::{CacheProvider, CacheService};
use tasker_async::logging::init_structured_logging;
use tasker_async::messaging::{BrokerProvider, BrokerSession, MessageBroker};
use tasker_async::task::TaskCodec;
use tasker_async::{
    Arg, AsyncConfig, ConfigLoader, Consumer, Dispatcher, RetryController, RunOptions, TargetError,
    TargetRegistry, TaskTarget,
};

#[derive(Parser)]
#[command(name = "async-worker")]
#[command(about = "Consume and dispatch deferred method calls")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file (defaults to TASKER_ASYNC_CONFIG_PATH)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Queue to use instead of the configured one
    #[arg(short, long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and check broker and side-store connectivity
    Check,

    /// Consume tasks until Ctrl-C
    Consume,

    /// Publish one task
    Send {
        #[arg(short, long, default_value = "Logger")]
        target: String,

        #[arg(short, long, default_value = "info")]
        method: String,

        /// Positional arguments as JSON values
        args: Vec<String>,
    },
}

/// Writes its arguments to the log
#[derive(Debug, Default, Serialize, Deserialize)]
struct Logger {
    prefix: Option<String>,
}

#[async_trait]
impl TaskTarget for Logger {
    const TYPE_NAME: &'static str = "Logger";
    const METHODS: &'static [&'static str] = &["info", "warn"];

    fn construct(instance_args: &[Value]) -> Result<Self, TargetError> {
        Ok(Self {
            prefix: instance_args
                .first()
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn call(&mut self, method: &str, args: Vec<Value>) -> Result<(), TargetError> {
        let prefix = self.prefix.as_deref().unwrap_or("task");
        match method {
            "info" => info!(prefix, args = ?args, "Logger task"),
            "warn" => warn!(prefix, args = ?args, "Logger task"),
            other => return Err(TargetError::known(format!("unsupported method {}", other))),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_structured_logging();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "async-worker failed");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load(Some(path.as_path())),
        None => ConfigLoader::load_from_env(),
    }
    .context("loading configuration")?;
    if let Some(queue) = cli.queue {
        config.queue.name = queue;
    }

    let broker = BrokerProvider::from_config(&config.broker)?;
    let cache = Arc::new(
        CacheProvider::from_config(&config.cache)
            .await
            .context("connecting side-store")?,
    );
    let codec = TaskCodec::from_config(Arc::clone(&cache), &config.cache)?;

    if !matches!(cli.command, Commands::Check) {
        cache.warn_if_process_local();
    }

    match cli.command {
        Commands::Check => check(&config, &broker, &cache).await,
        Commands::Consume => consume(&config, broker, codec).await,
        Commands::Send {
            target,
            method,
            args,
        } => {
            let args = args
                .iter()
                .map(|raw| serde_json::from_str::<Value>(raw).map(Arg::from))
                .collect::<Result<Vec<_>, _>>()
                .context("arguments must be JSON values")?;

            let mut dispatcher = Dispatcher::from_config(broker, codec, &config);
            dispatcher
                .try_run(target.as_str(), &method, args, RunOptions::new())
                .await?;
            info!(
                target_type = %target,
                method = %method,
                queue_name = %config.queue.name,
                "Task sent"
            );
            Ok(())
        }
    }
}

async fn check(
    config: &AsyncConfig,
    broker: &BrokerProvider,
    cache: &CacheProvider,
) -> anyhow::Result<()> {
    let session = broker.connect().await.context("connecting broker")?;
    session.close_quietly().await;

    let healthy = cache.health_check().await.context("checking side-store")?;
    if !healthy {
        anyhow::bail!("side-store '{}' is unhealthy", cache.provider_name());
    }

    info!(
        broker = broker.provider_name(),
        broker_url = %config.broker.redacted_url(),
        side_store = cache.provider_name(),
        queue_name = %config.queue.name,
        retry_mode = %config.retry.mode,
        "Configuration and connectivity OK"
    );
    Ok(())
}

async fn consume(
    config: &AsyncConfig,
    broker: BrokerProvider,
    codec: TaskCodec<CacheProvider>,
) -> anyhow::Result<()> {
    let registry = TargetRegistry::new();
    registry.register::<Logger>();

    let consumer = Consumer::new(
        broker,
        codec,
        registry,
        RetryController::from_config(&config.retry),
    );

    let handled = consumer
        .consume_until(&config.queue.name, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!(handled, "Worker stopped");
    Ok(())
}
