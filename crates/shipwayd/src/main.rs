//! Shipway daemon.
//!
//! Opens a durable store, watches tracked branches on the engine event
//! bus, and drives every head update through the pipeline. Optionally
//! forwards each engine event as JSON to a webhook URL.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};

use shipway_core::{
    init_tracing, EngineConfig, EventBus, InstanceManager, NoopDeployer, RevisionStore,
    SurrealStore, METRICS,
};
use shipway_pipeline::{CommandStageExecutor, Orchestrator, RunConfig, RunDriver, TrackedBranch};

#[derive(Parser)]
#[command(name = "shipwayd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shipway orchestration daemon", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Database URL (surrealkv://<path> for a durable store)
    #[arg(long, env = "SHIPWAY_DB", default_value = "surrealkv://shipway.db")]
    db: String,

    /// Tracked branch bound to an instance, as `branch=instance-id`.
    /// Repeat for each branch.
    #[arg(short = 't', long = "track", value_parser = parse_tracked)]
    tracked: Vec<TrackedBranchArg>,

    /// Concurrent runs allowed per branch
    #[arg(long, env = "SHIPWAY_BRANCH_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Webhook URL to forward engine events to
    #[arg(long, env = "SHIPWAY_WEBHOOK")]
    webhook: Option<String>,

    /// Workspace the build/test commands run in
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
}

#[derive(Debug, Clone)]
struct TrackedBranchArg {
    branch: String,
    instance_id: String,
}

fn parse_tracked(s: &str) -> Result<TrackedBranchArg, String> {
    match s.split_once('=') {
        Some((branch, instance_id)) if !branch.is_empty() && !instance_id.is_empty() => {
            Ok(TrackedBranchArg {
                branch: branch.to_string(),
                instance_id: instance_id.to_string(),
            })
        }
        _ => Err(format!("expected branch=instance-id, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(args.json, level);

    let mut config = EngineConfig::from_env();
    config.db_url = args.db.clone();
    if let Some(concurrency) = args.concurrency {
        config.branch_concurrency = concurrency;
    }
    if args.webhook.is_some() {
        config.webhook = args.webhook.clone();
    }

    if args.tracked.is_empty() {
        anyhow::bail!("no tracked branches; pass at least one --track branch=instance-id");
    }

    info!(db = %config.db_url, tracked = args.tracked.len(), "shipwayd starting");

    let store = Arc::new(
        SurrealStore::connect(&config.db_url)
            .await
            .context("Failed to open Shipway store")?,
    );
    let bus = EventBus::new();

    // The revision store is opened for its side effects (clock seeding)
    // and to serve library callers; the daemon itself reacts to bus
    // events published by whichever process lands commits.
    let _revisions = RevisionStore::open(Arc::clone(&store), bus.clone()).await?;

    let manager = Arc::new(InstanceManager::new(
        Arc::clone(&store),
        Arc::clone(&store),
        bus.clone(),
        Arc::new(NoopDeployer),
    ));
    let executor = Arc::new(CommandStageExecutor::new(
        config.build_command.clone(),
        config.test_command.clone(),
        args.workspace,
    ));
    let driver = Arc::new(RunDriver::new(
        Arc::clone(&store),
        manager,
        executor,
        bus.clone(),
        RunConfig::from_engine(&config),
    ));

    let tracked: Vec<TrackedBranch> = args
        .tracked
        .into_iter()
        .map(|t| TrackedBranch {
            branch: t.branch,
            instance_id: t.instance_id,
        })
        .collect();
    let mut orchestrator = Orchestrator::new(driver, tracked, config.branch_concurrency);
    orchestrator.attach(&bus);

    let forwarder = config
        .webhook
        .clone()
        .map(|url| tokio::spawn(forward_events(bus.subscribe(), url)));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining runs");

    orchestrator.shutdown().await;
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    METRICS.flush();
    Ok(())
}

/// Forward each engine event to the webhook as a JSON POST.
/// Delivery is best-effort; failures are logged and skipped.
async fn forward_events(mut rx: broadcast::Receiver<shipway_core::EngineEvent>, url: String) {
    let client = reqwest::Client::new();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = client.post(&url).json(&event).send().await {
                    warn!(url = %url, error = %e, "webhook delivery failed");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "webhook forwarder lagged behind the event bus");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_branch_parses() {
        let t = parse_tracked("main=web-1").unwrap();
        assert_eq!(t.branch, "main");
        assert_eq!(t.instance_id, "web-1");
    }

    #[test]
    fn test_tracked_branch_rejects_malformed() {
        assert!(parse_tracked("main").is_err());
        assert!(parse_tracked("=web-1").is_err());
        assert!(parse_tracked("main=").is_err());
    }

    #[tokio::test]
    async fn test_daemon_wiring_over_memory_store() {
        let store = Arc::new(SurrealStore::in_memory().await.unwrap());
        let bus = EventBus::new();
        let manager = Arc::new(InstanceManager::new(
            Arc::clone(&store),
            Arc::clone(&store),
            bus.clone(),
            Arc::new(NoopDeployer),
        ));
        let executor = Arc::new(CommandStageExecutor::new(
            "true".to_string(),
            "true".to_string(),
            PathBuf::from("."),
        ));
        let driver = Arc::new(RunDriver::new(
            Arc::clone(&store),
            manager,
            executor,
            bus.clone(),
            RunConfig::default(),
        ));

        let mut orchestrator = Orchestrator::new(
            driver,
            vec![TrackedBranch {
                branch: "main".to_string(),
                instance_id: "web-1".to_string(),
            }],
            1,
        );
        orchestrator.attach(&bus);
        orchestrator.shutdown().await;
    }
}
