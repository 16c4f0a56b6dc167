//! Shipway - CI/CD orchestration CLI
//!
//! The `shipway` command is the operator surface over the engine.
//!
//! ## Commands
//!
//! - `init`: Initialize the store with a root commit and `main` branch
//! - `commit`: Append a commit to a branch and advance its head
//! - `branch`: Create, update, list, or delete branches
//! - `log`: Show commit history, newest first
//! - `run`: Trigger, inspect, cancel, or roll back pipeline runs
//! - `instance`: Register and manage deployable instances

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

use shipway_core::{
    init_tracing, CommitMeta, EngineConfig, EventBus, InstanceManager, NoopDeployer,
    RevisionStore, SurrealStore, UpdateMode,
};
use shipway_pipeline::{CommandStageExecutor, RunConfig, RunDriver};
use shipway_state::storage_traits::RunLedger;
use shipway_state::{CommitId, RunId};

#[derive(Parser)]
#[command(name = "shipway")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shipway CI/CD orchestration engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Database URL (mem:// or surrealkv://<path>)
    #[arg(long, global = true, env = "SHIPWAY_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store with a root commit and a main branch
    Init,

    /// Append a commit to a branch and fast-forward its head
    Commit {
        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Author name
        #[arg(short, long, default_value = "shipway")]
        author: String,

        /// Branch to commit to (created at the new commit if missing)
        #[arg(short, long, default_value = "main")]
        branch: String,
    },

    /// Manage branches
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Show commit history, newest first
    Log {
        /// Branch to show history for
        #[arg(default_value = "main")]
        branch: String,

        /// Maximum number of commits to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Pipeline run operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Instance operations
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },
}

#[derive(Subcommand)]
enum BranchAction {
    /// List all branches
    List,

    /// Create a new branch
    Create {
        /// Branch name
        name: String,

        /// Starting point (commit ID or branch name)
        #[arg(short, long, default_value = "main")]
        from: String,
    },

    /// Move a branch head to a commit (fast-forward unless --force)
    Update {
        /// Branch name
        name: String,

        /// New head (commit ID or branch name)
        commit: String,

        /// Skip the fast-forward check
        #[arg(long)]
        force: bool,
    },

    /// Delete a branch (its commits remain)
    Delete {
        /// Branch name
        name: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Drive a commit through build/test/deploy, with retries
    Trigger {
        /// Branch the run belongs to
        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Instance to deploy to
        #[arg(short, long)]
        instance: String,

        /// Commit to run (default: branch head)
        #[arg(short, long)]
        commit: Option<String>,

        /// Workspace the build/test commands run in
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },

    /// Show a run with its stage results
    Show {
        /// Run ID
        run_id: String,
    },

    /// List runs, newest first
    List {
        /// Only runs for this branch
        #[arg(short, long)]
        branch: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cancel a running pipeline run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Roll back a failed run's deployment
    Rollback {
        /// Run ID
        run_id: String,

        /// Instance the run deployed to
        #[arg(short, long)]
        instance: String,
    },
}

#[derive(Subcommand)]
enum InstanceAction {
    /// Register a new deployable instance
    Register {
        /// Project the instance belongs to
        project: String,
    },

    /// List all instances
    List,

    /// Show one instance
    Show {
        /// Instance ID
        instance_id: String,
    },

    /// Deploy a commit to an instance
    Deploy {
        /// Instance ID
        instance_id: String,

        /// Commit ID or branch name
        commit: String,
    },

    /// Roll an instance back to its prior successful deployment
    Rollback {
        /// Instance ID
        instance_id: String,
    },

    /// Show an instance's deployment history
    History {
        /// Instance ID
        instance_id: String,
    },
}

/// Fully wired engine over one store connection.
struct Engine {
    store: Arc<SurrealStore>,
    revisions: RevisionStore<SurrealStore>,
    manager: Arc<InstanceManager<SurrealStore, SurrealStore>>,
    bus: EventBus,
    config: EngineConfig,
}

impl Engine {
    async fn connect(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(
            SurrealStore::connect(&config.db_url)
                .await
                .context("Failed to connect to Shipway database")?,
        );
        let bus = EventBus::new();
        let revisions = RevisionStore::open(Arc::clone(&store), bus.clone()).await?;
        let manager = Arc::new(InstanceManager::new(
            Arc::clone(&store),
            Arc::clone(&store),
            bus.clone(),
            Arc::new(NoopDeployer),
        ));
        Ok(Self {
            store,
            revisions,
            manager,
            bus,
            config,
        })
    }

    fn driver(&self, workspace: PathBuf) -> RunDriver<SurrealStore, SurrealStore, SurrealStore> {
        let executor = Arc::new(CommandStageExecutor::new(
            self.config.build_command.clone(),
            self.config.test_command.clone(),
            workspace,
        ));
        RunDriver::new(
            Arc::clone(&self.store),
            Arc::clone(&self.manager),
            executor,
            self.bus.clone(),
            RunConfig::from_engine(&self.config),
        )
    }

    /// Resolve a reference as a branch name first, then as a commit id.
    async fn resolve(&self, reference: &str) -> Result<CommitId> {
        if let Ok(branch) = self.revisions.get_branch(reference).await {
            return Ok(branch.head);
        }
        CommitId::try_from(reference.to_string())
            .with_context(|| format!("Not a branch or commit: {reference}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = EngineConfig::from_env();
    if let Some(db) = cli.db {
        config.db_url = db;
    }
    let engine = Engine::connect(config).await?;

    match cli.command {
        Commands::Init => cmd_init(&engine).await,
        Commands::Commit {
            message,
            author,
            branch,
        } => cmd_commit(&engine, &message, &author, &branch).await,
        Commands::Branch { action } => match action {
            BranchAction::List => cmd_branch_list(&engine).await,
            BranchAction::Create { name, from } => cmd_branch_create(&engine, &name, &from).await,
            BranchAction::Update {
                name,
                commit,
                force,
            } => cmd_branch_update(&engine, &name, &commit, force).await,
            BranchAction::Delete { name } => cmd_branch_delete(&engine, &name).await,
        },
        Commands::Log { branch, limit } => cmd_log(&engine, &branch, limit).await,
        Commands::Run { action } => match action {
            RunAction::Trigger {
                branch,
                instance,
                commit,
                workspace,
            } => cmd_run_trigger(&engine, &branch, &instance, commit.as_deref(), workspace).await,
            RunAction::Show { run_id } => cmd_run_show(&engine, &run_id).await,
            RunAction::List { branch, limit } => {
                cmd_run_list(&engine, branch.as_deref(), limit).await
            }
            RunAction::Cancel { run_id } => cmd_run_cancel(&engine, &run_id).await,
            RunAction::Rollback { run_id, instance } => {
                cmd_run_rollback(&engine, &run_id, &instance).await
            }
        },
        Commands::Instance { action } => match action {
            InstanceAction::Register { project } => cmd_instance_register(&engine, &project).await,
            InstanceAction::List => cmd_instance_list(&engine).await,
            InstanceAction::Show { instance_id } => cmd_instance_show(&engine, &instance_id).await,
            InstanceAction::Deploy {
                instance_id,
                commit,
            } => cmd_instance_deploy(&engine, &instance_id, &commit).await,
            InstanceAction::Rollback { instance_id } => {
                cmd_instance_rollback(&engine, &instance_id).await
            }
            InstanceAction::History { instance_id } => {
                cmd_instance_history(&engine, &instance_id).await
            }
        },
    }
}

/// Initialize the store with a root commit and a main branch
async fn cmd_init(engine: &Engine) -> Result<()> {
    if let Ok(branch) = engine.revisions.get_branch("main").await {
        println!("Already initialized (main -> {})", branch.head.short());
        return Ok(());
    }

    let root = engine
        .revisions
        .add_commit(
            &[],
            CommitMeta {
                author: "system".to_string(),
                message: "Initial commit".to_string(),
            },
        )
        .await?;
    engine.revisions.create_branch("main", &root.id).await?;

    println!("Initialized Shipway store ({})", engine.config.db_url);
    println!("Initial commit: {}", root.id.short());
    Ok(())
}

/// Append a commit and advance the branch head
async fn cmd_commit(engine: &Engine, message: &str, author: &str, branch: &str) -> Result<()> {
    let parent = engine.revisions.get_branch(branch).await.ok();
    let parents: Vec<CommitId> = parent.iter().map(|b| b.head.clone()).collect();

    let commit = engine
        .revisions
        .add_commit(
            &parents,
            CommitMeta {
                author: author.to_string(),
                message: message.to_string(),
            },
        )
        .await?;

    match parent {
        Some(_) => {
            engine
                .revisions
                .update_branch(branch, &commit.id, UpdateMode::FastForward)
                .await?;
        }
        None => {
            engine.revisions.create_branch(branch, &commit.id).await?;
        }
    }

    println!("[{}] {} ({})", branch, message, commit.id.short());
    Ok(())
}

/// List all branches
async fn cmd_branch_list(engine: &Engine) -> Result<()> {
    let branches = engine.revisions.list_branches().await?;
    if branches.is_empty() {
        println!("No branches found. Run 'shipway init' first.");
        return Ok(());
    }
    for branch in branches {
        println!("  {} -> {}", branch.name, branch.head.short());
    }
    Ok(())
}

/// Create a new branch
async fn cmd_branch_create(engine: &Engine, name: &str, from: &str) -> Result<()> {
    let head = engine.resolve(from).await?;
    let branch = engine.revisions.create_branch(name, &head).await?;
    println!("Created branch {} at {}", branch.name, branch.head.short());
    Ok(())
}

/// Move a branch head
async fn cmd_branch_update(engine: &Engine, name: &str, commit: &str, force: bool) -> Result<()> {
    let new_head = engine.resolve(commit).await?;
    let mode = if force {
        UpdateMode::Force
    } else {
        UpdateMode::FastForward
    };
    let branch = engine.revisions.update_branch(name, &new_head, mode).await?;
    println!("Updated {} -> {}", branch.name, branch.head.short());
    Ok(())
}

/// Delete a branch
async fn cmd_branch_delete(engine: &Engine, name: &str) -> Result<()> {
    engine.revisions.delete_branch(name).await?;
    println!("Deleted branch {name}");
    Ok(())
}

/// Show commit history, newest first
async fn cmd_log(engine: &Engine, branch: &str, limit: usize) -> Result<()> {
    let mut walk = engine.revisions.history(branch).await?;
    let mut shown = 0usize;
    while shown < limit {
        let Some(commit) = walk.next().await? else { break };
        println!(
            "{} {} <{}> {}",
            commit.id.short(),
            commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
            commit.author,
            commit.message
        );
        shown += 1;
    }
    if shown == 0 {
        println!("No commits on {branch}");
    }
    Ok(())
}

/// Drive a commit through the pipeline with retries
async fn cmd_run_trigger(
    engine: &Engine,
    branch: &str,
    instance_id: &str,
    commit: Option<&str>,
    workspace: PathBuf,
) -> Result<()> {
    let commit_id = match commit {
        Some(reference) => engine.resolve(reference).await?,
        None => engine.revisions.get_branch(branch).await?.head,
    };

    info!(branch, commit = commit_id.short(), instance_id, "triggering run");
    let driver = engine.driver(workspace);
    let run_id = driver
        .run_with_retries(branch, &commit_id, instance_id)
        .await?;

    println!("Run {} succeeded ({} -> {})", run_id, commit_id.short(), instance_id);
    Ok(())
}

/// Show a run with its stage results as JSON
async fn cmd_run_show(engine: &Engine, run_id: &str) -> Result<()> {
    let run_id = RunId(run_id.to_string());
    let run = engine.store.get_run(&run_id).await?;
    let stages = engine.store.get_stage_results(&run_id).await?;

    let detail = serde_json::json!({
        "run": run,
        "stages": stages,
    });
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

/// List runs, newest first
async fn cmd_run_list(engine: &Engine, branch: Option<&str>, limit: usize) -> Result<()> {
    let runs = engine.store.list_runs(branch).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs.into_iter().take(limit) {
        println!(
            "{} [{}] {:?} attempt {} ({})",
            run.run_id,
            run.branch,
            run.status,
            run.attempt,
            run.commit_id.short()
        );
    }
    Ok(())
}

/// Cancel a running run via the ledger.
///
/// Works across processes: the driver's ledger transitions fail once the
/// run leaves `Running`, so the in-flight pipeline aborts before its next
/// stage lands.
async fn cmd_run_cancel(engine: &Engine, run_id: &str) -> Result<()> {
    let run_id = RunId(run_id.to_string());
    engine
        .store
        .fail_run(&run_id, Some("cancelled by user".to_string()))
        .await
        .with_context(|| format!("Cannot cancel run {run_id}"))?;
    println!("Cancelled run {run_id}");
    Ok(())
}

/// Roll back a failed run's deployment
async fn cmd_run_rollback(engine: &Engine, run_id: &str, instance_id: &str) -> Result<()> {
    let run_id = RunId(run_id.to_string());
    let driver = engine.driver(PathBuf::from("."));
    let target = driver.rollback_run(&run_id, instance_id).await?;
    println!("Rolled back {} to {}", instance_id, target.short());
    Ok(())
}

/// Register a new instance
async fn cmd_instance_register(engine: &Engine, project: &str) -> Result<()> {
    let instance = engine.manager.register(project).await?;
    println!("Registered instance {} ({})", instance.instance_id, project);
    Ok(())
}

/// List all instances
async fn cmd_instance_list(engine: &Engine) -> Result<()> {
    let instances = engine.manager.list().await?;
    if instances.is_empty() {
        println!("No instances registered");
        return Ok(());
    }
    for instance in instances {
        let deployed = instance
            .deployed
            .as_ref()
            .map(|c| c.short().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} [{}] deployed={} health={:?}",
            instance.instance_id, instance.project_id, deployed, instance.health
        );
    }
    Ok(())
}

/// Show one instance as JSON
async fn cmd_instance_show(engine: &Engine, instance_id: &str) -> Result<()> {
    let instance = engine.manager.get(instance_id).await?;
    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}

/// Deploy a commit to an instance
async fn cmd_instance_deploy(engine: &Engine, instance_id: &str, commit: &str) -> Result<()> {
    let commit_id = engine.resolve(commit).await?;
    engine.manager.deploy(instance_id, &commit_id).await?;
    println!("Deployed {} to {}", commit_id.short(), instance_id);
    Ok(())
}

/// Roll an instance back to its prior successful deployment
async fn cmd_instance_rollback(engine: &Engine, instance_id: &str) -> Result<()> {
    let target = engine.manager.rollback(instance_id).await?;
    println!("Rolled back {} to {}", instance_id, target.short());
    Ok(())
}

/// Show an instance's deployment history
async fn cmd_instance_history(engine: &Engine, instance_id: &str) -> Result<()> {
    let entries = engine.manager.history(instance_id).await?;
    if entries.is_empty() {
        println!("No deployments for {instance_id}");
        return Ok(());
    }
    for entry in entries {
        let status = if entry.success { "ok" } else { "failed" };
        println!(
            "#{} {:?} {} {} ({})",
            entry.seq,
            entry.kind,
            entry.commit_id.short(),
            status,
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
